//! `InMemoryDocumentStore`: backend en memoria sobre `DashMap`.
//!
//! Una transacción toma el lock de escritura del shard que contiene el
//! documento mientras corre el closure (síncrono), así que dos transacciones
//! sobre el mismo documento se serializan. Las notificaciones se publican
//! después de soltar el lock.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::{ChangeEvent, ChangeFeed, Clock, DocumentStore, SystemClock, Transaction};
use crate::errors::StoreError;
use crate::model::{DocumentRef, Fields};

#[derive(Debug)]
pub struct InMemoryDocumentStore {
    docs: DashMap<DocumentRef, Fields>,
    feed: ChangeFeed,
    clock: Arc<dyn Clock>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { docs: DashMap::new(),
               feed: ChangeFeed::default(),
               clock }
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed = ChangeFeed::new(capacity);
        self
    }

    /// Copia síncrona del documento (útil en tests y diagnósticos).
    pub fn snapshot(&self, doc: &DocumentRef) -> Option<Fields> {
        self.docs.get(doc).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn create(&self, doc: &DocumentRef, fields: Fields) -> Result<(), StoreError> {
        match self.docs.entry(doc.clone()) {
            Entry::Occupied(_) => return Err(StoreError::AlreadyExists(doc.path())),
            Entry::Vacant(v) => {
                v.insert(fields.clone());
            }
        }
        self.feed.publish(ChangeEvent::Created { doc: doc.clone(),
                                                 snapshot: fields });
        Ok(())
    }

    async fn get(&self, doc: &DocumentRef) -> Result<Option<Fields>, StoreError> {
        Ok(self.snapshot(doc))
    }

    async fn merge_write(&self, doc: &DocumentRef, fields: Fields) -> Result<(), StoreError> {
        self.run_transaction(doc, move |tx: &mut Transaction| {
                tx.merge(fields.clone());
                Ok::<(), StoreError>(())
            })
            .await
    }

    async fn run_transaction<T, E, F>(&self, doc: &DocumentRef, mut f: F) -> Result<T, E>
        where T: Send + 'static,
              E: From<StoreError> + Send + 'static,
              F: FnMut(&mut Transaction) -> Result<T, E> + Send + 'static
    {
        let now = self.clock.now();
        let (out, change) = match self.docs.entry(doc.clone()) {
            Entry::Occupied(mut entry) => {
                let mut tx = Transaction::new(Some(entry.get().clone()), now);
                let out = f(&mut tx)?;
                let change = tx.commit(doc)?;
                if let Some((_, after)) = &change {
                    *entry.get_mut() = after.clone();
                }
                (out, change)
            }
            Entry::Vacant(_) => {
                let mut tx = Transaction::new(None, now);
                let out = f(&mut tx)?;
                (out, tx.commit(doc)?)
            }
        };
        if let Some((before, after)) = change {
            self.feed.publish(ChangeEvent::Updated { doc: doc.clone(),
                                                     before,
                                                     after });
        }
        Ok(out)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}
