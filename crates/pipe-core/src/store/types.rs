//! Trait `DocumentStore`, transacciones y eventos de cambio.
//!
//! Rol en el flujo:
//! - El coordinator sólo muta documentos vía `merge_write` o
//!   `run_transaction`; nunca hace read-modify-write fuera de una
//!   transacción.
//! - Cada escritura confirmada produce un `ChangeEvent` en el feed del store.
//!   La entrega es at-least-once: puede haber duplicados y eventos cuyo
//!   contenido ya no coincide con el estado actual.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::errors::StoreError;
use crate::merge::merge_fields;
use crate::model::{DocumentRef, Fields};

/// Notificación emitida tras una escritura confirmada.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Created { doc: DocumentRef, snapshot: Fields },
    Updated { doc: DocumentRef, before: Fields, after: Fields },
}

impl ChangeEvent {
    pub fn doc(&self) -> &DocumentRef {
        match self {
            ChangeEvent::Created { doc, .. } | ChangeEvent::Updated { doc, .. } => doc,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Created { .. } => "created",
            ChangeEvent::Updated { .. } => "updated",
        }
    }
}

/// Vista de una transacción sobre un único documento.
///
/// El closure de `run_transaction` lee el snapshot y acumula writes con
/// `merge`. Los writes sólo se aplican si el closure devuelve `Ok`.
#[derive(Debug)]
pub struct Transaction {
    snapshot: Option<Fields>,
    now: DateTime<Utc>,
    writes: Option<Fields>,
}

impl Transaction {
    pub fn new(snapshot: Option<Fields>, now: DateTime<Utc>) -> Self {
        Self { snapshot,
               now,
               writes: None }
    }

    /// Estado del documento al inicio de la transacción (`None` si no existe).
    pub fn snapshot(&self) -> Option<&Fields> {
        self.snapshot.as_ref()
    }

    /// Tiempo de la transacción según el reloj del store.
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn merge(&mut self, patch: Fields) {
        merge_fields(self.writes.get_or_insert_with(Fields::new), patch);
    }

    pub fn has_writes(&self) -> bool {
        self.writes.is_some()
    }

    /// Calcula el par `(before, after)` a persistir. `Ok(None)` si no hubo
    /// writes. Escribir sobre un documento inexistente es `NotFound`.
    pub fn commit(self, doc: &DocumentRef) -> Result<Option<(Fields, Fields)>, StoreError> {
        match (self.snapshot, self.writes) {
            (_, None) => Ok(None),
            (None, Some(_)) => Err(StoreError::NotFound(doc.path())),
            (Some(before), Some(patch)) => {
                let mut after = before.clone();
                merge_fields(&mut after, patch);
                Ok(Some((before, after)))
            }
        }
    }
}

/// Capacidades del document store que usa el motor.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Tiempo "de servidor" (mismo reloj que las transacciones).
    fn now(&self) -> DateTime<Utc>;

    /// Crea el documento y emite `ChangeEvent::Created`.
    async fn create(&self, doc: &DocumentRef, fields: Fields) -> Result<(), StoreError>;

    async fn get(&self, doc: &DocumentRef) -> Result<Option<Fields>, StoreError>;

    /// Merge shallow de `fields` sobre el documento existente.
    async fn merge_write(&self, doc: &DocumentRef, fields: Fields) -> Result<(), StoreError>;

    /// Ejecuta `f` de forma atómica respecto a otros writers del documento.
    /// Un backend puede re-ejecutar `f` ante conflictos, por eso es `FnMut`.
    async fn run_transaction<T, E, F>(&self, doc: &DocumentRef, f: F) -> Result<T, E>
        where T: Send + 'static,
              E: From<StoreError> + Send + 'static,
              F: FnMut(&mut Transaction) -> Result<T, E> + Send + 'static;

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
