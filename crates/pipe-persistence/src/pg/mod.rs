//! Implementación Postgres (Diesel) del `DocumentStore`.
//!
//! - Un documento es una fila de `pipeline_documents` con sus campos en una
//!   columna JSONB; la clave es `DocumentRef::path()`.
//! - `run_transaction` abre una transacción read-write, bloquea la fila con
//!   `SELECT ... FOR UPDATE`, ejecuta el closure sobre el snapshot y escribe
//!   el merge resultante. Los conflictos de serialización se reintentan.
//! - Diesel es síncrono: todo el acceso a DB corre en
//!   `tokio::task::spawn_blocking`.
//! - Los `ChangeEvent` se publican en un feed en proceso tras cada commit.
//!   Escrituras hechas por otros procesos no generan eventos aquí; para eso
//!   está `pending_documents` + `PipelineCoordinator::drive`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager};
use diesel::sql_types::Bool;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use pipe_core::{ChangeEvent, ChangeFeed, DocumentRef, DocumentStore, Fields, StoreError, Transaction};

use crate::error::PersistenceError;
use crate::migrations::run_pending_migrations;
use crate::schema::pipeline_documents;

/// Mismo predicado que el índice parcial `pipeline_documents_pending_idx`.
const PENDING_PREDICATE: &str = "(fields -> 'processing_completed_at' IS NULL \
                                 OR fields -> 'processing_completed_at' = 'null'::jsonb)";

/// Alias de tipo para el pool r2d2 de conexiones Postgres.
pub type PgPool = r2d2::Pool<ConnectionManager<PgConnection>>;

/// Proveedor abstracto de conexiones.
///
/// Permite inyectar un pool real o, en tests, cualquier otra fuente de
/// conexiones sin acoplar el store a r2d2.
pub trait ConnectionProvider: Send + Sync + 'static {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError>;
}

/// Implementación concreta de `ConnectionProvider` respaldada por un `PgPool`.
pub struct PoolProvider {
    pub pool: PgPool,
}

impl ConnectionProvider for PoolProvider {
    fn connection(&self) -> Result<r2d2::PooledConnection<ConnectionManager<PgConnection>>, PersistenceError> {
        self.pool
            .get()
            .map_err(|e| PersistenceError::TransientIo(format!("pool error: {e}")))
    }
}

#[derive(Insertable, Debug)]
#[diesel(table_name = pipeline_documents)]
pub struct NewDocumentRow<'a> {
    pub path: &'a str,
    pub collection: &'a str,
    pub document_id: &'a str,
    pub parent_id: Option<&'a str>,
    pub fields: &'a Value,
}

#[derive(Queryable, Debug)]
pub struct DocumentRow {
    pub path: String,
    pub collection: String,
    pub document_id: String,
    pub parent_id: Option<String>,
    pub fields: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRow {
    pub fn document_ref(&self) -> DocumentRef {
        DocumentRef { collection: self.collection.clone(),
                      id: self.document_id.clone(),
                      parent_id: self.parent_id.clone() }
    }
}

/// Error de una transacción: fallo de DB (reintentable o no) o error propio
/// del closure, que aborta sin reintentar.
enum TxError<E> {
    Db(PersistenceError),
    Aborted(E),
}

impl<E> From<diesel::result::Error> for TxError<E> {
    fn from(e: diesel::result::Error) -> Self {
        TxError::Db(e.into())
    }
}

trait Retryable {
    fn retryable(&self) -> bool;
}

impl Retryable for PersistenceError {
    fn retryable(&self) -> bool {
        self.is_retryable()
    }
}

impl<E> Retryable for TxError<E> {
    fn retryable(&self) -> bool {
        matches!(self, TxError::Db(e) if e.is_retryable())
    }
}

const MAX_RETRIES: u32 = 3;

/// Retry simple con backoff lineal muy pequeño (15ms, 30ms, 45ms).
fn with_retry<F, T, E>(mut f: F) -> Result<T, E>
    where F: FnMut() -> Result<T, E>,
          E: Retryable
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if e.retryable() && attempts < MAX_RETRIES => {
                let delay_ms = 15 * u64::from(attempts + 1);
                warn!("retryable database error (attempt {}) -> sleeping {delay_ms}ms", attempts + 1);
                std::thread::sleep(std::time::Duration::from_millis(delay_ms));
                attempts += 1;
            }
            r => return r,
        }
    }
}

fn decode_fields(path: &str, value: Value) -> Result<Fields, PersistenceError> {
    match value {
        Value::Object(fields) => Ok(fields),
        other => Err(PersistenceError::Codec(format!("{path}: {other}"))),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
    where F: FnOnce() -> Result<T, StoreError> + Send + 'static,
          T: Send + 'static
{
    tokio::task::spawn_blocking(f).await
                                  .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
}

/// `DocumentStore` sobre Postgres.
pub struct PgDocumentStore<P: ConnectionProvider> {
    provider: Arc<P>,
    feed: ChangeFeed,
}

impl<P: ConnectionProvider> PgDocumentStore<P> {
    pub fn new(provider: P) -> Self {
        Self { provider: Arc::new(provider),
               feed: ChangeFeed::default() }
    }

    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed = ChangeFeed::new(capacity);
        self
    }

    /// Documentos de `collection` sin estado terminal, en orden de creación.
    pub async fn pending_documents(&self, collection: &str) -> Result<Vec<DocumentRef>, StoreError> {
        let provider = Arc::clone(&self.provider);
        let collection = collection.to_string();
        blocking(move || {
            let rows: Vec<DocumentRow> = with_retry(|| {
                let mut conn = provider.connection()?;
                pipeline_documents::table.filter(pipeline_documents::collection.eq(&collection))
                                         .filter(sql::<Bool>(PENDING_PREDICATE))
                                         .order(pipeline_documents::created_at.asc())
                                         .load::<DocumentRow>(&mut conn)
                                         .map_err(PersistenceError::from)
            })?;
            Ok(rows.into_iter().map(|row| row.document_ref()).collect())
        }).await
    }
}

#[async_trait]
impl<P: ConnectionProvider> DocumentStore for PgDocumentStore<P> {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn create(&self, doc: &DocumentRef, fields: Fields) -> Result<(), StoreError> {
        let provider = Arc::clone(&self.provider);
        let target = doc.clone();
        let snapshot = fields.clone();
        blocking(move || {
            let path = target.path();
            let value = Value::Object(fields);
            with_retry(|| {
                let mut conn = provider.connection()?;
                diesel::insert_into(pipeline_documents::table).values(NewDocumentRow { path: &path,
                                                                                       collection: &target.collection,
                                                                                       document_id: &target.id,
                                                                                       parent_id: target.parent_id.as_deref(),
                                                                                       fields: &value })
                                                              .execute(&mut conn)
                                                              .map_err(PersistenceError::from)
            }).map_err(|e| match e {
                  PersistenceError::UniqueViolation(_) => StoreError::AlreadyExists(path.clone()),
                  other => other.into(),
              })?;
            Ok(())
        }).await?;
        debug!("created {doc}");
        self.feed.publish(ChangeEvent::Created { doc: doc.clone(),
                                                 snapshot });
        Ok(())
    }

    async fn get(&self, doc: &DocumentRef) -> Result<Option<Fields>, StoreError> {
        let provider = Arc::clone(&self.provider);
        let path = doc.path();
        blocking(move || {
            let row: Option<Value> = with_retry(|| {
                let mut conn = provider.connection()?;
                pipeline_documents::table.find(&path)
                                         .select(pipeline_documents::fields)
                                         .first::<Value>(&mut conn)
                                         .optional()
                                         .map_err(PersistenceError::from)
            })?;
            row.map(|value| decode_fields(&path, value)).transpose().map_err(StoreError::from)
        }).await
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
        let provider = Arc::clone(&self.provider);
        let target = doc.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let path = target.path();
            with_retry(|| {
                let mut conn = provider.connection().map_err(TxError::Db)?;
                conn.build_transaction().read_write().run(|c| {
                    let snapshot = pipeline_documents::table.find(&path)
                                                            .select(pipeline_documents::fields)
                                                            .for_update()
                                                            .first::<Value>(c)
                                                            .optional()?
                                                            .map(|v| decode_fields(&path, v))
                                                            .transpose()
                                                            .map_err(TxError::Db)?;
                    let mut tx = Transaction::new(snapshot, Utc::now());
                    let out = f(&mut tx).map_err(TxError::Aborted)?;
                    let change = tx.commit(&target).map_err(|e| TxError::Aborted(E::from(e)))?;
                    if let Some((_, after)) = &change {
                        diesel::update(pipeline_documents::table.find(&path))
                            .set((pipeline_documents::fields.eq(Value::Object(after.clone())),
                                  pipeline_documents::updated_at.eq(Utc::now())))
                            .execute(c)?;
                    }
                    Ok((out, change))
                })
            })
        }).await;

        let (out, change) = match joined {
            Ok(Ok(done)) => done,
            Ok(Err(TxError::Aborted(e))) => return Err(e),
            Ok(Err(TxError::Db(e))) => return Err(E::from(StoreError::from(e))),
            Err(e) => return Err(E::from(StoreError::Unavailable(format!("blocking task failed: {e}")))),
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

/// Construye un pool Postgres r2d2 a partir de URL y corre las migraciones
/// pendientes.
///
/// Si `min_size > max_size` se usa `min_size = max_size`.
pub fn build_pool(database_url: &str, min_size: u32, max_size: u32) -> Result<PgPool, PersistenceError> {
    let validated_min = min_size.max(1);
    let validated_max = max_size.max(1);
    if validated_min > validated_max {
        warn!("min_size > max_size ({validated_min} > {validated_max}), using min=max");
    }
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    let pool = r2d2::Pool::builder().min_idle(Some(validated_min.min(validated_max)))
                                    .max_size(validated_max)
                                    .build(manager)
                                    .map_err(|e| PersistenceError::TransientIo(format!("pool build: {e}")))?;
    {
        let mut conn = pool.get()
                           .map_err(|e| PersistenceError::TransientIo(format!("pool get for migrations: {e}")))?;
        run_pending_migrations(&mut conn)?;
    }
    Ok(pool)
}

/// Helper de desarrollo: carga `.env`, lee `DbConfig` y construye un pool ya
/// migrado. `Ok(None)` si no hay `DATABASE_URL`.
pub fn build_dev_pool_from_env() -> Result<Option<PgPool>, PersistenceError> {
    crate::config::init_dotenv();
    let Some(cfg) = crate::config::DbConfig::from_env() else {
        return Ok(None);
    };
    build_pool(&cfg.url, cfg.min_connections, cfg.max_connections).map(Some)
}
