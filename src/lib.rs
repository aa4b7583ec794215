//! PipeFlow
//!
//! Cableado de la aplicación de ejemplo:
//! - catálogo de pipelines por defecto (`signups`, `donations`) o cargado de
//!   `PIPEFLOW_PIPELINES`;
//! - registry con los handlers de `pipe-adapters`;
//! - `run_demo`: lanza el dispatcher, crea documentos y espera a que todos
//!   lleguen al estado terminal.

use std::sync::Arc;
use std::time::Duration;

use pipe_core::config::ConfigError;
use pipe_core::{stage_config, DocumentRef, DocumentStore, Dispatcher, EngineSettings, Fields, PipelineCatalog,
                PipelineCoordinator, PipelineError, PipelineStatus, StoreError};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[cfg(feature = "pg")]
    #[error(transparent)]
    Persistence(#[from] pipe_persistence::PersistenceError),
    #[error("timed out after {0:?} waiting for {1} documents")]
    Timeout(Duration, usize),
}

/// Pipelines incluidos. Las tasks sin handler en `pipe-adapters`
/// (`geocode`, `crm_sync`, ...) son colaboradores externos y aquí pasan de
/// largo.
pub fn default_catalog() -> PipelineCatalog {
    PipelineCatalog::new().with_pipeline("signups",
                                         stage_config([("validate", &["normalize_email", "dedupe_key"][..]),
                                                       ("enrich", &["full_name", "geocode"][..]),
                                                       ("sync", &["crm_sync"][..])]))
                          .with_pipeline("donations",
                                         stage_config([("ingest", &["billing_webhook"][..]),
                                                       ("notify", &["receipt_email"][..])]))
}

pub fn load_catalog(settings: &EngineSettings) -> Result<PipelineCatalog, AppError> {
    match &settings.pipelines_path {
        Some(path) => {
            log::info!("loading pipeline catalog from {}", path.display());
            Ok(PipelineCatalog::from_path(path)?)
        }
        None => Ok(default_catalog()),
    }
}

pub fn build_coordinator<S>(store: Arc<S>, settings: EngineSettings) -> Result<PipelineCoordinator<S>, AppError>
    where S: DocumentStore
{
    let catalog = load_catalog(&settings)?;
    Ok(PipelineCoordinator::builder(store).settings(settings)
                                          .catalog(catalog)
                                          .registry(pipe_adapters::default_registry())
                                          .build())
}

/// Documentos de ejemplo: dos altas (una con task ad-hoc) y una donación
/// colgando de una campaña.
pub fn sample_documents() -> Vec<(DocumentRef, Fields)> {
    let docs = [(DocumentRef::new("signups", new_id()),
                 json!({"email": "  Ana.Ruiz@Example.org", "first_name": "Ana", "last_name": "Ruiz"})),
                (DocumentRef::new("signups", new_id()),
                 json!({"email": "eva@example.org", "first_name": "Eva", "custom_tasks": ["welcome_pack"]})),
                (DocumentRef::new("donations", new_id()).with_parent("campaign-2024"),
                 json!({"amount_cents": 2500, "currency": "EUR"}))];
    docs.into_iter()
        .map(|(doc, value)| (doc, value.as_object().cloned().unwrap_or_default()))
        .collect()
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Espera (sondeando) a que todos los documentos estén completados.
pub async fn wait_for_completion<S>(coordinator: &PipelineCoordinator<S>,
                                    docs: &[DocumentRef],
                                    timeout: Duration)
                                    -> Result<Vec<PipelineStatus>, AppError>
    where S: DocumentStore
{
    let poll = async {
        loop {
            let mut statuses = Vec::with_capacity(docs.len());
            for doc in docs {
                statuses.push(coordinator.status(doc).await?);
            }
            if statuses.iter().all(PipelineStatus::is_completed) {
                return Ok::<_, AppError>(statuses);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(timeout, poll).await
                                       .map_err(|_| AppError::Timeout(timeout, docs.len()))?
}

/// Lanza el dispatcher, crea los documentos y espera al estado terminal.
pub async fn run_demo<S>(coordinator: PipelineCoordinator<S>,
                         documents: Vec<(DocumentRef, Fields)>,
                         timeout: Duration)
                         -> Result<Vec<(DocumentRef, Fields)>, AppError>
    where S: DocumentStore + 'static
{
    let store = Arc::clone(coordinator.store());
    let dispatcher = Dispatcher::new(coordinator.clone()).spawn();

    let mut refs = Vec::with_capacity(documents.len());
    for (doc, fields) in documents {
        store.create(&doc, fields).await?;
        refs.push(doc);
    }
    let waited = wait_for_completion(&coordinator, &refs, timeout).await;
    let stats = dispatcher.shutdown().await;
    log::info!("dispatcher stopped: {stats:?}");
    waited?;

    let mut finished = Vec::with_capacity(refs.len());
    for doc in refs {
        let fields = store.get(&doc).await?.unwrap_or_default();
        finished.push((doc, fields));
    }
    Ok(finished)
}

/// Reanuda documentos que quedaron sin estado terminal (p. ej. tras una
/// caída: sus eventos se perdieron con el proceso).
#[cfg(feature = "pg")]
pub async fn resume_pending<P>(coordinator: &PipelineCoordinator<pipe_persistence::PgDocumentStore<P>>)
                               -> Result<usize, AppError>
    where P: pipe_persistence::ConnectionProvider
{
    let mut resumed = 0;
    for collection in coordinator.catalog().collections() {
        for doc in coordinator.store().pending_documents(collection).await? {
            match coordinator.drive(&doc).await {
                Ok(_) => resumed += 1,
                Err(e) if e.is_retryable() => log::warn!("{doc}: not resumed yet: {e}"),
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(resumed)
}
