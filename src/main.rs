use std::sync::Arc;
use std::time::Duration;

use pipe_core::{EngineSettings, InMemoryDocumentStore, PipelineStatus};
use pipeflow_rust::{build_coordinator, run_demo, sample_documents, AppError};
use tracing_subscriber::EnvFilter;

const DEMO_TIMEOUT: Duration = Duration::from_secs(30);

fn init_logging() {
    // también recoge los registros de `log` de los crates del workspace
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    pipe_core::config::init_dotenv();
    init_logging();
    let settings = EngineSettings::from_env();
    log::info!("engine settings: {settings:?}");

    #[cfg(feature = "pg")]
    let done = run_on_postgres(&settings).await?;
    #[cfg(not(feature = "pg"))]
    let done = false;
    if done {
        return Ok(());
    }

    let store = Arc::new(InMemoryDocumentStore::new().with_feed_capacity(settings.feed_capacity));
    let coordinator = build_coordinator(store, settings)?;
    let finished = run_demo(coordinator, sample_documents(), DEMO_TIMEOUT).await?;
    report(&finished);
    Ok(())
}

/// `Ok(false)` si no hay `DATABASE_URL` configurado.
#[cfg(feature = "pg")]
async fn run_on_postgres(settings: &EngineSettings) -> Result<bool, AppError> {
    let Some(pool) = pipe_persistence::build_dev_pool_from_env()? else {
        return Ok(false);
    };
    let store = Arc::new(pipe_persistence::PgDocumentStore::new(pipe_persistence::PoolProvider { pool })
                             .with_feed_capacity(settings.feed_capacity));
    let coordinator = build_coordinator(store, settings.clone())?;
    let resumed = pipeflow_rust::resume_pending(&coordinator).await?;
    log::info!("resumed {resumed} pending documents");
    let finished = run_demo(coordinator, sample_documents(), DEMO_TIMEOUT).await?;
    report(&finished);
    Ok(true)
}

fn report(finished: &[(pipe_core::DocumentRef, pipe_core::Fields)]) {
    for (doc, fields) in finished {
        let status = PipelineStatus::from_fields(doc, fields).map(|s| format!("{s:?}"))
                                                             .unwrap_or_else(|e| e.to_string());
        println!("{doc}: {status}");
        for (key, value) in fields.iter().filter(|(k, _)| !pipe_core::constants::RESERVED_FIELDS.contains(&k.as_str())) {
            println!("    {key} = {value}");
        }
    }
}
