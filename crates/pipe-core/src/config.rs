//! Configuración del motor.
//!
//! - `EngineSettings`: parámetros del motor leídos de variables de entorno
//!   (con `.env` opcional cargado una sola vez).
//! - `PipelineCatalog`: colección -> configuración de stages. Se carga de un
//!   JSON respetando el orden de las claves, que es el orden de los stages.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::{DEFAULT_CUSTOM_STAGE_NAME, DEFAULT_CUSTOM_TASKS_FIELD, DEFAULT_FEED_CAPACITY,
                       DEFAULT_LEASE_SECONDS, DEFAULT_RETRY_INITIAL_MS, DEFAULT_RETRY_MAX_MS,
                       MAX_LEASE_SECONDS};
use crate::template::StageConfig;

// Carga perezosa del archivo .env una sola vez.
static DOTENV_LOADED: Lazy<()> = Lazy::new(|| {
    let _ = dotenvy::dotenv(); // ignora error si no existe .env
});

/// Forzar carga temprana de .env desde aplicaciones externas si se desea.
pub fn init_dotenv() {
    Lazy::force(&DOTENV_LOADED);
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read pipeline catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid pipeline catalog: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub lease_duration: chrono::Duration,
    pub custom_tasks_field: String,
    pub custom_stage_name: String,
    pub feed_capacity: usize,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    /// Ruta opcional al catálogo JSON de pipelines.
    pub pipelines_path: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { lease_duration: chrono::Duration::seconds(DEFAULT_LEASE_SECONDS),
               custom_tasks_field: DEFAULT_CUSTOM_TASKS_FIELD.to_string(),
               custom_stage_name: DEFAULT_CUSTOM_STAGE_NAME.to_string(),
               feed_capacity: DEFAULT_FEED_CAPACITY,
               retry_initial: Duration::from_millis(DEFAULT_RETRY_INITIAL_MS),
               retry_max: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
               pipelines_path: None }
    }
}

impl EngineSettings {
    /// Lee `PIPEFLOW_*` del entorno; valores ausentes o inválidos usan el
    /// default.
    pub fn from_env() -> Self {
        init_dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que `from_env` pero con una función de lookup inyectable.
    pub fn from_lookup<F>(lookup: F) -> Self
        where F: Fn(&str) -> Option<String>
    {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self { lease_duration: parsed("PIPEFLOW_LEASE_SECONDS").and_then(lease_from_secs)
                                                             .unwrap_or(defaults.lease_duration),
               custom_tasks_field: lookup("PIPEFLOW_CUSTOM_TASKS_FIELD").filter(|v| !v.is_empty())
                                                                        .unwrap_or(defaults.custom_tasks_field),
               custom_stage_name: lookup("PIPEFLOW_CUSTOM_STAGE_NAME").filter(|v| !v.is_empty())
                                                                      .unwrap_or(defaults.custom_stage_name),
               feed_capacity: parsed("PIPEFLOW_FEED_CAPACITY").filter(|c| *c > 0)
                                                              .map(|c| c as usize)
                                                              .unwrap_or(defaults.feed_capacity),
               retry_initial: parsed("PIPEFLOW_RETRY_INITIAL_MS").map(Duration::from_millis)
                                                                 .unwrap_or(defaults.retry_initial),
               retry_max: parsed("PIPEFLOW_RETRY_MAX_MS").map(Duration::from_millis)
                                                         .unwrap_or(defaults.retry_max),
               pipelines_path: lookup("PIPEFLOW_PIPELINES").filter(|v| !v.is_empty()).map(PathBuf::from) }
    }
}

/// Lease en `1..=MAX_LEASE_SECONDS`; fuera de rango se ignora.
fn lease_from_secs(secs: u64) -> Option<chrono::Duration> {
    let lease = i64::try_from(secs).ok()
                                   .filter(|s| (1..=MAX_LEASE_SECONDS).contains(s))
                                   .and_then(chrono::Duration::try_seconds);
    if lease.is_none() {
        log::warn!("PIPEFLOW_LEASE_SECONDS={secs} out of range (1..={MAX_LEASE_SECONDS}), using default");
    }
    lease
}

/// Configuración de stages por tipo de pipeline (colección).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineCatalog {
    pipelines: IndexMap<String, StageConfig>,
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: añade (o reemplaza) la configuración de `collection`.
    pub fn with_pipeline(mut self, collection: impl Into<String>, stages: StageConfig) -> Self {
        self.insert(collection, stages);
        self
    }

    pub fn insert(&mut self, collection: impl Into<String>, stages: StageConfig) {
        self.pipelines.insert(collection.into(), stages);
    }

    pub fn stages_for(&self, collection: &str) -> Option<&StageConfig> {
        self.pipelines.get(collection)
    }

    pub fn collections(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(),
                                                                                    source })?;
        Self::from_json_str(&raw)
    }
}

/// Atajo para construir un `StageConfig` en código:
/// `stage_config([("validate", &["a"]), ("load", &["b"])])`.
pub fn stage_config<'a, I>(stages: I) -> StageConfig
    where I: IntoIterator<Item = (&'a str, &'a [&'a str])>
{
    stages.into_iter()
          .map(|(stage, tasks)| (stage.to_string(), tasks.iter().map(|t| t.to_string()).collect()))
          .collect()
}
