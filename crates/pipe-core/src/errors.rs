//! Errores del motor de pipelines.
//!
//! Taxonomía:
//! - `LeaseHeld`: contención sobre un lease vigente. Siempre reintentable.
//! - `Handler`: error devuelto por un `TaskHandler`. Reintentable sin límite
//!   (la redelivery del host decide cuándo).
//! - `Store`: error del document store; reintentable según su variante.
//! - `UnknownPipeline` / `MalformedDocument` / `LeaseOutOfRange`:
//!   permanentes, reintentar no cambia el resultado.
//!
//! Los "configuration gaps" (task sin handler) y los updates sin cambios en
//! `task_list` no son errores: se reportan como `UpdateOutcome`.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errores del document store (in-memory, Postgres, ...).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("transaction conflict (retryable): {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("codec error: {0}")]
    Codec(String),
    /// Error del backend que reintentar no resuelve (constraint, SQL, ...).
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// `true` si repetir la operación puede tener éxito.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

/// Error devuelto por un handler de task.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("lease for task '{task}' held until {expires_at}")]
    LeaseHeld { task: String, expires_at: DateTime<Utc> },
    #[error("handler for task '{task}' failed: {source}")]
    Handler {
        task: String,
        #[source]
        source: HandlerError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no pipeline configured for collection '{0}'")]
    UnknownPipeline(String),
    #[error("malformed document {doc}: {reason}")]
    MalformedDocument { doc: String, reason: String },
    /// `now + duration` no es representable como instante.
    #[error("lease for task '{task}' overflows the time range ({duration})")]
    LeaseOutOfRange { task: String, duration: chrono::Duration },
}

/// Clasificación usada por el dispatcher para decidir la redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Lease vigente: reintentar más tarde, no es un fallo.
    Contention,
    /// Fallo transitorio (handler, store): reintentar con backoff.
    Transient,
    /// Reintentar no ayuda.
    Permanent,
}

pub fn classify_error(err: &PipelineError) -> ErrorClass {
    match err {
        PipelineError::LeaseHeld { .. } => ErrorClass::Contention,
        PipelineError::Handler { .. } => ErrorClass::Transient,
        PipelineError::Store(e) if e.is_retryable() => ErrorClass::Transient,
        PipelineError::Store(_) => ErrorClass::Permanent,
        PipelineError::UnknownPipeline(_)
        | PipelineError::MalformedDocument { .. }
        | PipelineError::LeaseOutOfRange { .. } => ErrorClass::Permanent,
    }
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        !matches!(classify_error(self), ErrorClass::Permanent)
    }
}
