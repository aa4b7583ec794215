//! Errores de persistencia.
//! Mapea errores de Diesel / conexión a variantes semánticas y de ahí al
//! `StoreError` que entiende el motor.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use pipe_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")]
    UniqueViolation(String),
    #[error("check violation: {0}")]
    CheckViolation(String),
    #[error("not found")]
    NotFound,
    #[error("serialization conflict (retryable)")]
    SerializationConflict,
    #[error("transient IO / connection pool error: {0}")]
    TransientIo(String),
    #[error("stored document is not a JSON object: {0}")]
    Codec(String),
    #[error("unknown database error: {0}")]
    Unknown(String),
}

impl PersistenceError {
    /// Determina si un error es transitorio (recomendado reintentar con
    /// backoff). Algunos mensajes llegan como `Unknown` con texto; se hace
    /// best-effort string match sin acoplar a SQLSTATE.
    pub fn is_retryable(&self) -> bool {
        match self {
            PersistenceError::SerializationConflict | PersistenceError::TransientIo(_) => true,
            PersistenceError::Unknown(msg) => {
                let m = msg.to_lowercase();
                m.contains("deadlock detected")
                || m.contains("could not serialize access due to concurrent update")
                || m.contains("terminating connection due to administrator command")
                || m.contains("connection closed")
                || m.contains("connection refused")
                || m.contains("timeout")
            }
            _ => false,
        }
    }
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {:?}: {}", other, info.message())),
            },
            DieselError::DeserializationError(e) => Self::Codec(format!("deser: {e}")),
            DieselError::SerializationError(e) => Self::Codec(format!("ser: {e}")),
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            DieselError::RollbackErrorOnCommit { rollback_error, commit_error } => {
                Self::Unknown(format!("rollback={rollback_error}; commit={commit_error}"))
            }
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<PersistenceError> for StoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::UniqueViolation(m) => StoreError::AlreadyExists(m),
            PersistenceError::NotFound => StoreError::NotFound("row not found".into()),
            PersistenceError::SerializationConflict => StoreError::Conflict("serialization failure".into()),
            PersistenceError::Codec(m) => StoreError::Codec(m),
            e if e.is_retryable() => StoreError::Unavailable(e.to_string()),
            e => StoreError::Backend(e.to_string()),
        }
    }
}
