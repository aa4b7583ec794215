//! Resultados observables de los entry points del coordinator.
//!
//! Ninguno de estos casos es un error: un update sin cambios, una task ya
//! completada por otro worker o un lease no concedido son situaciones normales
//! con entrega at-least-once.

use chrono::{DateTime, Utc};

use crate::lease::LeaseGrant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// Se escribió el `task_list` inicial.
    Initialized { stages: usize, tasks: usize },
    /// Redelivery: el documento ya tenía `task_list`.
    AlreadyInitialized,
    DocumentMissing,
}

/// Por qué no se ejecutó (o no se persistió) la task seleccionada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DocumentMissing,
    AlreadyCompleted,
    TaskMissing,
}

impl SkipReason {
    /// `None` si el lease fue concedido.
    pub fn from_grant(grant: &LeaseGrant) -> Option<Self> {
        match grant {
            LeaseGrant::Granted { .. } => None,
            LeaseGrant::DocumentMissing => Some(SkipReason::DocumentMissing),
            LeaseGrant::AlreadyCompleted => Some(SkipReason::AlreadyCompleted),
            LeaseGrant::TaskMissing => Some(SkipReason::TaskMissing),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// `task_list` idéntico antes y después: nada que hacer.
    Unchanged,
    /// Handler ejecutado y resultado persistido.
    TaskCompleted { task: String },
    /// Task sin handler registrado: marcada completada sin ejecutar nada.
    PassedThrough { task: String },
    Skipped { task: String, reason: SkipReason },
    /// Escritura terminal realizada en esta invocación.
    PipelineCompleted { at: DateTime<Utc> },
    /// Terminal, pero `processing_completed_at` ya estaba fijado.
    AlreadyFinished,
}

impl UpdateOutcome {
    /// `true` si esta invocación escribió algo que avanza el pipeline.
    pub fn made_progress(&self) -> bool {
        matches!(self,
                 UpdateOutcome::TaskCompleted { .. }
                 | UpdateOutcome::PassedThrough { .. }
                 | UpdateOutcome::PipelineCompleted { .. })
    }
}

/// Resultado de `handle` según el tipo de evento.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Created(CreateOutcome),
    Updated(UpdateOutcome),
}
