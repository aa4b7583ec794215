//! Lease manager: reclamo temporal del derecho a ejecutar una task.
//!
//! `acquire` corre como una única transacción del store:
//! 1. lee el snapshot;
//! 2. documento inexistente, task ya completada o ausente -> no se concede
//!    (sin escribir nada);
//! 3. lease vigente (expira después del tiempo de la transacción) ->
//!    `PipelineError::LeaseHeld`, distinto de "no concedido": es contención y
//!    debe reintentarse más tarde;
//! 4. en otro caso escribe `task_leases[task] = now + duration` y concede.
//!
//! No es un lock exclusivo real: no hay renovación ni fencing token. Un
//! handler que tarde más que `duration` puede solaparse con un reintento.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use crate::constants::{DEFAULT_LEASE_SECONDS, TASK_LEASES_FIELD};
use crate::errors::PipelineError;
use crate::model::{read_leases, read_task_list, DocumentRef, Fields};
use crate::selector::TaskCursor;
use crate::store::{DocumentStore, Transaction};

/// Resultado de `acquire` cuando no hay contención.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    Granted { expires_at: DateTime<Utc> },
    DocumentMissing,
    AlreadyCompleted,
    /// El `task_list` no tiene una task con ese nombre en esa posición.
    TaskMissing,
}

impl LeaseGrant {
    pub fn is_granted(&self) -> bool {
        matches!(self, LeaseGrant::Granted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    duration: Duration,
}

impl LeaseManager {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub async fn acquire<S>(&self, store: &S, doc: &DocumentRef, cursor: &TaskCursor) -> Result<LeaseGrant, PipelineError>
        where S: DocumentStore
    {
        let duration = self.duration;
        let target = doc.clone();
        let cursor = cursor.clone();
        store.run_transaction(doc, move |tx: &mut Transaction| try_acquire(tx, &target, &cursor, duration))
             .await
    }
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new(Duration::seconds(DEFAULT_LEASE_SECONDS))
    }
}

fn try_acquire(tx: &mut Transaction,
               doc: &DocumentRef,
               cursor: &TaskCursor,
               duration: Duration)
               -> Result<LeaseGrant, PipelineError> {
    let now = tx.now();
    let Some(snapshot) = tx.snapshot() else {
        return Ok(LeaseGrant::DocumentMissing);
    };
    let task_list = read_task_list(doc, snapshot)?.unwrap_or_default();
    match task_list.task(cursor.stage_index, cursor.task_index) {
        Some(task) if task.name != cursor.task_name => return Ok(LeaseGrant::TaskMissing),
        Some(task) if task.completed => return Ok(LeaseGrant::AlreadyCompleted),
        Some(_) => {}
        None => return Ok(LeaseGrant::TaskMissing),
    }

    let mut leases = read_leases(snapshot);
    if let Some(expires_at) = leases.get(&cursor.task_name).copied() {
        if expires_at > now {
            return Err(PipelineError::LeaseHeld { task: cursor.task_name.clone(),
                                                  expires_at });
        }
    }

    let Some(expires_at) = now.checked_add_signed(duration) else {
        return Err(PipelineError::LeaseOutOfRange { task: cursor.task_name.clone(),
                                                    duration });
    };
    leases.insert(cursor.task_name.clone(), expires_at);
    let encoded: Fields = leases.into_iter()
                                .map(|(task, ts)| (task, Value::String(ts.to_rfc3339())))
                                .collect();
    let mut patch = Fields::new();
    patch.insert(TASK_LEASES_FIELD.to_string(), Value::Object(encoded));
    tx.merge(patch);
    Ok(LeaseGrant::Granted { expires_at })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Clock, InMemoryDocumentStore, ManualClock};
    use serde_json::json;
    use std::sync::Arc;

    fn cursor(stage_index: usize, task_index: usize, name: &str) -> TaskCursor {
        TaskCursor { stage_index,
                     task_index,
                     stage_name: "s".into(),
                     task_name: name.into() }
    }

    async fn seeded(clock: Arc<ManualClock>) -> (InMemoryDocumentStore, DocumentRef) {
        let store = InMemoryDocumentStore::with_clock(clock);
        let doc = DocumentRef::new("signups", "s1");
        let fields = json!({
            "task_list": [{"name": "s", "tasks": [{"name": "a", "completed": false}, {"name": "b", "completed": true}]}]
        });
        store.create(&doc, fields.as_object().cloned().unwrap()).await.unwrap();
        (store, doc)
    }

    #[tokio::test]
    async fn grant_writes_expiry_then_contends() {
        let clock = Arc::new(ManualClock::default());
        let (store, doc) = seeded(clock.clone()).await;
        let leases = LeaseManager::default();

        let grant = leases.acquire(&store, &doc, &cursor(0, 0, "a")).await.unwrap();
        assert_eq!(grant, LeaseGrant::Granted { expires_at: clock.now() + Duration::seconds(120) });
        let stored = read_leases(&store.snapshot(&doc).unwrap());
        assert_eq!(stored.get("a"), Some(&(clock.now() + Duration::seconds(120))));

        let second = leases.acquire(&store, &doc, &cursor(0, 0, "a")).await;
        assert!(matches!(second, Err(PipelineError::LeaseHeld { ref task, .. }) if task == "a"));
    }

    #[tokio::test]
    async fn expired_lease_can_be_reacquired() {
        let clock = Arc::new(ManualClock::default());
        let (store, doc) = seeded(clock.clone()).await;
        let leases = LeaseManager::new(Duration::seconds(120));

        assert!(leases.acquire(&store, &doc, &cursor(0, 0, "a")).await.unwrap().is_granted());
        clock.advance(Duration::seconds(120));
        // expira exactamente ahora: ya no está "en el futuro"
        assert!(leases.acquire(&store, &doc, &cursor(0, 0, "a")).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn completed_missing_or_mismatched_tasks_are_not_granted() {
        let clock = Arc::new(ManualClock::default());
        let (store, doc) = seeded(clock).await;
        let leases = LeaseManager::default();

        assert_eq!(leases.acquire(&store, &doc, &cursor(0, 1, "b")).await.unwrap(), LeaseGrant::AlreadyCompleted);
        assert_eq!(leases.acquire(&store, &doc, &cursor(3, 0, "zz")).await.unwrap(), LeaseGrant::TaskMissing);
        assert_eq!(leases.acquire(&store, &doc, &cursor(0, 0, "b")).await.unwrap(), LeaseGrant::TaskMissing);
        assert!(store.snapshot(&doc).unwrap().get(TASK_LEASES_FIELD).is_none());

        let ghost = DocumentRef::new("signups", "ghost");
        assert_eq!(leases.acquire(&store, &ghost, &cursor(0, 0, "a")).await.unwrap(), LeaseGrant::DocumentMissing);
    }

    #[tokio::test]
    async fn overflowing_expiry_is_an_error_and_writes_nothing() {
        let clock = Arc::new(ManualClock::default());
        let (store, doc) = seeded(clock).await;
        let leases = LeaseManager::new(Duration::MAX);

        let err = leases.acquire(&store, &doc, &cursor(0, 0, "a")).await.unwrap_err();

        assert!(matches!(err, PipelineError::LeaseOutOfRange { ref task, .. } if task == "a"));
        assert!(!err.is_retryable());
        assert!(store.snapshot(&doc).unwrap().get(TASK_LEASES_FIELD).is_none());
    }
}
