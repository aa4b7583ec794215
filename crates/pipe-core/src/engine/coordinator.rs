//! `PipelineCoordinator`: lógica de los dos entry points del motor.
//!
//! - `on_create`: escribe el `task_list` inicial y `processing_started_at`.
//! - `on_update`: si el `task_list` cambió, ejecuta (como mucho) la siguiente
//!   task pendiente y persiste su resultado. Esa escritura vuelve a disparar
//!   `on_update`, y así hasta el estado terminal.
//!
//! Cada invocación avanza como mucho una task. Todas las escrituras del motor
//! son transacciones sobre el snapshot actual del documento, nunca sobre el
//! payload del evento (que puede ser antiguo por redelivery).

use std::sync::Arc;

use serde_json::Value;

use crate::config::{EngineSettings, PipelineCatalog};
use crate::constants::{PROCESSING_COMPLETED_AT_FIELD, PROCESSING_STARTED_AT_FIELD, TASK_LIST_FIELD};
use crate::engine::builder::CoordinatorBuilder;
use crate::engine::outcome::{CreateOutcome, EventOutcome, SkipReason, UpdateOutcome};
use crate::errors::{PipelineError, StoreError};
use crate::lease::LeaseManager;
use crate::merge::strip_reserved;
use crate::model::{read_completed_at, read_task_list, DocumentRef, Fields, PipelineStatus, TaskList};
use crate::registry::TaskRegistry;
use crate::selector::{select_next, Selection, TaskCursor};
use crate::store::{ChangeEvent, DocumentStore, Transaction};
use crate::template::build_task_list;

pub struct PipelineCoordinator<S: DocumentStore> {
    store: Arc<S>,
    registry: Arc<TaskRegistry>,
    catalog: Arc<PipelineCatalog>,
    leases: LeaseManager,
    settings: Arc<EngineSettings>,
}

impl<S: DocumentStore> Clone for PipelineCoordinator<S> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store),
               registry: Arc::clone(&self.registry),
               catalog: Arc::clone(&self.catalog),
               leases: self.leases.clone(),
               settings: Arc::clone(&self.settings) }
    }
}

impl<S: DocumentStore> std::fmt::Debug for PipelineCoordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineCoordinator")
         .field("registry", &self.registry)
         .field("collections", &self.catalog.collections().collect::<Vec<_>>())
         .field("lease", &self.leases.duration())
         .finish()
    }
}

impl<S: DocumentStore> PipelineCoordinator<S> {
    pub fn builder(store: Arc<S>) -> CoordinatorBuilder<S> {
        CoordinatorBuilder::new(store)
    }

    pub(crate) fn from_parts(store: Arc<S>,
                             registry: TaskRegistry,
                             catalog: PipelineCatalog,
                             settings: EngineSettings)
                             -> Self {
        Self { store,
               registry: Arc::new(registry),
               catalog: Arc::new(catalog),
               leases: LeaseManager::new(settings.lease_duration),
               settings: Arc::new(settings) }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Enruta un evento del feed al entry point correspondiente.
    pub async fn handle(&self, event: &ChangeEvent) -> Result<EventOutcome, PipelineError> {
        match event {
            ChangeEvent::Created { doc, snapshot } => self.on_create(doc, snapshot).await.map(EventOutcome::Created),
            ChangeEvent::Updated { doc, before, after } => {
                self.on_update(doc, before, after).await.map(EventOutcome::Updated)
            }
        }
    }

    /// Inicializa el documento recién creado.
    ///
    /// Idempotente: si el documento ya tiene `task_list` (redelivery del
    /// evento de creación) no escribe nada, así nunca se resetea el progreso.
    pub async fn on_create(&self, doc: &DocumentRef, _snapshot: &Fields) -> Result<CreateOutcome, PipelineError> {
        let Some(config) = self.catalog.stages_for(&doc.collection).cloned() else {
            return Err(PipelineError::UnknownPipeline(doc.collection.clone()));
        };
        let custom_field = self.settings.custom_tasks_field.clone();
        let custom_stage = self.settings.custom_stage_name.clone();
        let target = doc.clone();

        let outcome = self.store
                          .run_transaction(doc, move |tx: &mut Transaction| -> Result<CreateOutcome, PipelineError> {
                              let Some(snapshot) = tx.snapshot() else {
                                  return Ok(CreateOutcome::DocumentMissing);
                              };
                              if read_task_list(&target, snapshot)?.is_some() {
                                  return Ok(CreateOutcome::AlreadyInitialized);
                              }
                              let custom = read_custom_tasks(snapshot, &custom_field);
                              let task_list = build_task_list(&config, custom.as_deref(), &custom_stage);
                              let duplicates = task_list.duplicate_names();
                              if !duplicates.is_empty() {
                                  log::warn!("{target}: duplicate task names {duplicates:?} share a lease");
                              }
                              let outcome = CreateOutcome::Initialized { stages: task_list.stages().len(),
                                                                         tasks: task_list.task_count() };
                              let mut patch = Fields::new();
                              patch.insert(TASK_LIST_FIELD.to_string(), encode_task_list(&task_list)?);
                              patch.insert(PROCESSING_STARTED_AT_FIELD.to_string(), Value::String(tx.now().to_rfc3339()));
                              patch.insert(PROCESSING_COMPLETED_AT_FIELD.to_string(), Value::Null);
                              tx.merge(patch);
                              Ok(outcome)
                          })
                          .await?;
        match &outcome {
            CreateOutcome::Initialized { stages, tasks } => {
                log::info!("{doc}: pipeline initialised ({stages} stages, {tasks} tasks)")
            }
            CreateOutcome::AlreadyInitialized => log::debug!("{doc}: create redelivered, already initialised"),
            CreateOutcome::DocumentMissing => log::warn!("{doc}: created document no longer exists"),
        }
        Ok(outcome)
    }

    /// Reacciona a una escritura sobre el documento.
    pub async fn on_update(&self, doc: &DocumentRef, before: &Fields, after: &Fields) -> Result<UpdateOutcome, PipelineError> {
        let previous = read_task_list(doc, before).unwrap_or(None);
        let Some(current) = read_task_list(doc, after)? else {
            return Ok(UpdateOutcome::Unchanged);
        };
        if previous.as_ref() == Some(&current) {
            return Ok(UpdateOutcome::Unchanged);
        }
        self.advance(doc, after, &current).await
    }

    /// Bucle explícito: lee, selecciona, ejecuta y persiste hasta el estado
    /// terminal, sin depender del feed de cambios.
    ///
    /// La contención de lease y los fallos de handler se propagan al caller.
    pub async fn drive(&self, doc: &DocumentRef) -> Result<PipelineStatus, PipelineError> {
        loop {
            let fields = self.fetch(doc).await?;
            let Some(task_list) = read_task_list(doc, &fields)? else {
                if let CreateOutcome::DocumentMissing = self.on_create(doc, &fields).await? {
                    return Err(StoreError::NotFound(doc.path()).into());
                }
                continue;
            };
            if task_list.is_complete() {
                if let Some(at) = read_completed_at(&fields) {
                    return Ok(PipelineStatus::Completed { at });
                }
            }
            match self.advance(doc, &fields, &task_list).await? {
                UpdateOutcome::Skipped { reason: SkipReason::DocumentMissing, .. } => {
                    return Err(StoreError::NotFound(doc.path()).into());
                }
                UpdateOutcome::Skipped { task, reason: SkipReason::TaskMissing } => {
                    return Err(PipelineError::MalformedDocument { doc: doc.path(),
                                                                  reason: format!("task '{task}' vanished from {TASK_LIST_FIELD}") });
                }
                // fijado por otro writer o con un valor que no es un timestamp
                UpdateOutcome::AlreadyFinished => {
                    let fields = self.fetch(doc).await?;
                    return match read_completed_at(&fields) {
                        Some(at) => Ok(PipelineStatus::Completed { at }),
                        None => Err(PipelineError::MalformedDocument { doc: doc.path(),
                                                                       reason: format!("{PROCESSING_COMPLETED_AT_FIELD} is not an RFC 3339 timestamp") }),
                    };
                }
                _ => {}
            }
        }
    }

    /// Estado actual del documento.
    pub async fn status(&self, doc: &DocumentRef) -> Result<PipelineStatus, PipelineError> {
        let fields = self.fetch(doc).await?;
        PipelineStatus::from_fields(doc, &fields)
    }

    async fn fetch(&self, doc: &DocumentRef) -> Result<Fields, PipelineError> {
        self.store
            .get(doc)
            .await?
            .ok_or_else(|| StoreError::NotFound(doc.path()).into())
    }

    async fn advance(&self, doc: &DocumentRef, fields: &Fields, task_list: &TaskList) -> Result<UpdateOutcome, PipelineError> {
        let cursor = match select_next(task_list) {
            Selection::Terminal => return self.finish(doc).await,
            Selection::Next(cursor) => cursor,
        };

        let Some(handler) = self.registry.lookup(&cursor.task_name) else {
            log::warn!("{doc}: no handler registered for task '{}' (stage '{}'), passing through",
                       cursor.task_name,
                       cursor.stage_name);
            return Ok(match self.complete_task(doc, &cursor, Fields::new()).await? {
                          None => UpdateOutcome::PassedThrough { task: cursor.task_name },
                          Some(reason) => UpdateOutcome::Skipped { task: cursor.task_name,
                                                                   reason },
                      });
        };

        let grant = self.leases.acquire(self.store.as_ref(), doc, &cursor).await?;
        if let Some(reason) = SkipReason::from_grant(&grant) {
            log::debug!("{doc}: task '{}' not leased: {reason:?}", cursor.task_name);
            return Ok(UpdateOutcome::Skipped { task: cursor.task_name,
                                               reason });
        }

        log::debug!("{doc}: running task '{}' (stage '{}')", cursor.task_name, cursor.stage_name);
        let mut output = handler.execute(fields, &doc.id, doc.parent_id.as_deref())
                                .await
                                .map_err(|source| PipelineError::Handler { task: cursor.task_name.clone(),
                                                                           source })?;
        let dropped = strip_reserved(&mut output);
        if !dropped.is_empty() {
            log::warn!("{doc}: task '{}' tried to write reserved fields {dropped:?}; ignored",
                       cursor.task_name);
        }

        Ok(match self.complete_task(doc, &cursor, output).await? {
               None => {
                   log::info!("{doc}: task '{}' completed", cursor.task_name);
                   UpdateOutcome::TaskCompleted { task: cursor.task_name }
               }
               Some(reason) => {
                   log::warn!("{doc}: result of task '{}' discarded: {reason:?}", cursor.task_name);
                   UpdateOutcome::Skipped { task: cursor.task_name,
                                            reason }
               }
           })
    }

    /// Marca la task completada y mergea `output` en una única transacción
    /// sobre el snapshot actual. `Some(reason)` si no se escribió nada.
    async fn complete_task(&self, doc: &DocumentRef, cursor: &TaskCursor, output: Fields) -> Result<Option<SkipReason>, PipelineError> {
        let target = doc.clone();
        let cursor = cursor.clone();
        self.store
            .run_transaction(doc, move |tx: &mut Transaction| -> Result<Option<SkipReason>, PipelineError> {
                let Some(snapshot) = tx.snapshot() else {
                    return Ok(Some(SkipReason::DocumentMissing));
                };
                let mut task_list = read_task_list(&target, snapshot)?.unwrap_or_default();
                match task_list.task(cursor.stage_index, cursor.task_index) {
                    Some(task) if task.name != cursor.task_name => return Ok(Some(SkipReason::TaskMissing)),
                    None => return Ok(Some(SkipReason::TaskMissing)),
                    Some(_) => {}
                }
                if !task_list.mark_completed(cursor.stage_index, cursor.task_index) {
                    return Ok(Some(SkipReason::AlreadyCompleted));
                }
                let mut patch = output.clone();
                patch.insert(TASK_LIST_FIELD.to_string(), encode_task_list(&task_list)?);
                tx.merge(patch);
                Ok(None)
            })
            .await
    }

    /// Escritura terminal: fija `processing_completed_at` sólo si aún es
    /// `null`.
    async fn finish(&self, doc: &DocumentRef) -> Result<UpdateOutcome, PipelineError> {
        let target = doc.clone();
        let outcome = self.store
                          .run_transaction(doc, move |tx: &mut Transaction| -> Result<UpdateOutcome, PipelineError> {
                              let Some(snapshot) = tx.snapshot() else {
                                  return Err(PipelineError::Store(StoreError::NotFound(target.path())));
                              };
                              if !snapshot.get(PROCESSING_COMPLETED_AT_FIELD).map_or(true, Value::is_null) {
                                  return Ok(UpdateOutcome::AlreadyFinished);
                              }
                              let at = tx.now();
                              let mut patch = Fields::new();
                              patch.insert(PROCESSING_COMPLETED_AT_FIELD.to_string(), Value::String(at.to_rfc3339()));
                              tx.merge(patch);
                              Ok(UpdateOutcome::PipelineCompleted { at })
                          })
                          .await?;
        if let UpdateOutcome::PipelineCompleted { at } = &outcome {
            log::info!("{doc}: pipeline completed at {at}");
        }
        Ok(outcome)
    }
}

/// Tasks ad-hoc declaradas por el documento. Las entradas que no son string
/// se ignoran.
fn read_custom_tasks(fields: &Fields, field: &str) -> Option<Vec<String>> {
    match fields.get(field)? {
        Value::Array(items) => Some(items.iter()
                                         .filter_map(|v| {
                                             let name = v.as_str().map(str::to_string);
                                             if name.is_none() {
                                                 log::warn!("ignoring non-string entry in '{field}': {v}");
                                             }
                                             name
                                         })
                                         .collect()),
        Value::Null => None,
        other => {
            log::warn!("ignoring '{field}': expected an array of task names, got {other}");
            None
        }
    }
}

fn encode_task_list(task_list: &TaskList) -> Result<Value, PipelineError> {
    serde_json::to_value(task_list).map_err(|e| StoreError::Codec(e.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::stage_config;
    use crate::errors::HandlerError;
    use crate::store::{Clock, InMemoryDocumentStore, ManualClock};
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    fn coordinator(store: Arc<InMemoryDocumentStore>, registry: TaskRegistry) -> PipelineCoordinator<InMemoryDocumentStore> {
        PipelineCoordinator::builder(store).registry(registry)
                                           .pipeline("signups", stage_config([("validate", &["a"][..]), ("load", &["b"][..])]))
                                           .build()
    }

    #[test]
    fn custom_tasks_skip_non_strings() {
        let f = fields(json!({"custom_tasks": ["x", 3, "y"]}));
        assert_eq!(read_custom_tasks(&f, "custom_tasks"), Some(vec!["x".to_string(), "y".to_string()]));
        assert_eq!(read_custom_tasks(&fields(json!({"custom_tasks": "x"})), "custom_tasks"), None);
        assert_eq!(read_custom_tasks(&Fields::new(), "custom_tasks"), None);
    }

    #[tokio::test]
    async fn create_initialises_once() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
        let coord = coordinator(store.clone(), TaskRegistry::new());
        let doc = DocumentRef::new("signups", "s1");
        store.create(&doc, fields(json!({"custom_tasks": ["extra"]}))).await.unwrap();

        let first = coord.on_create(&doc, &Fields::new()).await.unwrap();
        assert_eq!(first, CreateOutcome::Initialized { stages: 3, tasks: 3 });
        let snap = store.snapshot(&doc).unwrap();
        assert_eq!(snap[PROCESSING_STARTED_AT_FIELD], json!(clock.now().to_rfc3339()));
        assert_eq!(snap[PROCESSING_COMPLETED_AT_FIELD], Value::Null);
        assert_eq!(snap[TASK_LIST_FIELD][2]["name"], json!("custom"));

        assert_eq!(coord.on_create(&doc, &Fields::new()).await.unwrap(), CreateOutcome::AlreadyInitialized);
    }

    #[tokio::test]
    async fn unknown_collection_is_permanent() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let coord = coordinator(store, TaskRegistry::new());
        let err = coord.on_create(&DocumentRef::new("orders", "o1"), &Fields::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnknownPipeline(ref c) if c == "orders"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unchanged_task_list_is_a_noop() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let coord = coordinator(store, TaskRegistry::new());
        let doc = DocumentRef::new("signups", "s1");
        let list = json!([{"name": "validate", "tasks": [{"name": "a", "completed": false}]}]);
        let before = fields(json!({"task_list": list, "x": 1}));
        let after = fields(json!({"task_list": list, "x": 2}));
        assert_eq!(coord.on_update(&doc, &before, &after).await.unwrap(), UpdateOutcome::Unchanged);
        assert_eq!(coord.on_update(&doc, &Fields::new(), &Fields::new()).await.unwrap(), UpdateOutcome::Unchanged);
    }

    #[tokio::test]
    async fn handler_failure_keeps_task_pending_and_lease_held() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut registry = TaskRegistry::new();
        registry.register_fn("a", |_, _, _| async { Err(HandlerError::msg("upstream down")) });
        let coord = coordinator(store.clone(), registry);
        let doc = DocumentRef::new("signups", "s1");
        store.create(&doc, Fields::new()).await.unwrap();
        coord.on_create(&doc, &Fields::new()).await.unwrap();

        let err = coord.drive(&doc).await.unwrap_err();
        assert!(matches!(err, PipelineError::Handler { ref task, .. } if task == "a"));
        let status = coord.status(&doc).await.unwrap();
        assert!(matches!(status, PipelineStatus::Running { ref next } if next.task_name == "a"));

        // el lease sigue vigente: un segundo intento es contención
        assert!(matches!(coord.drive(&doc).await, Err(PipelineError::LeaseHeld { .. })));
    }

    #[tokio::test]
    async fn reserved_fields_from_handlers_are_ignored() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let mut registry = TaskRegistry::new();
        registry.register_fn("a", |_, _, _| async {
                    Ok(fields(json!({"task_list": [], "processing_completed_at": "1999-01-01T00:00:00Z", "score": 7})))
                });
        let coord = coordinator(store.clone(), registry);
        let doc = DocumentRef::new("signups", "s1");
        store.create(&doc, Fields::new()).await.unwrap();

        let status = coord.drive(&doc).await.unwrap();
        assert!(status.is_completed());
        let snap = store.snapshot(&doc).unwrap();
        assert_eq!(snap["score"], json!(7));
        let list = read_task_list(&doc, &snap).unwrap().unwrap();
        assert_eq!(list.task_count(), 2);
        assert!(list.is_complete());
    }

    #[tokio::test]
    async fn terminal_timestamp_is_written_once() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryDocumentStore::with_clock(clock.clone()));
        let coord = PipelineCoordinator::builder(store.clone()).pipeline("empty", Default::default())
                                                               .build();
        let doc = DocumentRef::new("empty", "e1");
        store.create(&doc, Fields::new()).await.unwrap();

        let first = coord.drive(&doc).await.unwrap();
        let at = clock.now();
        assert_eq!(first, PipelineStatus::Completed { at });

        clock.advance(chrono::Duration::seconds(30));
        let after = store.snapshot(&doc).unwrap();
        let outcome = coord.on_update(&doc, &Fields::new(), &after).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::AlreadyFinished);
        assert_eq!(read_completed_at(&store.snapshot(&doc).unwrap()), Some(at));
    }

    #[tokio::test]
    async fn unparseable_terminal_value_is_never_overwritten() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let coord = PipelineCoordinator::builder(store.clone()).pipeline("empty", Default::default())
                                                               .build();
        let doc = DocumentRef::new("empty", "e1");
        let seeded = fields(json!({"task_list": [], "processing_completed_at": "yesterday"}));
        store.create(&doc, seeded.clone()).await.unwrap();

        let outcome = coord.on_update(&doc, &Fields::new(), &seeded).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::AlreadyFinished);
        assert_eq!(store.snapshot(&doc).unwrap()[PROCESSING_COMPLETED_AT_FIELD], json!("yesterday"));

        let err = coord.drive(&doc).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedDocument { .. }));
        assert_eq!(store.snapshot(&doc).unwrap()[PROCESSING_COMPLETED_AT_FIELD], json!("yesterday"));
    }

    #[tokio::test]
    async fn overflowing_lease_fails_drive_without_running_the_handler() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        let counter = calls.clone();
        registry.register_fn("a", move |_, _, _| {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async { Ok(Fields::new()) }
                });
        let settings = EngineSettings { lease_duration: chrono::Duration::MAX,
                                        ..EngineSettings::default() };
        let coord = PipelineCoordinator::builder(store.clone()).settings(settings)
                                                               .registry(registry)
                                                               .pipeline("signups", stage_config([("validate", &["a"][..])]))
                                                               .build();
        let doc = DocumentRef::new("signups", "s1");
        store.create(&doc, Fields::new()).await.unwrap();

        let err = coord.drive(&doc).await.unwrap_err();

        assert!(matches!(err, PipelineError::LeaseOutOfRange { ref task, .. } if task == "a"));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
