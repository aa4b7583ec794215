//! Identidad de documentos y lectura tipada de los campos del motor.
//!
//! El documento completo es un objeto JSON (`Fields`); el motor sólo
//! interpreta `task_list`, `task_leases` y los timestamps de procesamiento.
//! El resto de campos (los que aportan los handlers) se mergean sin leerlos.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::{PROCESSING_COMPLETED_AT_FIELD, TASK_LEASES_FIELD, TASK_LIST_FIELD};
use crate::errors::PipelineError;
use crate::model::TaskList;
use crate::selector::{select_next, Selection, TaskCursor};

/// Campos de un documento (objeto JSON de primer nivel).
pub type Fields = Map<String, Value>;

/// Leases vigentes o caducados, indexados por nombre de task.
pub type LeaseTable = HashMap<String, DateTime<Utc>>;

/// Referencia a un documento dentro de una colección (tipo de pipeline).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentRef {
    pub collection: String,
    pub id: String,
    /// Id del documento padre cuando la colección es una subcolección.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl DocumentRef {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self { collection: collection.into(),
               id: id.into(),
               parent_id: None }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    /// Ruta estable usada como clave primaria en los stores.
    pub fn path(&self) -> String {
        match &self.parent_id {
            Some(parent) => format!("{parent}/{}/{}", self.collection, self.id),
            None => format!("{}/{}", self.collection, self.id),
        }
    }
}

impl fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Decodifica `task_list`. `Ok(None)` si el campo no existe o es `null`
/// (documento aún no inicializado por `on_create`).
pub fn read_task_list(doc: &DocumentRef, fields: &Fields) -> Result<Option<TaskList>, PipelineError> {
    match fields.get(TASK_LIST_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(raw) => serde_json::from_value(raw.clone()).map(Some).map_err(|e| {
                                                                       PipelineError::MalformedDocument { doc: doc.path(),
                                                                                                          reason: format!("{TASK_LIST_FIELD}: {e}") }
                                                                   }),
    }
}

/// Lee `task_leases`. Las entradas que no son timestamps RFC 3339 se
/// consideran ausentes.
pub fn read_leases(fields: &Fields) -> LeaseTable {
    let Some(Value::Object(raw)) = fields.get(TASK_LEASES_FIELD) else {
        return LeaseTable::new();
    };
    raw.iter()
       .filter_map(|(task, v)| {
           let parsed = v.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok());
           if parsed.is_none() {
               log::warn!("ignoring unparseable lease for task '{task}': {v}");
           }
           parsed.map(|ts| (task.clone(), ts.with_timezone(&Utc)))
       })
       .collect()
}

/// Lee `processing_completed_at` si está fijado.
pub fn read_completed_at(fields: &Fields) -> Option<DateTime<Utc>> {
    fields.get(PROCESSING_COMPLETED_AT_FIELD)
          .and_then(Value::as_str)
          .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
          .map(|ts| ts.with_timezone(&Utc))
}

/// Estado observable de un documento de pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineStatus {
    /// `on_create` todavía no escribió el `task_list`.
    Uninitialized,
    /// Hay al menos una task pendiente; `next` es la siguiente a ejecutar.
    Running { next: TaskCursor },
    /// Todas las tasks completas pero falta la escritura terminal.
    AwaitingCompletion,
    /// Estado terminal.
    Completed { at: DateTime<Utc> },
}

impl PipelineStatus {
    pub fn from_fields(doc: &DocumentRef, fields: &Fields) -> Result<Self, PipelineError> {
        let Some(task_list) = read_task_list(doc, fields)? else {
            return Ok(PipelineStatus::Uninitialized);
        };
        Ok(match (select_next(&task_list), read_completed_at(fields)) {
            (Selection::Next(next), _) => PipelineStatus::Running { next },
            (Selection::Terminal, Some(at)) => PipelineStatus::Completed { at },
            (Selection::Terminal, None) => PipelineStatus::AwaitingCompletion,
        })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineStatus::Completed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn path_includes_parent() {
        let doc = DocumentRef::new("donations", "d1").with_parent("campaign-7");
        assert_eq!(doc.path(), "campaign-7/donations/d1");
        assert_eq!(DocumentRef::new("signups", "s1").to_string(), "signups/s1");
    }

    #[test]
    fn missing_or_null_task_list_is_uninitialized() {
        let doc = DocumentRef::new("signups", "s1");
        assert_eq!(read_task_list(&doc, &fields(json!({"email": "a@b.c"}))).unwrap(), None);
        assert_eq!(read_task_list(&doc, &fields(json!({"task_list": null}))).unwrap(), None);
        assert!(matches!(read_task_list(&doc, &fields(json!({"task_list": 3}))),
                         Err(PipelineError::MalformedDocument { .. })));
    }

    #[test]
    fn bad_lease_entries_are_ignored() {
        let f = fields(json!({"task_leases": {"a": "2024-01-01T00:00:00Z", "b": 42}}));
        let leases = read_leases(&f);
        assert_eq!(leases.len(), 1);
        assert!(leases.contains_key("a"));
    }

    #[test]
    fn status_follows_selector_and_terminal_field() {
        let doc = DocumentRef::new("signups", "s1");
        let running = fields(json!({"task_list": [{"name": "s", "tasks": [{"name": "a", "completed": false}]}]}));
        assert!(matches!(PipelineStatus::from_fields(&doc, &running).unwrap(), PipelineStatus::Running { .. }));

        let done = fields(json!({"task_list": [], "processing_completed_at": "2024-05-01T10:00:00Z"}));
        assert!(PipelineStatus::from_fields(&doc, &done).unwrap().is_completed());

        let pending_terminal = fields(json!({"task_list": [], "processing_completed_at": null}));
        assert_eq!(PipelineStatus::from_fields(&doc, &pending_terminal).unwrap(),
                   PipelineStatus::AwaitingCompletion);
    }
}
