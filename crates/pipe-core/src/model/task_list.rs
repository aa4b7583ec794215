//! `TaskList`: estructura ordenada de stages y tasks de un documento.
//!
//! Invariante: la estructura (nombres y orden) se fija en `on_create` y no
//! cambia; sólo el flag `completed` pasa de `false` a `true`, una vez.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    pub fn pending(name: impl Into<String>) -> Self {
        Self { name: name.into(),
               completed: false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    pub name: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

/// Lista ordenada de stages tal y como se persiste en `task_list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskList(pub Vec<Stage>);

impl TaskList {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn task(&self, stage_index: usize, task_index: usize) -> Option<&Task> {
        self.0.get(stage_index).and_then(|s| s.tasks.get(task_index))
    }

    /// Marca la task como completada. Devuelve `false` si no existe o si ya
    /// estaba completada (la transición es única).
    pub fn mark_completed(&mut self, stage_index: usize, task_index: usize) -> bool {
        match self.0.get_mut(stage_index).and_then(|s| s.tasks.get_mut(task_index)) {
            Some(task) if !task.completed => {
                task.completed = true;
                true
            }
            _ => false,
        }
    }

    pub fn task_count(&self) -> usize {
        self.0.iter().map(|s| s.tasks.len()).sum()
    }

    pub fn completed_count(&self) -> usize {
        self.0.iter().flat_map(|s| s.tasks.iter()).filter(|t| t.completed).count()
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|s| s.tasks.iter().all(|t| t.completed))
    }

    /// Nombres repetidos (en orden de primera repetición). Los leases se
    /// indexan por nombre, así que un duplicado comparte lease.
    pub fn duplicate_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut dups = Vec::new();
        for task in self.0.iter().flat_map(|s| s.tasks.iter()) {
            if !seen.insert(task.name.as_str()) && !dups.contains(&task.name) {
                dups.push(task.name.clone());
            }
        }
        dups
    }
}
