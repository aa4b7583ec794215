//! Selección de la siguiente task pendiente.
//!
//! Función pura sobre el `TaskList`: recorre stages en orden y, dentro de
//! cada stage, las tasks en orden. Se re-evalúa en cada escritura relevante,
//! así que no guarda estado.

use crate::model::TaskList;

/// Posición y nombres de una task dentro del `TaskList`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCursor {
    pub stage_index: usize,
    pub task_index: usize,
    pub stage_name: String,
    pub task_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Next(TaskCursor),
    /// No queda ninguna task sin completar.
    Terminal,
}

pub fn select_next(task_list: &TaskList) -> Selection {
    for (stage_index, stage) in task_list.stages().iter().enumerate() {
        if let Some(task_index) = stage.tasks.iter().position(|t| !t.completed) {
            return Selection::Next(TaskCursor { stage_index,
                                                task_index,
                                                stage_name: stage.name.clone(),
                                                task_name: stage.tasks[task_index].name.clone() });
        }
    }
    Selection::Terminal
}
