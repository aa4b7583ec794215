//! Construcción del `TaskList` inicial a partir de la configuración.
//!
//! Los stages se emiten en el orden de las claves de la configuración
//! (`IndexMap`), las tasks en el orden dado. Si el documento declara tasks
//! ad-hoc se añaden como un único stage sintético al final. No hay casos de
//! error: una configuración vacía produce un `TaskList` sin stages, que el
//! selector trata como terminal.

use indexmap::IndexMap;

use crate::model::{Stage, Task, TaskList};

/// Nombre de stage -> nombres de tasks, en orden.
pub type StageConfig = IndexMap<String, Vec<String>>;

pub fn build_task_list(config: &StageConfig, custom_tasks: Option<&[String]>, custom_stage_name: &str) -> TaskList {
    let mut stages: Vec<Stage> = config.iter()
                                       .map(|(name, tasks)| Stage { name: name.clone(),
                                                                    tasks: tasks.iter().map(Task::pending).collect() })
                                       .collect();
    if let Some(custom) = custom_tasks.filter(|c| !c.is_empty()) {
        stages.push(Stage { name: custom_stage_name.to_string(),
                            tasks: custom.iter().map(Task::pending).collect() });
    }
    TaskList::new(stages)
}
