//! Modelos neutrales: `TaskList` (stages + tasks) y la vista tipada de los
//! campos que el motor persiste en cada documento.

pub mod document;
pub mod task_list;

pub use document::{read_completed_at, read_leases, read_task_list, DocumentRef, Fields, LeaseTable, PipelineStatus};
pub use task_list::{Stage, Task, TaskList};
