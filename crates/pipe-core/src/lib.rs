//! pipe-core: motor de pipelines dirigido por eventos de cambio de documento.
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod lease;
pub mod merge;
pub mod model;
pub mod registry;
pub mod selector;
pub mod store;
pub mod template;

pub use config::{stage_config, EngineSettings, PipelineCatalog};
pub use engine::{CoordinatorBuilder, CreateOutcome, DispatchStats, Dispatcher, DispatcherHandle, EventOutcome,
                 PipelineCoordinator, RedeliveryPolicy, SkipReason, UpdateOutcome};
pub use errors::{classify_error, ErrorClass, HandlerError, PipelineError, StoreError};
pub use lease::{LeaseGrant, LeaseManager};
pub use model::{DocumentRef, Fields, PipelineStatus, Stage, Task, TaskList};
pub use registry::{FnHandler, TaskHandler, TaskRegistry};
pub use selector::{select_next, Selection, TaskCursor};
pub use store::{ChangeEvent, ChangeFeed, Clock, DocumentStore, InMemoryDocumentStore, ManualClock, SystemClock,
                Transaction};
pub use template::{build_task_list, StageConfig};
