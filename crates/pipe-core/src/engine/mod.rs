//! Coordinación del pipeline: entry points (`on_create` / `on_update`), el
//! bucle explícito `drive` y el dispatcher que consume el feed de cambios.

pub mod builder;
pub mod coordinator;
pub mod dispatcher;
pub mod outcome;

pub use builder::CoordinatorBuilder;
pub use coordinator::PipelineCoordinator;
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherHandle, RedeliveryPolicy};
pub use outcome::{CreateOutcome, EventOutcome, SkipReason, UpdateOutcome};
