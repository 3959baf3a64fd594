//! Worker system: isolated execution contexts and the manager that feeds them.
//!
//! Core components:
//! - `task`: Task, TaskId and callback types
//! - `state`: Context state machine (Idle ⇄ Busy → Terminated)
//! - `adapter`: Request handling inside a context
//! - `context`: Context threads and their channels
//! - `manager`: `Tasker`: pooling, queueing, correlation, timeouts, shutdown

pub mod adapter;
pub mod context;
pub mod manager;
pub mod state;
pub mod task;

pub use adapter::Adapter;
pub use context::{ContextEvent, ContextId, ExecutionContext, ExitCause};
pub use manager::{CancelOutcome, PoolStats, ShutdownReport, Tasker};
pub use state::{ContextLifecycle, ContextState};
pub use task::{Task, TaskId, TaskResult, TaskerCallback};
