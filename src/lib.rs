//! Tasker: run module exports in isolated execution contexts.

pub mod codec;
pub mod config;
pub mod error;
pub mod modules;
pub mod paths;
pub mod worker;

pub use config::TaskerConfig;
pub use error::{ErrorKind, ErrorRecord, ManagerError, TaskError, ThrownError};
pub use modules::{ExportTable, ModuleRegistry, ModuleResolver, RemoteResolver, SchemeResolver};
pub use worker::{CancelOutcome, PoolStats, ShutdownReport, Task, TaskId, TaskResult, Tasker};
