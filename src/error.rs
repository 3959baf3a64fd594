//! Error types for Tasker.
//!
//! Two layers live here. The Rust error enums (`CodecError`, `ResolveError`,
//! `ConfigError`, `ManagerError`) are what library code propagates with `?`.
//! `ErrorRecord` is the plain-data projection that crosses the isolation
//! boundary and reaches callers as a `TaskError`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Errors raised while packing or unpacking a message frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Value is not representable: {0}")]
    Serialization(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Value nesting depth {depth} exceeds the limit of {limit}")]
    TooDeep { depth: usize, limit: usize },

    #[error("Malformed message frame: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Module resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("Module {reference} not found")]
    NotFound { reference: String },

    #[error("No resolver handles module reference {reference}")]
    Unsupported { reference: String },

    #[error("Failed to fetch module {reference}: {reason}")]
    Fetch { reference: String, reason: String },

    #[error("Module {reference} has an invalid manifest: {reason}")]
    InvalidManifest { reference: String, reason: String },
}

/// Manager-level failures. These never describe a single task's outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("{count} execution context(s) did not exit after termination")]
    ContextsUnresponsive { count: usize },

    #[error("Tasker manager has already stopped")]
    Stopped,
}

/// Category of a task failure, carried across the isolation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A parameter or result could not cross the boundary.
    Serialization,
    /// The target module could not be loaded.
    ModuleResolution,
    /// The named export is missing or not callable.
    ExportNotFound,
    /// The execution context died while the task was in flight.
    ContextTerminated,
    /// The task exceeded its deadline.
    TaskTimeout,
    /// The task was cancelled before dispatch.
    TaskCancelled,
    /// The target function itself failed.
    Execution,
    /// The manager is shutting down and refused the task.
    Rejected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Serialization => "serialization",
            Self::ModuleResolution => "module_resolution",
            Self::ExportNotFound => "export_not_found",
            Self::ContextTerminated => "context_terminated",
            Self::TaskTimeout => "task_timeout",
            Self::TaskCancelled => "task_cancelled",
            Self::Execution => "execution",
            Self::Rejected => "rejected",
        };
        write!(f, "{s}")
    }
}

/// Plain-data projection of an error (kind, name, message, stack).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorRecord {
    /// Create a record without a stack.
    pub fn new(kind: ErrorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack (or cause chain).
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Project an error returned by a target function.
    ///
    /// A `ThrownError` anywhere in the chain supplies the name (and its stack,
    /// if it carries one); otherwise the name is `"Error"` and the remaining
    /// causes become the stack.
    pub fn from_thrown(err: &anyhow::Error) -> Self {
        let thrown = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<ThrownError>());
        let name = thrown
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "Error".to_string());

        if let Some(stack) = thrown.and_then(|t| t.stack.clone()) {
            return Self::new(ErrorKind::Execution, name, err.to_string()).with_stack(stack);
        }

        let causes: Vec<String> = err.chain().skip(1).map(|c| c.to_string()).collect();
        let record = Self::new(ErrorKind::Execution, name, err.to_string());
        if causes.is_empty() {
            record
        } else {
            record.with_stack(
                causes
                    .iter()
                    .map(|c| format!("caused by: {c}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, "SerializationError", message)
    }

    pub fn module_resolution(err: &ResolveError) -> Self {
        Self::new(
            ErrorKind::ModuleResolution,
            "ModuleResolutionError",
            err.to_string(),
        )
    }

    pub fn export_not_found(module: &str, export: &str, reason: &str) -> Self {
        Self::new(
            ErrorKind::ExportNotFound,
            "ExportNotFoundError",
            format!("Export {export} of module {module} {reason}"),
        )
    }

    pub fn context_terminated(message: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ContextTerminated,
            "ContextTerminatedError",
            message,
        )
    }

    pub fn timeout(after_ms: u128) -> Self {
        Self::new(
            ErrorKind::TaskTimeout,
            "TaskTimeoutError",
            format!("Task exceeded its deadline of {after_ms}ms"),
        )
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TaskCancelled, "TaskCancelledError", message)
    }

    pub fn rejected() -> Self {
        Self::new(
            ErrorKind::Rejected,
            "RejectedError",
            "Tasker is shutting down and no longer accepts tasks",
        )
    }
}

/// A named error a target function can return to control the reported name.
///
/// ```ignore
/// Err(ThrownError::new("RangeError", "index out of bounds").into())
/// ```
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ThrownError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ThrownError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Failure delivered to a task's caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}: {}: {}", .record.kind, .record.name, .record.message)]
pub struct TaskError {
    pub record: ErrorRecord,
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        self.record.kind
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn message(&self) -> &str {
        &self.record.message
    }

    pub fn stack(&self) -> Option<&str> {
        self.record.stack.as_deref()
    }
}

impl From<ErrorRecord> for TaskError {
    fn from(record: ErrorRecord) -> Self {
        Self { record }
    }
}
