//! Task types: the unit of work submitted to the manager.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{self, Argument};
use crate::error::{CodecError, TaskError};

/// Correlation identifier for a task, carried in every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Placeholder id for replies to requests whose id could not be read.
    pub fn nil() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One request to invoke a named export of a module with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Local path or remote URL of the module.
    pub module_reference: String,
    /// Name of the export to invoke.
    pub tasker_name: String,
    /// Positional arguments.
    pub parameters: Vec<Argument>,
    /// Per-task deadline; overrides the configured default.
    pub timeout: Option<Duration>,
}

impl Task {
    pub fn new(module_reference: impl Into<String>, tasker_name: impl Into<String>) -> Self {
        Self {
            module_reference: module_reference.into(),
            tasker_name: tasker_name.into(),
            parameters: Vec::new(),
            timeout: None,
        }
    }

    /// Append an argument, converting it to its wire form.
    pub fn arg<T: Serialize>(mut self, value: T) -> Result<Self, CodecError> {
        self.parameters.push(codec::to_argument(&value)?);
        Ok(self)
    }

    /// Append arguments that are already in wire form.
    pub fn args(mut self, values: impl IntoIterator<Item = Argument>) -> Self {
        self.parameters.extend(values);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of a task: the function's result, or a structured failure.
pub type TaskResult = Result<serde_json::Value, TaskError>;

/// Receives a task's outcome. Called exactly once per submitted task.
pub type TaskerCallback = Box<dyn FnOnce(TaskResult) + Send + 'static>;
