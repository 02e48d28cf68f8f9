//! Task units and their result envelopes.
//!
//! A [`Task`] pairs a callable with its JSON argument list and a criticality
//! flag. Executing one produces a [`TaskResult`]: the returned value, the
//! text the callable printed to stdout, and any error it raised.

use crate::error::{ForkpoolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Signature of a task body: JSON arguments in, JSON value or error out.
pub type TaskFn =
    Arc<dyn Fn(&[Value]) -> std::result::Result<Value, TaskError> + Send + Sync + 'static>;

/// Generate a prefixed unique identifier, e.g. `task_9f8a…`.
pub(crate) fn fresh_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// One unit of work submitted to the pool.
///
/// The id is assigned at creation and everything else is fixed from then on;
/// the only later state change is the started flag, set exactly once when the
/// task is handed to a worker.
#[derive(Clone)]
pub struct Task {
    id: String,
    callable: TaskFn,
    args: Vec<Value>,
    critical: bool,
    started: bool,
}

impl Task {
    /// Create a non-critical task from a callable and its arguments.
    pub fn new<F>(callable: F, args: Vec<Value>) -> Self
    where
        F: Fn(&[Value]) -> std::result::Result<Value, TaskError> + Send + Sync + 'static,
    {
        Self {
            id: fresh_id("task"),
            callable: Arc::new(callable),
            args,
            critical: false,
            started: false,
        }
    }

    /// Mark this task critical: if it errors, the whole run fails once its
    /// result is collected.
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn callable(&self) -> TaskFn {
        Arc::clone(&self.callable)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn is_critical(&self) -> bool {
        self.critical
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Record the hand-off to a worker. Settable exactly once.
    pub(crate) fn mark_started(&mut self) -> Result<()> {
        if self.started {
            return Err(ForkpoolError::Contract(format!(
                "task {} has already been marked as started",
                self.id
            )));
        }
        self.started = true;
        Ok(())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("args", &self.args)
            .field("critical", &self.critical)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

/// Error raised inside a task or fork body.
///
/// This is the structured error descriptor that crosses the process boundary;
/// it round-trips through the wire format unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    message: String,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Build from a payload recovered by `std::panic::catch_unwind`.
    pub(crate) fn from_panic(panic: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "task panicked".to_string()
        };
        Self { message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result of executing one [`Task`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    value: Option<Value>,
    output: String,
    error: Option<TaskError>,
    critical: bool,
}

impl TaskResult {
    pub fn new(
        value: Option<Value>,
        output: String,
        error: Option<TaskError>,
        critical: bool,
    ) -> Self {
        Self {
            value,
            output,
            error,
            critical,
        }
    }

    /// The value the task body returned, absent if it errored.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Everything the task body wrote to stdout while it ran.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.error.as_ref()
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Whether the owning task was marked critical.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// The error, if this result must abort the run: errored and critical.
    pub fn critical_error(&self) -> Option<&TaskError> {
        if self.critical { self.error.as_ref() } else { None }
    }
}
