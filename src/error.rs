//! Error types for forkpool.

use crate::task::TaskError;
use thiserror::Error;

/// Main error type for forkpool.
#[derive(Error, Debug)]
pub enum ForkpoolError {
    /// A task failed validation before any process was spawned.
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Transport-pair creation or the fork system call failed.
    #[error("process lifecycle error: {0}")]
    Lifecycle(String),

    /// A child process did not exit within its wait window and was terminated.
    #[error("fork {fork_id} timed out and was terminated after {seconds} seconds")]
    Timeout { fork_id: String, seconds: u64 },

    /// A set-once field was set twice, queried before being set, or a
    /// parent-only operation was invoked on a child-role handle.
    #[error("contract violation: {0}")]
    Contract(String),

    /// A wire frame could not be decoded. Corrupt and truncated frames are
    /// fatal, never skipped.
    #[error("message decode failed: {0}")]
    Decode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Every worker process has failed; the run cannot make progress.
    #[error("all worker processes have failed: {0}")]
    AllWorkersFailed(String),

    /// A task marked critical reported an error; the run is aborted.
    #[error("critical task {task_id} failed: {source}")]
    CriticalTask {
        task_id: String,
        #[source]
        source: TaskError,
    },

    /// The backoff exceeded its configured attempt budget.
    #[error("maximum number of backoff attempts reached ({attempts})")]
    BackoffExhausted { attempts: u32 },

    /// Run-level wrapper: every failure inside a pool run surfaces as this
    /// single shape.
    #[error("parallel execution failed: {source}")]
    Run {
        #[source]
        source: Box<ForkpoolError>,
    },
}

impl ForkpoolError {
    /// Wrap an error into the run-level shape. Already-wrapped errors are
    /// passed through unchanged.
    pub(crate) fn into_run_error(self) -> Self {
        match self {
            err @ ForkpoolError::Run { .. } => err,
            other => ForkpoolError::Run {
                source: Box::new(other),
            },
        }
    }
}

/// Result type alias for forkpool operations.
pub type Result<T> = std::result::Result<T, ForkpoolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_message() {
        let err = ForkpoolError::Timeout {
            fork_id: "fork_a1".into(),
            seconds: 60,
        };
        let msg = err.to_string();
        assert!(msg.contains("fork_a1"));
        assert!(msg.contains("60 seconds"));
    }

    #[test]
    fn test_critical_task_error_chain() {
        use std::error::Error as _;

        let err = ForkpoolError::CriticalTask {
            task_id: "task_9".into(),
            source: TaskError::new("division by zero"),
        };
        assert!(err.to_string().contains("task_9"));
        assert!(
            err.source()
                .expect("critical task error must carry a source")
                .to_string()
                .contains("division by zero")
        );
    }

    #[test]
    fn test_run_error_wraps_once() {
        let inner = ForkpoolError::AllWorkersFailed("boom".into());
        let wrapped = inner.into_run_error();
        assert!(matches!(wrapped, ForkpoolError::Run { .. }));

        // A second wrap must not nest another Run layer.
        let rewrapped = wrapped.into_run_error();
        match rewrapped {
            ForkpoolError::Run { source } => {
                assert!(matches!(*source, ForkpoolError::AllWorkersFailed(_)))
            }
            other => panic!("expected Run, got {other:?}"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: ForkpoolError = io_err.into();
        assert!(err.to_string().contains("pipe closed"));
    }
}
