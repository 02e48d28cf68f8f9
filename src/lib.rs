//! forkpool - process-based parallel task execution.
//!
//! Runs user-supplied tasks in forked OS processes, coordinates each worker
//! over a private message-framed channel, and returns per-task results
//! (value, captured output, error) to the caller. Built for environments
//! without shared-memory threading: isolation comes from `fork(2)`, and all
//! coordination is explicit message passing.
//!
//! # Example
//!
//! ```no_run
//! use forkpool::{ForkPool, Task};
//! use serde_json::json;
//!
//! let tasks: Vec<Task> = (0..8)
//!     .map(|n| Task::new(move |_| Ok(json!(n * n)), vec![]))
//!     .collect();
//!
//! let mut pool = ForkPool::new();
//! let results = pool.run_tasks(tasks, 4)?;
//! for (task_id, result) in &results {
//!     println!("{task_id}: {:?}", result.value());
//! }
//! # Ok::<(), forkpool::ForkpoolError>(())
//! ```

pub mod backoff;
pub mod channel;
pub mod error;
pub mod fork;
pub mod logging;
pub mod pool;
pub mod registry;
pub mod task;

pub use backoff::{ExponentialBackoff, Jitter};
pub use channel::{Channel, Message, Payload, Topic};
pub use error::{ForkpoolError, Result};
pub use fork::{Fork, ForkBody, Role, spawn_fork, spawn_fork_with_registry};
pub use pool::{ForkPool, PoolConfig};
pub use registry::{SharedRegistry, TaskRegistry, shared_registry};
pub use task::{Task, TaskError, TaskFn, TaskResult};
