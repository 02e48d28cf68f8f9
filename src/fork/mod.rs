//! Process lifecycle: fork handles, the fork point, and stdout capture.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │  Parent process  │
//!                  │  (orchestrator)  │
//!                  └────────┬─────────┘
//!                           │ fork(2) + socketpair
//!            ┌──────────────┼──────────────┐
//!            │              │              │
//!      ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!      │  Fork 1   │  │  Fork 2   │  │  Fork N   │
//!      │ (process) │  │ (process) │  │ (process) │
//!      └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! Each child shares no mutable memory with the parent after the fork point;
//! coordination is message passing over the per-fork [`crate::channel::Channel`].

mod capture;
mod handle;
mod spawn;


pub use capture::StdoutCapture;
pub use handle::{Fork, ForkBody, MIN_KILL_GRACE, Role};
pub use spawn::{spawn_fork, spawn_fork_with_registry, with_process_rng};
