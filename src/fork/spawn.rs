//! The fork point.
//!
//! Creates the transport pair, duplicates the process, and wires each branch
//! to its half of the channel. The child branch locks its inherited registry
//! copy, re-seeds the process RNG (forked siblings must not share the
//! parent's generator state), runs the fork body, and exits with a success
//! status regardless of the body outcome: failures are reported as messages,
//! not exit codes.

use crate::channel::Channel;
use crate::error::{ForkpoolError, Result};
use crate::fork::handle::{Fork, Role};
use crate::registry::SharedRegistry;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::ForkResult;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::sync::{Mutex, Once};
use tracing::debug;

/// Process-global RNG. Re-seeded once at child startup; lazily seeded from
/// OS entropy everywhere else.
static PROCESS_RNG: Mutex<Option<SmallRng>> = Mutex::new(None);

static PARENT_INIT: Once = Once::new();

/// Run a closure against the process-global RNG.
pub fn with_process_rng<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    let mut guard = PROCESS_RNG.lock().expect("process rng mutex poisoned");
    let rng = guard.get_or_insert_with(SmallRng::from_entropy);
    f(rng)
}

fn reseed_process_rng() {
    *PROCESS_RNG.lock().expect("process rng mutex poisoned") =
        Some(SmallRng::from_entropy());
}

/// SIGPIPE must surface as an io error on the channel, not kill the process.
fn ignore_sigpipe() {
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
    }
}

/// One-time parent-process setup before the first fork.
fn parent_init() {
    PARENT_INIT.call_once(ignore_sigpipe);
}

/// Child-branch setup, run before anything else in the new process.
fn child_init(registry: Option<&SharedRegistry>) {
    if let Some(registry) = registry {
        registry
            .lock()
            .expect("task registry mutex poisoned")
            .lock();
    }
    reseed_process_rng();
    ignore_sigpipe();
}

/// Spawn a fork with no task registry attached.
pub fn spawn_fork(fork: &mut Fork) -> Result<()> {
    spawn_with(fork, None)
}

/// Spawn a fork whose child branch freezes the given registry copy.
pub fn spawn_fork_with_registry(fork: &mut Fork, registry: &SharedRegistry) -> Result<()> {
    spawn_with(fork, Some(registry))
}

fn spawn_with(fork: &mut Fork, registry: Option<&SharedRegistry>) -> Result<()> {
    fork.mark_started()?;
    parent_init();

    let (child_half, parent_half) = Channel::pair()
        .map_err(|e| ForkpoolError::Lifecycle(format!("failed to create socket pair: {e}")))?;

    // SAFETY: the child branch runs only async-signal-safe-adjacent setup,
    // the fork body, and then exits without returning to the caller.
    match unsafe { nix::unistd::fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(child_half);
            fork.set_role(Role::Parent)?;
            fork.set_child_pid(child)?;
            fork.set_channel(parent_half);
            debug!(fork_id = %fork.id(), pid = %child, "forked child process");
            Ok(())
        }
        Ok(ForkResult::Child) => {
            child_init(registry);
            drop(parent_half);
            // A fresh fork cannot have a role yet; never unwind in the child.
            let _ = fork.set_role(Role::Child);
            fork.set_channel(child_half);

            fork.execute();

            if let Ok(channel) = fork.channel() {
                let _ = channel.close(true);
            }
            std::process::exit(0);
        }
        Err(e) => Err(ForkpoolError::Lifecycle(format!(
            "fork system call failed: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_process_rng_is_usable_without_reseed() {
        let a: u64 = with_process_rng(|rng| rng.gen_range(0..1_000_000));
        let b: u64 = with_process_rng(|rng| rng.gen_range(0..1_000_000));
        assert!(a < 1_000_000 && b < 1_000_000);
    }

    #[test]
    fn test_reseed_replaces_generator_state() {
        // Draw, reseed, draw again: the call must not panic and must keep
        // producing values. (Statistical divergence is not assertable.)
        let _ = with_process_rng(|rng| rng.gen_range(0..u64::MAX));
        reseed_process_rng();
        let _ = with_process_rng(|rng| rng.gen_range(0..u64::MAX));
    }

    #[test]
    fn test_spawn_refuses_restart() {
        let mut fork = Fork::new(Box::new(|_| Ok(serde_json::Value::Null)));
        fork.mark_started().unwrap();
        assert!(matches!(
            spawn_fork(&mut fork),
            Err(ForkpoolError::Contract(_))
        ));
    }
}
