//! Process handle for forked children.
//!
//! A [`Fork`] owns one side of a fork: its role, the child's pid (parent side
//! only), the communication channel, and the body to run in the child. The
//! parent drives the lifecycle through [`Fork::wait_for_completion`],
//! [`Fork::kill`] and [`Fork::is_running`].

use crate::channel::{Channel, Message, Payload, Topic};
use crate::error::{ForkpoolError, Result};
use crate::fork::capture::StdoutCapture;
use crate::task::{TaskError, fresh_id};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use serde_json::Value;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Interval between non-blocking exit-status polls.
pub(crate) const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Smallest allowed SIGTERM-to-SIGKILL grace period.
pub const MIN_KILL_GRACE: Duration = Duration::from_millis(200);

/// Which side of the fork point a handle represents. Set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Parent,
    Child,
}

/// Body run inside the child process, with access to its own fork handle
/// (and through it, the channel back to the parent).
pub type ForkBody =
    Box<dyn FnOnce(&mut Fork) -> std::result::Result<Value, TaskError> + 'static>;

/// One forked OS process plus its channel.
pub struct Fork {
    id: String,
    body: Option<ForkBody>,
    role: Option<Role>,
    child_pid: Option<Pid>,
    started: bool,
    reaped: bool,
    channel: Option<Channel>,
}

impl Fork {
    pub fn new(body: ForkBody) -> Self {
        Self {
            id: fresh_id("fork"),
            body: Some(body),
            role: None,
            child_pid: None,
            started: false,
            reaped: false,
            channel: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Record that this fork has been spawned. Settable exactly once.
    pub(crate) fn mark_started(&mut self) -> Result<()> {
        if self.started {
            return Err(ForkpoolError::Contract(format!(
                "fork {} has already been started",
                self.id
            )));
        }
        self.started = true;
        Ok(())
    }

    pub fn role(&self) -> Result<Role> {
        self.role.ok_or_else(|| {
            ForkpoolError::Contract(format!("role has not been set for fork {}", self.id))
        })
    }

    pub(crate) fn set_role(&mut self, role: Role) -> Result<()> {
        if self.role.is_some() {
            return Err(ForkpoolError::Contract(format!(
                "role has already been set for fork {}",
                self.id
            )));
        }
        self.role = Some(role);
        Ok(())
    }

    pub fn child_pid(&self) -> Result<Pid> {
        self.child_pid.ok_or_else(|| {
            ForkpoolError::Contract(format!("child pid has not been set for fork {}", self.id))
        })
    }

    pub(crate) fn set_child_pid(&mut self, pid: Pid) -> Result<()> {
        if self.child_pid.is_some() {
            return Err(ForkpoolError::Contract(format!(
                "child pid has already been set for fork {}",
                self.id
            )));
        }
        self.child_pid = Some(pid);
        Ok(())
    }

    pub(crate) fn set_channel(&mut self, channel: Channel) {
        self.channel = Some(channel);
    }

    /// The channel half owned by this side of the fork.
    pub fn channel(&mut self) -> Result<&mut Channel> {
        self.channel.as_mut().ok_or_else(|| {
            ForkpoolError::Contract(format!(
                "fork {} has no channel; it has not been spawned",
                self.id
            ))
        })
    }

    /// Child-side body wrapper.
    ///
    /// Emits `fork_start`, runs the body with stdout captured and panics
    /// contained, then always emits `fork_error` (on failure only) followed
    /// by `fork_output`, `fork_result` and `fork_complete`, in that order.
    /// Task-level failures travel as messages; the process itself still
    /// exits with a success status.
    pub(crate) fn execute(&mut self) {
        let fork_id = self.id.clone();
        self.post(Message::new(Topic::ForkStart).with_sender(fork_id.as_str()));

        let body = self.body.take();
        let mut value = None;
        let mut error = None;
        let mut output = String::new();

        match StdoutCapture::begin() {
            Ok(capture) => {
                let result = catch_unwind(AssertUnwindSafe(|| match body {
                    Some(body) => body(self),
                    None => Err(TaskError::new("fork body already consumed")),
                }));
                output = capture.finish().unwrap_or_default();
                match result {
                    Ok(Ok(v)) => value = Some(v),
                    Ok(Err(e)) => error = Some(e),
                    Err(panic) => error = Some(TaskError::from_panic(panic)),
                }
            }
            Err(e) => error = Some(TaskError::new(format!("stdout capture failed: {e}"))),
        }

        if let Some(error) = &error {
            self.post(
                Message::new(Topic::ForkError)
                    .with_payload(Payload::Error {
                        error: error.clone(),
                    })
                    .with_sender(fork_id.as_str()),
            );
        }
        self.post(
            Message::new(Topic::ForkOutput)
                .with_payload(Payload::Text { text: output })
                .with_sender(fork_id.as_str()),
        );
        let result_payload = match value {
            Some(value) => Payload::Value { value },
            None => Payload::Empty,
        };
        self.post(
            Message::new(Topic::ForkResult)
                .with_payload(result_payload)
                .with_sender(fork_id.as_str()),
        );
        self.post(Message::new(Topic::ForkComplete).with_sender(fork_id.as_str()));
    }

    /// Best-effort send used by the child-side wrapper.
    fn post(&mut self, message: Message) {
        if let Some(channel) = self.channel.as_mut()
            && let Err(err) = channel.send(&message)
        {
            trace!(fork_id = %self.id, %err, "child message dropped");
        }
    }

    /// Parent-only: wait for the child to exit.
    ///
    /// Polls the exit status every 100 ms up to `timeout`; with no timeout,
    /// blocks until exit. On timeout the child is killed and a timeout error
    /// is returned. The channel is closed (with a final drain) on every
    /// path.
    pub fn wait_for_completion(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.require_parent("wait_for_completion")?;
        let pid = self.child_pid()?;

        let outcome = match timeout {
            None => self.reap_blocking(pid),
            Some(limit) => {
                let start = Instant::now();
                loop {
                    if self.poll_exit(pid)? {
                        break Ok(());
                    }
                    if start.elapsed() >= limit {
                        self.kill(MIN_KILL_GRACE)?;
                        break Err(ForkpoolError::Timeout {
                            fork_id: self.id.clone(),
                            seconds: limit.as_secs(),
                        });
                    }
                    thread::sleep(EXIT_POLL_INTERVAL);
                }
            }
        };

        let closed = self.close_channel();
        outcome.and(closed)
    }

    /// Parent-only: terminate the child.
    ///
    /// Sends SIGTERM, waits the grace period (floored at 200 ms), and sends
    /// SIGKILL if the child is still alive, blocking until it is reaped.
    /// Closes the channel afterwards.
    pub fn kill(&mut self, grace: Duration) -> Result<()> {
        self.require_parent("kill")?;
        let pid = self.child_pid()?;
        let grace = grace.max(MIN_KILL_GRACE);

        if !self.poll_exit(pid)? {
            let _ = signal::kill(pid, Signal::SIGTERM);
            thread::sleep(grace);
            if !self.poll_exit(pid)? {
                warn!(fork_id = %self.id, %pid, "child survived SIGTERM grace, escalating to SIGKILL");
                let _ = signal::kill(pid, Signal::SIGKILL);
                self.reap_blocking(pid)?;
            }
        }

        self.close_channel()
    }

    /// Parent-only: non-blocking liveness probe.
    pub fn is_running(&mut self) -> Result<bool> {
        self.require_parent("is_running")?;
        let pid = self.child_pid()?;
        Ok(!self.poll_exit(pid)?)
    }

    fn require_parent(&self, op: &str) -> Result<()> {
        match self.role {
            Some(Role::Parent) => Ok(()),
            Some(Role::Child) => Err(ForkpoolError::Contract(format!(
                "{op} is a parent-only operation, called on child-role fork {}",
                self.id
            ))),
            None => Err(ForkpoolError::Contract(format!(
                "{op} called on fork {} before it was spawned",
                self.id
            ))),
        }
    }

    /// Non-blocking exit check. Remembers a reaped child so later probes do
    /// not hit ECHILD.
    fn poll_exit(&mut self, pid: Pid) -> Result<bool> {
        if self.reaped {
            return Ok(true);
        }
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(false),
            Ok(status) => {
                debug!(fork_id = %self.id, ?status, "child exited");
                self.reaped = true;
                Ok(true)
            }
            Err(Errno::ECHILD) => {
                self.reaped = true;
                Ok(true)
            }
            Err(e) => Err(ForkpoolError::Lifecycle(format!(
                "waitpid failed for {pid}: {e}"
            ))),
        }
    }

    fn reap_blocking(&mut self, pid: Pid) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        match waitpid(pid, None) {
            Ok(status) => {
                debug!(fork_id = %self.id, ?status, "child reaped");
                self.reaped = true;
                Ok(())
            }
            Err(Errno::ECHILD) => {
                self.reaped = true;
                Ok(())
            }
            Err(e) => Err(ForkpoolError::Lifecycle(format!(
                "waitpid failed for {pid}: {e}"
            ))),
        }
    }

    fn close_channel(&mut self) -> Result<()> {
        match self.channel.as_mut() {
            Some(channel) => channel.close(false),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Fork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fork")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("child_pid", &self.child_pid)
            .field("started", &self.started)
            .field("reaped", &self.reaped)
            .finish_non_exhaustive()
    }
}

impl Drop for Fork {
    fn drop(&mut self) {
        // Parent-side cleanup: no zombie may outlive its handle.
        if self.reaped || self.role != Some(Role::Parent) {
            return;
        }
        let Some(pid) = self.child_pid else {
            return;
        };
        let _ = signal::kill(pid, Signal::SIGTERM);
        thread::sleep(Duration::from_millis(20));
        if let Ok(WaitStatus::StillAlive) = waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            let _ = signal::kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
        self.reaped = true;
    }
}
