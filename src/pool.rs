//! Worker-pool orchestration.
//!
//! The pool forks N workers, each running a pull-based task loop, and
//! multiplexes their channels from a single thread by cooperative polling:
//! idle workers announce `ready_for_task`, the dispatcher answers with
//! `new_task`, finished work comes back as `thread_result`. Once every task
//! has been handed off the pool broadcasts `shutdown`, waits for the worker
//! processes to exit, and drains the remaining results.

use crate::channel::{Message, Payload, Topic};
use crate::error::{ForkpoolError, Result};
use crate::fork::{Fork, StdoutCapture, spawn_fork_with_registry};
use crate::registry::{SharedRegistry, shared_registry};
use crate::task::{Task, TaskError, TaskResult};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Tuning knobs for a pool run.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cycle length of the cooperative polling loops.
    pub poll_interval: Duration,
    /// How long a worker may take to exit after `shutdown` before it is
    /// force-killed.
    pub worker_exit_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace period (floored at 200 ms by the handle).
    pub kill_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            worker_exit_timeout: Duration::from_secs(60),
            kill_grace: Duration::from_millis(200),
        }
    }
}

/// Process-based parallel task executor.
#[derive(Debug)]
pub struct ForkPool {
    registry: SharedRegistry,
    config: PoolConfig,
}

impl Default for ForkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ForkPool {
    pub fn new() -> Self {
        Self::with_config(PoolConfig::default())
    }

    pub fn with_config(config: PoolConfig) -> Self {
        Self {
            registry: shared_registry(),
            config,
        }
    }

    /// Run a batch of tasks across at most `max_concurrent` worker processes
    /// and return the mapping from task id to [`TaskResult`].
    ///
    /// Failure semantics are two-tier: an error inside a task body lands in
    /// that task's result and does not stop the pool (unless the task was
    /// critical); a worker-process failure shrinks the pool and only aborts
    /// the run once no workers remain. Every failure surfaces as the single
    /// run-level [`ForkpoolError::Run`] shape, and the registry is reset
    /// whether the run succeeded or not.
    pub fn run_tasks(
        &mut self,
        tasks: Vec<Task>,
        max_concurrent: usize,
    ) -> Result<HashMap<String, TaskResult>> {
        let outcome = self.run_tasks_inner(tasks, max_concurrent);

        if let Err(err) = self
            .registry
            .lock()
            .expect("task registry mutex poisoned")
            .reset()
        {
            warn!(%err, "task registry reset failed");
        }

        outcome.map_err(ForkpoolError::into_run_error)
    }

    fn run_tasks_inner(
        &mut self,
        tasks: Vec<Task>,
        max_concurrent: usize,
    ) -> Result<HashMap<String, TaskResult>> {
        if tasks.is_empty() {
            return Ok(HashMap::new());
        }
        for task in &tasks {
            if task.is_started() {
                return Err(ForkpoolError::InvalidTask(format!(
                    "task {} has already been started",
                    task.id()
                )));
            }
        }

        let worker_count = max_concurrent.clamp(1, tasks.len());
        let mut queue: VecDeque<String> =
            tasks.iter().map(|t| t.id().to_string()).collect();

        self.registry
            .lock()
            .expect("task registry mutex poisoned")
            .add_tasks(tasks)?;

        info!(
            workers = worker_count,
            tasks = queue.len(),
            "starting worker pool"
        );

        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let registry = SharedRegistry::clone(&self.registry);
            let poll_interval = self.config.poll_interval;
            let mut worker = Fork::new(Box::new(move |fork| {
                worker_loop(fork, &registry, poll_interval)
            }));
            spawn_fork_with_registry(&mut worker, &self.registry)?;
            workers.push(worker);
        }

        self.dispatch(&mut workers, &mut queue)?;

        for worker in &mut workers {
            let _ = worker.channel()?.send(&Message::new(Topic::Shutdown));
        }

        for worker in &mut workers {
            worker.wait_for_completion(Some(self.config.worker_exit_timeout))?;
        }

        self.collect_results(&mut workers)
    }

    /// Hand every queued task to a ready worker. Returns once all tasks have
    /// been handed off (not necessarily completed).
    fn dispatch(&mut self, workers: &mut Vec<Fork>, queue: &mut VecDeque<String>) -> Result<()> {
        let half_cycle = self.config.poll_interval / 2;
        let mut last_failure: Option<TaskError> = None;

        while !queue.is_empty() {
            thread::sleep(half_cycle);

            let mut failed = Vec::new();
            'workers: for (idx, worker) in workers.iter_mut().enumerate() {
                for _ready in worker.channel()?.receive(false, Some(Topic::ReadyForTask))? {
                    let Some(task_id) = queue.pop_front() else {
                        break 'workers;
                    };
                    let delivered = worker.channel()?.send(
                        &Message::new(Topic::NewTask).with_payload(Payload::Assignment {
                            task_id: task_id.clone(),
                        }),
                    )?;
                    if !delivered {
                        // The worker died behind its buffered ready messages;
                        // requeue and let the liveness check reap it.
                        queue.push_front(task_id);
                        break;
                    }
                    self.registry
                        .lock()
                        .expect("task registry mutex poisoned")
                        .mark_task_started(&task_id)?;
                    debug!(fork_id = %worker.id(), %task_id, remaining = queue.len(), "task dispatched");
                }

                for message in worker.channel()?.receive(false, Some(Topic::ForkError))? {
                    let error = match message.into_payload() {
                        Payload::Error { error } => error,
                        _ => TaskError::new("worker reported an error without details"),
                    };
                    warn!(fork_id = %worker.id(), %error, "worker reported a process-level failure");
                    last_failure = Some(error);
                    failed.push(idx);
                }

                // A worker killed externally never reports fork_error; its
                // exit still empties a pool slot.
                if !failed.contains(&idx) && !worker.is_running()? {
                    warn!(fork_id = %worker.id(), "worker process exited mid-run");
                    failed.push(idx);
                }
            }

            for idx in failed.into_iter().rev() {
                workers.remove(idx);
            }
            if workers.is_empty() && !queue.is_empty() {
                let detail = last_failure
                    .map(|e| e.message().to_string())
                    .unwrap_or_else(|| "no failure details reported".into());
                return Err(ForkpoolError::AllWorkersFailed(detail));
            }

            thread::sleep(half_cycle);
        }
        Ok(())
    }

    /// Blocking drain of `thread_result` messages from every worker.
    fn collect_results(&mut self, workers: &mut [Fork]) -> Result<HashMap<String, TaskResult>> {
        let mut results = HashMap::new();
        for worker in workers.iter_mut() {
            for message in worker.channel()?.receive(true, Some(Topic::ThreadResult))? {
                let Some(task_id) = message.reply_to().map(str::to_string) else {
                    return Err(ForkpoolError::Decode(
                        "thread_result without a reply correlation id".into(),
                    ));
                };
                let outcome = match message.into_payload() {
                    Payload::Outcome { outcome } => outcome,
                    other => {
                        return Err(ForkpoolError::Decode(format!(
                            "thread_result with unexpected payload {other:?}"
                        )));
                    }
                };
                if let Some(error) = outcome.critical_error() {
                    return Err(ForkpoolError::CriticalTask {
                        task_id,
                        source: error.clone(),
                    });
                }
                trace!(%task_id, errored = outcome.has_error(), "task result collected");
                results.insert(task_id, outcome);
            }
        }
        info!(results = results.len(), "worker pool run complete");
        Ok(results)
    }
}

/// Pull-based task loop run inside each worker process.
///
/// Announces readiness, then polls its channel each cycle: a `new_task`
/// message is looked up in the frozen registry copy, executed with output
/// capture and error containment, answered with `thread_result`, and
/// followed by a fresh `ready_for_task`. Messages are handled strictly in
/// arrival order, so a `shutdown` sharing a poll batch with a `new_task`
/// only takes effect after that task's result has been flushed.
fn worker_loop(
    fork: &mut Fork,
    registry: &SharedRegistry,
    poll_interval: Duration,
) -> std::result::Result<Value, TaskError> {
    let fork_id = fork.id().to_string();
    let channel_err = |e: ForkpoolError| TaskError::new(e.to_string());

    fork.channel()
        .map_err(channel_err)?
        .send(&Message::new(Topic::ReadyForTask).with_sender(fork_id.as_str()))
        .map_err(channel_err)?;

    loop {
        let messages = fork
            .channel()
            .map_err(channel_err)?
            .receive(false, None)
            .map_err(channel_err)?;

        for message in messages {
            match message.topic() {
                Topic::NewTask => {
                    let task_id = match message.into_payload() {
                        Payload::Assignment { task_id } => task_id,
                        other => {
                            return Err(TaskError::new(format!(
                                "new_task with unexpected payload {other:?}"
                            )));
                        }
                    };
                    let outcome = run_task(registry, &task_id)?;

                    let channel = fork.channel().map_err(channel_err)?;
                    channel
                        .send(
                            &Message::new(Topic::ThreadResult)
                                .with_payload(Payload::Outcome { outcome })
                                .with_sender(fork_id.as_str())
                                .with_reply_to(task_id.as_str()),
                        )
                        .map_err(channel_err)?;
                    channel
                        .send(&Message::new(Topic::ReadyForTask).with_sender(fork_id.as_str()))
                        .map_err(channel_err)?;
                }
                Topic::Shutdown => {
                    trace!(%fork_id, "worker shutting down");
                    return Ok(Value::Null);
                }
                other => {
                    trace!(%fork_id, topic = ?other, "worker ignoring unexpected topic");
                }
            }
        }

        thread::sleep(poll_interval);
    }
}

/// Execute one task from the registry, capturing its output and containing
/// any error or panic in the returned [`TaskResult`].
///
/// Only an unknown task id is escalated to the caller: that is a protocol
/// breakdown, not a task failure.
fn run_task(
    registry: &SharedRegistry,
    task_id: &str,
) -> std::result::Result<TaskResult, TaskError> {
    let (callable, args, critical) = {
        let guard = registry.lock().expect("task registry mutex poisoned");
        let task = guard
            .get(task_id)
            .ok_or_else(|| TaskError::new(format!("unknown task id {task_id}")))?;
        (task.callable(), task.args().to_vec(), task.is_critical())
    };

    let mut output = String::new();
    let mut value = None;
    let mut error = None;

    match StdoutCapture::begin() {
        Ok(capture) => {
            let result = catch_unwind(AssertUnwindSafe(|| callable(&args)));
            output = capture.finish().unwrap_or_default();
            match result {
                Ok(Ok(v)) => value = Some(v),
                Ok(Err(e)) => error = Some(e),
                Err(panic) => error = Some(TaskError::from_panic(panic)),
            }
        }
        Err(e) => error = Some(TaskError::new(format!("stdout capture failed: {e}"))),
    }

    Ok(TaskResult::new(value, output, error, critical))
}
