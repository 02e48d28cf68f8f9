//! Shared task table for forked workers.
//!
//! The parent fills the registry before any fork occurs; each child inherits
//! an independent copy-on-write copy at the fork point and locks it
//! immediately, so no mutation is possible (or needed) inside workers.

use crate::error::{ForkpoolError, Result};
use crate::task::Task;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry handle shared between the orchestrator and worker fork bodies.
pub type SharedRegistry = Arc<Mutex<TaskRegistry>>;

/// Write-once-then-frozen mapping from task id to [`Task`].
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Task>,
    locked: bool,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one task. Refused once the registry is locked.
    pub fn add_task(&mut self, task: Task) -> Result<()> {
        if self.locked {
            return Err(ForkpoolError::Contract(
                "cannot add task to a locked registry".into(),
            ));
        }
        self.tasks.insert(task.id().to_string(), task);
        Ok(())
    }

    /// Insert a batch of tasks. Refused once the registry is locked.
    pub fn add_tasks(&mut self, tasks: Vec<Task>) -> Result<()> {
        for task in tasks {
            self.add_task(task)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Record the hand-off of a task to a worker.
    pub(crate) fn mark_task_started(&mut self, id: &str) -> Result<()> {
        let task = self
            .tasks
            .get_mut(id)
            .ok_or_else(|| ForkpoolError::InvalidTask(format!("unknown task id {id}")))?;
        task.mark_started()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Freeze the registry. Called in the child branch of every fork so
    /// workers cannot modify or clear their inherited copy.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Clear the registry between runs. Refused while locked.
    pub fn reset(&mut self) -> Result<()> {
        if self.locked {
            return Err(ForkpoolError::Contract(
                "cannot reset a locked registry".into(),
            ));
        }
        self.tasks.clear();
        Ok(())
    }
}

/// Create an empty shared registry.
pub fn shared_registry() -> SharedRegistry {
    Arc::new(Mutex::new(TaskRegistry::new()))
}
