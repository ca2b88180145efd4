//! Arena of live tasks plus the completed-task FIFO.
//!
//! Sub-inferences refer to tasks by [`TaskId`].  An entry is never removed
//! while `outstanding > 0`, so every id held by a queued or in-flight
//! sub-inference resolves.

use std::collections::{HashMap, VecDeque};

use tessera_core::error::{EngineError, Result};
use tessera_core::task::{PollResult, Task};

/// Stable handle to a task in the table.
pub type TaskId = u64;

#[derive(Debug)]
pub(crate) struct TaskEntry {
    pub task: Task,
    /// Sub-inferences queued or in flight.
    pub outstanding: usize,
    /// At least one sub-inference was dropped or failed post-processing.
    pub failed: bool,
}

impl TaskEntry {
    /// Whether the task can leave the table.
    pub fn is_settled(&self) -> bool {
        self.outstanding == 0 && (self.failed || self.task.is_complete())
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskTable {
    next_id: TaskId,
    entries: HashMap<TaskId, TaskEntry>,
    /// Asynchronous tasks in submission order.
    completion_order: VecDeque<TaskId>,
}

impl TaskTable {
    pub fn insert(&mut self, task: Task, track: bool) -> Result<TaskId> {
        self.entries
            .try_reserve(1)
            .map_err(|e| EngineError::Allocation(format!("task table: {e}")))?;
        if track {
            self.completion_order
                .try_reserve(1)
                .map_err(|e| EngineError::Allocation(format!("completed-task queue: {e}")))?;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TaskEntry {
                task,
                outstanding: 0,
                failed: false,
            },
        );
        if track {
            self.completion_order.push_back(id);
        }
        Ok(id)
    }

    pub fn get(&self, id: TaskId) -> Result<&TaskEntry> {
        self.entries
            .get(&id)
            .ok_or_else(|| EngineError::InvariantViolation(format!("task {id} is not live")))
    }

    pub fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskEntry> {
        self.entries
            .get_mut(&id)
            .ok_or_else(|| EngineError::InvariantViolation(format!("task {id} is not live")))
    }

    /// Remove an untracked (synchronous) task.
    pub fn remove(&mut self, id: TaskId) -> Option<TaskEntry> {
        self.entries.remove(&id)
    }

    /// Pop the oldest asynchronous task once it has settled.
    pub fn poll(&mut self) -> PollResult {
        let Some(&front) = self.completion_order.front() else {
            return PollResult::Empty;
        };
        let settled = self.entries.get(&front).is_none_or(TaskEntry::is_settled);
        if !settled {
            return PollResult::NotReady;
        }
        self.completion_order.pop_front();
        match self.entries.remove(&front) {
            Some(entry) if entry.failed => PollResult::Failed(entry.task),
            Some(entry) => PollResult::Done(entry.task),
            // Unreachable while the table owns every tracked id.
            None => PollResult::NotReady,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove every task, oldest asynchronous ones first.
    pub fn drain(&mut self) -> Vec<Task> {
        let mut out = Vec::with_capacity(self.entries.len());
        for id in self.completion_order.drain(..) {
            if let Some(entry) = self.entries.remove(&id) {
                out.push(entry.task);
            }
        }
        out.extend(self.entries.drain().map(|(_, e)| e.task));
        out
    }
}
