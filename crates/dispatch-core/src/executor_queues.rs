// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::identifier::Identifier;

/// Per-executor-type FIFO of tasks waiting for a free executor, plus the
/// reverse task -> type index used to reject double-queuing and to
/// support deleting a task by id alone.
pub struct ExecutorQueues<ExecType: Identifier, TaskId: Identifier> {
    inner: Mutex<Inner<ExecType, TaskId>>,
}

struct Inner<ExecType: Identifier, TaskId: Identifier> {
    queues: HashMap<ExecType, VecDeque<TaskId>>,
    task_in_queue: HashMap<TaskId, ExecType>,
}

impl<ExecType: Identifier, TaskId: Identifier> Default for ExecutorQueues<ExecType, TaskId> {
    fn default() -> Self {
        Self::new()
    }
}

impl<ExecType: Identifier, TaskId: Identifier> ExecutorQueues<ExecType, TaskId> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queues: HashMap::new(),
                task_in_queue: HashMap::new(),
            }),
        }
    }

    pub fn get_executor_list(&self) -> Vec<ExecType> {
        let inner = self.inner.lock();
        inner.queues.keys().cloned().collect()
    }

    /// Queues `task_id` for `exec_type`. If the task is already queued for
    /// a *different* type this is rejected (returns `0`); if it is already
    /// queued for the same type, this is a no-op that returns the current
    /// queue length.
    /// Otherwise the task is pushed to the back, or the front if `ahead`
    /// is set (used to reinsert a task that lost its executor or failed to
    /// send).
    pub fn push_task(&self, exec_type: ExecType, task_id: TaskId, ahead: bool) -> usize {
        info!(?task_id, ?exec_type, "pushing task into waiting queue");
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.task_in_queue.get(&task_id) {
            if existing != &exec_type {
                warn!(
                    ?task_id,
                    existing_type = ?existing,
                    "task cannot be queued: already queued for a different executor type"
                );
                return 0;
            }
            return inner.queues.get(&exec_type).map(VecDeque::len).unwrap_or(0);
        }
        let queue = inner.queues.entry(exec_type.clone()).or_default();
        if ahead {
            queue.push_front(task_id.clone());
        } else {
            queue.push_back(task_id.clone());
        }
        let len = queue.len();
        inner.task_in_queue.insert(task_id, exec_type);
        len
    }

    /// Pops the oldest task waiting for `exec_type`, if any.
    pub fn pop_task(&self, exec_type: &ExecType) -> Option<TaskId> {
        let mut inner = self.inner.lock();
        let task_id = inner.queues.get_mut(exec_type)?.pop_front()?;
        inner.task_in_queue.remove(&task_id);
        info!(?task_id, ?exec_type, "popped task from waiting queue");
        Some(task_id)
    }

    /// Snapshot of every queue's contents, in FIFO order.
    pub fn get_state(&self) -> HashMap<ExecType, Vec<TaskId>> {
        let inner = self.inner.lock();
        inner
            .queues
            .iter()
            .map(|(t, q)| (t.clone(), q.iter().cloned().collect()))
            .collect()
    }

    /// Removes `task_id` from whichever queue it is waiting in, wherever
    /// in the queue it sits. Returns `false` if the task was not queued.
    pub fn delete_task(&self, task_id: &TaskId) -> bool {
        let mut inner = self.inner.lock();
        let Some(exec_type) = inner.task_in_queue.remove(task_id) else {
            return false;
        };
        match inner.queues.get_mut(&exec_type) {
            Some(queue) => match queue.iter().position(|t| t == task_id) {
                Some(pos) => {
                    queue.remove(pos);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn waiting_tasks(&self, exec_type: &ExecType) -> usize {
        let inner = self.inner.lock();
        inner.queues.get(exec_type).map(VecDeque::len).unwrap_or(0)
    }
}
