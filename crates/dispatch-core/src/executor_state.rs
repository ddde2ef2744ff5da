// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::trace;

use crate::identifier::Identifier;

/// Tracks which executors exist, their capacity, and which tasks are
/// currently assigned to them, plus the reverse task -> executor index.
///
/// Guarded by a single internal mutex, distinct from any lock held by
/// [`crate::dispatcher::Dispatcher`]; per the crate's lock ordering this is
/// always the innermost lock taken (`executors -> tasks -> freezer ->
/// state -> queues`).
pub struct ExecutorState<ExecId: Identifier, ExecType: Identifier, TaskId: Identifier> {
    inner: Mutex<Inner<ExecId, ExecType, TaskId>>,
}

struct Inner<ExecId: Identifier, ExecType: Identifier, TaskId: Identifier> {
    type_to_id: HashMap<ExecType, HashSet<ExecId>>,
    max_tasks: HashMap<ExecId, usize>,
    exec_tasks: HashMap<ExecId, HashSet<TaskId>>,
    task_in_exec: HashMap<TaskId, ExecId>,
}

impl<ExecId: Identifier, ExecType: Identifier, TaskId: Identifier> Default
    for ExecutorState<ExecId, ExecType, TaskId>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<ExecId: Identifier, ExecType: Identifier, TaskId: Identifier> ExecutorState<ExecId, ExecType, TaskId> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                type_to_id: HashMap::new(),
                max_tasks: HashMap::new(),
                exec_tasks: HashMap::new(),
                task_in_exec: HashMap::new(),
            }),
        }
    }

    /// Registers an executor, or tops up its capacity if already present.
    /// `max_tasks` is clamped to at least 1.
    pub fn add_executor(&self, exec_id: ExecId, exec_type: ExecType, max_tasks: usize) {
        let mut inner = self.inner.lock();
        inner.max_tasks.insert(exec_id.clone(), max_tasks.max(1));
        inner.exec_tasks.entry(exec_id.clone()).or_default();
        inner.type_to_id.entry(exec_type).or_default().insert(exec_id);
    }

    /// Removes an executor and returns the task ids that were assigned to
    /// it, so the caller can requeue them.
    pub fn remove_executor(&self, exec_id: &ExecId) -> Vec<TaskId> {
        let mut inner = self.inner.lock();
        for ids in inner.type_to_id.values_mut() {
            ids.remove(exec_id);
        }
        let tasks = inner.exec_tasks.remove(exec_id).unwrap_or_default();
        for task_id in &tasks {
            inner.task_in_exec.remove(task_id);
        }
        inner.max_tasks.remove(exec_id);
        tasks.into_iter().collect()
    }

    pub fn tasks_for_executor(&self, exec_id: &ExecId) -> HashSet<TaskId> {
        let inner = self.inner.lock();
        inner.exec_tasks.get(exec_id).cloned().unwrap_or_default()
    }

    pub fn full(&self, exec_id: &ExecId) -> bool {
        let inner = self.inner.lock();
        match (inner.exec_tasks.get(exec_id), inner.max_tasks.get(exec_id)) {
            (Some(tasks), Some(max)) => tasks.len() >= *max,
            _ => true,
        }
    }

    pub fn free_slots(&self, exec_id: &ExecId) -> usize {
        let inner = self.inner.lock();
        match (inner.max_tasks.get(exec_id), inner.exec_tasks.get(exec_id)) {
            (Some(max), Some(tasks)) => max.saturating_sub(tasks.len()),
            _ => 0,
        }
    }

    /// Map of executor id -> free slot count, for every executor of
    /// `exec_type` that currently has free capacity.
    pub fn free_executors(&self, exec_type: &ExecType) -> HashMap<ExecId, usize> {
        let inner = self.inner.lock();
        let mut out = HashMap::new();
        let Some(ids) = inner.type_to_id.get(exec_type) else {
            return out;
        };
        for eid in ids {
            let free = match (inner.max_tasks.get(eid), inner.exec_tasks.get(eid)) {
                (Some(max), Some(tasks)) => max.saturating_sub(tasks.len()),
                _ => 0,
            };
            if free > 0 {
                out.insert(eid.clone(), free);
            }
        }
        out
    }

    /// The executor of `exec_type` with the most free slots, or `None` if
    /// every executor of that type is full (or there are none).
    pub fn get_idle_executor(&self, exec_type: &ExecType) -> Option<ExecId> {
        let inner = self.inner.lock();
        let ids = inner.type_to_id.get(exec_type)?;
        let mut idle = None;
        let mut max_free = 0usize;
        for eid in ids {
            let free = match (inner.max_tasks.get(eid), inner.exec_tasks.get(eid)) {
                (Some(max), Some(tasks)) => max.saturating_sub(tasks.len()),
                _ => 0,
            };
            if free > max_free {
                max_free = free;
                idle = Some(eid.clone());
            }
        }
        idle
    }

    /// Assigns `task_id` to `exec_id` and returns the executor's new task
    /// count, or `0` if the executor is unknown.
    pub fn add_task(&self, exec_id: &ExecId, task_id: TaskId) -> usize {
        let mut inner = self.inner.lock();
        if !inner.exec_tasks.contains_key(exec_id) {
            return 0;
        }
        inner.task_in_exec.insert(task_id.clone(), exec_id.clone());
        let tasks = inner.exec_tasks.get_mut(exec_id).expect("checked above");
        tasks.insert(task_id);
        tasks.len()
    }

    pub fn get_executor_of_task(&self, task_id: &TaskId) -> Option<ExecId> {
        let inner = self.inner.lock();
        inner.task_in_exec.get(task_id).cloned()
    }

    /// Removes a task's assignment. If `exec_id` is given the removal is
    /// scoped to that executor (the caller must fail if the task was not
    /// actually assigned there); otherwise it is looked up via the reverse
    /// index.
    pub fn remove_task(&self, task_id: &TaskId, exec_id: Option<&ExecId>) -> bool {
        let mut inner = self.inner.lock();
        let eid = match exec_id {
            Some(e) => e.clone(),
            None => match inner.task_in_exec.get(task_id) {
                Some(e) => e.clone(),
                None => return false,
            },
        };
        let removed_from_set = inner
            .exec_tasks
            .get_mut(&eid)
            .map(|tasks| tasks.remove(task_id))
            .unwrap_or(false);
        if !removed_from_set {
            trace!(?task_id, "remove_task: task was not assigned to this executor");
            return false;
        }
        inner.task_in_exec.remove(task_id);
        true
    }
}
