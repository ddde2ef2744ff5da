// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

/// The five capability hooks the dispatcher calls out to. A success carries
/// a value, a failure carries a human-readable message, and nothing here is
/// ever allowed to propagate a panic across the boundary (the dispatcher
/// catches those itself, see [`crate::dispatcher::Dispatcher`]).
///
/// Implementors must not call back into the dispatcher from within one of
/// these methods: the dispatcher never holds a mutex while invoking a
/// callback, but the converse is not guaranteed, and doing so would
/// deadlock on its own locks.
pub trait Callbacks<ExecId, TaskId, TaskObj, ExecType>: Send + Sync {
    /// Decide the next executor type a task should go to, given the types
    /// it has already visited. Returning `Ok(None)` means the task is done
    /// and should be forgotten; returning `Ok(Some(t))` queues it for type
    /// `t`.
    fn next_stage(
        &self,
        task_id: &TaskId,
        task_obj: &TaskObj,
        path_executed: &[ExecType],
    ) -> Result<Option<ExecType>, String>;

    /// Hand a task over the wire to a connected executor.
    fn send_task(&self, exec_id: &ExecId, task_id: &TaskId, task_obj: &TaskObj) -> Result<(), String>;

    /// An executor was removed while tasks were still assigned to it.
    fn disconnect_executor(&self, exec_id: &ExecId) -> Result<(), String>;

    /// A task failed terminally (too many freezes, or a failed dispatch
    /// with the freeze-on-failure policy disabled) and is being dropped.
    fn task_error(&self, task_id: &TaskId, error_message: &str) -> Result<(), String>;

    /// An executor reported it finished processing a task, before the
    /// dispatcher mutates its own bookkeeping for that task.
    fn task_processed(&self, task_id: &TaskId, task_obj: &TaskObj, exec_type: &ExecType) -> Result<(), String>;
}
