// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::callbacks::Callbacks;
use crate::error::{DispatchError, DispatcherOpError};
use crate::executor_queues::ExecutorQueues;
use crate::executor_state::ExecutorState;
use crate::identifier::Identifier;
use crate::task::ETask;

/// A task is frozen at most this many times before it is declared a
/// terminal failure.
pub const DEFAULT_FREEZE_CEILING: u32 = 10;

/// A frozen task is eligible for defrost once it has sat this long without
/// a matching type hint showing up.
pub const DEFAULT_DEFROST_AGE: std::time::Duration = std::time::Duration::from_secs(300);

struct ExecutorsInner<ExecId: Identifier, ExecType: Identifier> {
    id_map: HashMap<ExecId, ExecType>,
    exec_types: HashMap<ExecType, usize>,
}

/// Policy knobs for freeze/defrost behavior. `false` for the "freeze"
/// flags means forget the task instead of retrying it later.
pub struct DispatcherPolicy {
    pub failed_on_too_frozen: bool,
    pub freeze_on_failed_dispatch: bool,
    pub freeze_on_unknown_executor: bool,
    pub freeze_ceiling: u32,
    pub defrost_age: std::time::Duration,
}

impl Default for DispatcherPolicy {
    fn default() -> Self {
        Self {
            failed_on_too_frozen: true,
            freeze_on_failed_dispatch: true,
            freeze_on_unknown_executor: true,
            freeze_ceiling: DEFAULT_FREEZE_CEILING,
            defrost_age: DEFAULT_DEFROST_AGE,
        }
    }
}

/// The pipelined task dispatcher. Owns three independent mutexes
/// (`executors`, `tasks`, `freezer`) plus the two sub-structures'
/// (`ExecutorState`, `ExecutorQueues`) own internal mutexes. Lock ordering
/// is `executors -> tasks -> freezer -> state -> queues`; any code path
/// that needs more than one of these must acquire them in that order.
///
/// Callbacks are always invoked with none of these mutexes held.
pub struct Dispatcher<ExecId, ExecType, TaskId, TaskObj, CB>
where
    ExecId: Identifier,
    ExecType: Identifier,
    TaskId: Identifier,
    TaskObj: Clone + Send + 'static,
    CB: Callbacks<ExecId, TaskId, TaskObj, ExecType>,
{
    executors: Mutex<ExecutorsInner<ExecId, ExecType>>,
    tasks: Mutex<HashMap<TaskId, ETask<TaskId, TaskObj, ExecType>>>,
    freezer: Mutex<Vec<TaskId>>,
    state: ExecutorState<ExecId, ExecType, TaskId>,
    queues: ExecutorQueues<ExecType, TaskId>,
    callbacks: CB,
    failed_on_too_frozen: AtomicBool,
    freeze_on_failed_dispatch: AtomicBool,
    freeze_on_unknown_executor: AtomicBool,
    freeze_ceiling: u32,
    defrost_age: std::time::Duration,
}

impl<ExecId, ExecType, TaskId, TaskObj, CB> Dispatcher<ExecId, ExecType, TaskId, TaskObj, CB>
where
    ExecId: Identifier,
    ExecType: Identifier,
    TaskId: Identifier,
    TaskObj: Clone + Send + 'static,
    CB: Callbacks<ExecId, TaskId, TaskObj, ExecType>,
{
    pub fn new(callbacks: CB) -> Self {
        Self::with_policy(callbacks, DispatcherPolicy::default())
    }

    pub fn with_policy(callbacks: CB, policy: DispatcherPolicy) -> Self {
        Self {
            executors: Mutex::new(ExecutorsInner {
                id_map: HashMap::new(),
                exec_types: HashMap::new(),
            }),
            tasks: Mutex::new(HashMap::new()),
            freezer: Mutex::new(Vec::new()),
            state: ExecutorState::new(),
            queues: ExecutorQueues::new(),
            callbacks,
            failed_on_too_frozen: AtomicBool::new(policy.failed_on_too_frozen),
            freeze_on_failed_dispatch: AtomicBool::new(policy.freeze_on_failed_dispatch),
            freeze_on_unknown_executor: AtomicBool::new(policy.freeze_on_unknown_executor),
            freeze_ceiling: policy.freeze_ceiling,
            defrost_age: policy.defrost_age,
        }
    }

    pub fn set_failed_on_too_frozen(&self, value: bool) {
        self.failed_on_too_frozen.store(value, Ordering::Relaxed);
    }

    pub fn set_freeze_on_failed_dispatch(&self, value: bool) {
        self.freeze_on_failed_dispatch.store(value, Ordering::Relaxed);
    }

    pub fn set_freeze_on_unknown_executor(&self, value: bool) {
        self.freeze_on_unknown_executor.store(value, Ordering::Relaxed);
    }

    /// Snapshot of every known task id.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.lock().keys().cloned().collect()
    }

    /// Snapshot of connected-executor counts per type.
    pub fn executors_connected(&self) -> HashMap<ExecType, usize> {
        self.executors.lock().exec_types.clone()
    }

    pub fn tasks_for_executor(&self, exec_id: &ExecId) -> std::collections::HashSet<TaskId> {
        self.state.tasks_for_executor(exec_id)
    }

    pub fn free_executors(&self, exec_type: &ExecType) -> HashMap<ExecId, usize> {
        self.state.free_executors(exec_type)
    }

    pub fn waiting_tasks(&self, exec_type: &ExecType) -> usize {
        self.queues.waiting_tasks(exec_type)
    }

    // ---- executor lifecycle -------------------------------------------------

    /// Registers a new executor and immediately tries to fill it from the
    /// waiting queue. A repeated id for an already-known executor is a
    /// no-op.
    pub fn add_executor(&self, exec_id: ExecId, exec_type: ExecType, max_tasks: usize) {
        info!(?exec_id, ?exec_type, "adding new executor to the pool");
        {
            let mut executors = self.executors.lock();
            if executors.id_map.contains_key(&exec_id) {
                return;
            }
            executors.id_map.insert(exec_id.clone(), exec_type.clone());
            *executors.exec_types.entry(exec_type.clone()).or_insert(0) += 1;
        }
        self.state.add_executor(exec_id, exec_type.clone(), max_tasks);
        self.fill_executors(exec_type, true);
    }

    /// Removes an executor, requeues (at the front) whatever tasks were
    /// in flight to it, and notifies the transport via
    /// [`Callbacks::disconnect_executor`]. Unknown ids are a no-op.
    pub fn remove_executor(&self, exec_id: &ExecId) {
        info!(?exec_id, "removing executor");
        let exec_type = {
            let mut executors = self.executors.lock();
            let Some(exec_type) = executors.id_map.remove(exec_id) else {
                return;
            };
            if let Some(count) = executors.exec_types.get_mut(&exec_type) {
                *count = count.saturating_sub(1);
            }
            let orphaned = self.state.remove_executor(exec_id);
            for task_id in orphaned {
                self.queues.push_task(exec_type.clone(), task_id, true);
            }
            exec_type
        };
        if let Err(e) = self.catch_callback(|| self.callbacks.disconnect_executor(exec_id)) {
            error!(?exec_id, error = %e, "exception while disconnecting executor");
        }
        self.fill_executors(exec_type, true);
    }

    // ---- task lifecycle ------------------------------------------------------

    /// Introduces a new task to the dispatcher, or (if already known) takes
    /// the opportunity to sweep the freezer instead of treating it as an
    /// error.
    pub fn add_task(&self, task_id: TaskId, task_obj: TaskObj) -> Result<(), DispatcherOpError<ExecId, TaskId>> {
        let is_new = {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&task_id) {
                trace!(?task_id, "task was already known");
                false
            } else {
                tasks.insert(task_id.clone(), ETask::new(task_id.clone(), task_obj));
                true
            }
        };
        if !is_new {
            self.unfreeze_tasks(None);
            return Ok(());
        }
        self.dispatch_task(task_id, true)
            .map_err(DispatcherOpError::Callback)
    }

    /// Drops a task entirely: removes it from the task table, any waiting
    /// queue, its executor assignment, and the freezer. If it was assigned
    /// to an executor, that executor is offered the next waiting task.
    /// A task that is already gone is a silent no-op, matching the
    /// original.
    pub fn remove_task(&self, task_id: &TaskId) {
        {
            let mut tasks = self.tasks.lock();
            if tasks.remove(task_id).is_none() {
                info!(?task_id, "task is already removed");
                return;
            }
        }
        info!(?task_id, "removing task");
        let exec_id = self.state.get_executor_of_task(task_id);
        self.queues.delete_task(task_id);
        self.state.remove_task(task_id, None);
        {
            let mut freezer = self.freezer.lock();
            if let Some(pos) = freezer.iter().position(|t| t == task_id) {
                freezer.remove(pos);
            }
        }
        if let Some(eid) = exec_id {
            if let Err(e) = self.send_task_to_executor(&eid, None, true) {
                warn!(exec_id = ?eid, error = %e, "could not offer next task after removal");
            }
        }
    }

    /// An executor reports it finished processing a task. The callback is
    /// invoked before the dispatcher's own bookkeeping (`path_executed`,
    /// `task_obj`) is updated: a callback error must not silently mutate
    /// state it then goes on to reject.
    pub fn task_processed(
        &self,
        exec_id: &ExecId,
        task_id: &TaskId,
        task_obj: Option<TaskObj>,
    ) -> Result<(), DispatcherOpError<ExecId, TaskId>> {
        if !self.tasks.lock().contains_key(task_id) {
            return Err(DispatchError::UnknownTask(task_id.clone()).into());
        }
        if !self.state.remove_task(task_id, Some(exec_id)) {
            return Err(DispatchError::TaskNotAssignedToExecutor {
                task: task_id.clone(),
                executor: exec_id.clone(),
            }
            .into());
        }
        let exec_type = {
            let executors = self.executors.lock();
            executors.id_map.get(exec_id).cloned()
        };
        let Some(exec_type) = exec_type else {
            warn!(?exec_id, ?task_id, "executor type unknown, redoing task");
            let _ = self.dispatch_task(task_id.clone(), true);
            return Err(DispatchError::UnknownExecutor(exec_id.clone()).into());
        };

        let current_obj = match task_obj.clone() {
            Some(obj) => obj,
            None => match self.tasks.lock().get(task_id) {
                Some(etask) => etask.task_obj.clone(),
                None => {
                    let _ = self.send_task_to_executor(exec_id, Some(exec_type), false);
                    return Ok(());
                }
            },
        };

        if let Err(e) = self.catch_callback(|| self.callbacks.task_processed(task_id, &current_obj, &exec_type)) {
            return Err(DispatcherOpError::Callback(e));
        }

        {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(task_id) {
                Some(etask) => {
                    if let Some(obj) = task_obj {
                        etask.task_obj = obj;
                    }
                    etask.path_executed.push(exec_type.clone());
                }
                None => {
                    warn!(?task_id, "task was removed while being processed");
                    drop(tasks);
                    let _ = self.send_task_to_executor(exec_id, Some(exec_type), false);
                    return Ok(());
                }
            }
        }

        info!(?exec_id, ?task_id, "executor processed task");
        let result = self.dispatch_task(task_id.clone(), true);
        let _ = self.send_task_to_executor(exec_id, Some(exec_type), false);
        result.map_err(DispatcherOpError::Callback)
    }

    /// An executor reports it did *not* process a task; bump the retry
    /// count (without touching `path_executed`) and redispatch.
    pub fn retry_task(&self, exec_id: &ExecId, task_id: &TaskId) -> Result<(), DispatcherOpError<ExecId, TaskId>> {
        if !self.tasks.lock().contains_key(task_id) {
            return Err(DispatchError::UnknownTask(task_id.clone()).into());
        }
        if !self.state.remove_task(task_id, Some(exec_id)) {
            return Err(DispatchError::TaskNotAssignedToExecutor {
                task: task_id.clone(),
                executor: exec_id.clone(),
            }
            .into());
        }
        info!(?exec_id, ?task_id, "executor did not process task, retrying");
        {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(task_id) {
                Some(etask) => etask.retries += 1,
                None => {
                    warn!(?task_id, "task was removed while waiting for retry");
                    return Ok(());
                }
            }
        }
        self.dispatch_task(task_id.clone(), true)
            .map_err(DispatcherOpError::Callback)
    }

    // ---- internal dispatch machinery -----------------------------------------

    fn dispatch_task(&self, task_id: TaskId, defrost_if_needed: bool) -> Result<(), String> {
        trace!(?task_id, "dispatching task");
        match self.get_next_executor(&task_id) {
            Err(msg) => {
                warn!(?task_id, error = %msg, "error while calling dispatch callback");
                if self.freeze_on_failed_dispatch.load(Ordering::Relaxed) {
                    if self.freeze_task(&task_id, &msg, None) {
                        return Ok(());
                    }
                    return Err(msg);
                }
                self.remove_task(&task_id);
                let err_msg = format!("could not dispatch task: {msg}");
                let _ = self.catch_callback(|| self.callbacks.task_error(&task_id, &err_msg));
                Err("could not add task, dispatching task failed".to_string())
            }
            Ok(None) => {
                info!(?task_id, "no more stages for task");
                self.remove_task(&task_id);
                Ok(())
            }
            Ok(Some(next_type)) => {
                info!(?task_id, exec_type = ?next_type, "next executor type determined");
                let connected = {
                    let executors = self.executors.lock();
                    executors.exec_types.contains_key(&next_type)
                };
                if !connected {
                    if self.freeze_on_unknown_executor.load(Ordering::Relaxed) {
                        info!(?task_id, exec_type = ?next_type, "executor type has not connected, freezing task");
                        self.freeze_task(&task_id, "unknown executor type", Some(next_type));
                    } else {
                        info!(?task_id, exec_type = ?next_type, "executor type has not connected, forgetting task");
                        self.remove_task(&task_id);
                    }
                    return Ok(());
                }
                self.queues.push_task(next_type.clone(), task_id, false);
                self.fill_executors(next_type, defrost_if_needed);
                Ok(())
            }
        }
    }

    fn get_next_executor(&self, task_id: &TaskId) -> Result<Option<ExecType>, String> {
        let (task_obj, path) = {
            let tasks = self.tasks.lock();
            match tasks.get(task_id) {
                Some(etask) => (etask.task_obj.clone(), etask.path_executed.clone()),
                None => {
                    return Err(format!(
                        "task {task_id:?} was deleted prematurely while being dispatched"
                    ))
                }
            }
        };
        self.catch_callback(|| self.callbacks.next_stage(task_id, &task_obj, &path))
    }

    /// Tries to freeze a task; returns `false` if it was already frozen,
    /// unknown, or escalated past the freeze ceiling (in which case it was
    /// removed and, if configured, reported as a terminal failure).
    fn freeze_task(&self, task_id: &TaskId, err_msg: &str, type_hint: Option<ExecType>) -> bool {
        info!(?task_id, "freezing task");
        let is_frozen = {
            let mut tasks = self.tasks.lock();
            let Some(etask) = tasks.get_mut(task_id) else {
                return false;
            };
            let mut freezer = self.freezer.lock();
            if freezer.contains(task_id) {
                return false;
            }
            etask.frozen_message = Some(err_msg.to_string());
            etask.frozen_since = Some(Instant::now());
            etask.frozen_count += 1;
            etask.frozen_hint = type_hint;
            let frozen = etask.frozen_count < self.freeze_ceiling;
            if frozen {
                freezer.push(task_id.clone());
            }
            frozen
        };
        if !is_frozen {
            self.remove_task(task_id);
            if self.failed_on_too_frozen.load(Ordering::Relaxed) {
                let msg = format!(
                    "retried more than {} times. Last error: {err_msg}",
                    self.freeze_ceiling
                );
                let _ = self.catch_callback(|| self.callbacks.task_error(task_id, &msg));
            }
        }
        is_frozen
    }

    /// Sweeps the freezer. With `type_hint` set, any task frozen with a
    /// matching hint is defrosted immediately regardless of age (an
    /// executor of the type it was waiting for just connected); every
    /// other task is defrosted once it has aged past the configured
    /// defrost age. A task that vanished out from under the freezer (e.g.
    /// removed by the caller) is dropped from it during the same sweep.
    fn unfreeze_tasks(&self, type_hint: Option<ExecType>) {
        enum Step<TaskId> {
            Done,
            Advance,
            RemovedNoAdvance,
            Defrost(TaskId, Option<Instant>),
        }

        let mut i = 0usize;
        loop {
            let step = {
                let tasks = self.tasks.lock();
                let mut freezer = self.freezer.lock();
                match freezer.get(i).cloned() {
                    None => Step::Done,
                    Some(task_id) => match tasks.get(&task_id) {
                        None => {
                            info!(?task_id, "removing task from freezer: task no longer exists");
                            freezer.remove(i);
                            Step::RemovedNoAdvance
                        }
                        Some(etask) => {
                            let hinted = match (&type_hint, &etask.frozen_hint) {
                                (Some(h), Some(eh)) => h == eh,
                                _ => false,
                            };
                            let aged = etask
                                .frozen_since
                                .map(|since| since.elapsed() > self.defrost_age)
                                .unwrap_or(false);
                            if hinted || aged {
                                freezer.remove(i);
                                Step::Defrost(task_id, etask.frozen_since)
                            } else {
                                Step::Advance
                            }
                        }
                    },
                }
            };
            match step {
                Step::Done => break,
                Step::Advance => {
                    i += 1;
                }
                // the entry at `i` was just removed, so the next entry has
                // shifted into position `i` — don't advance
                Step::RemovedNoAdvance => {}
                Step::Defrost(task_id, frozen_since) => {
                    if let Some(since) = frozen_since {
                        let mut tasks = self.tasks.lock();
                        if let Some(etask) = tasks.get_mut(&task_id) {
                            etask.frozen_time += since.elapsed();
                        }
                    }
                    info!(?task_id, "unfroze task");
                    let _ = self.dispatch_task(task_id, false);
                }
            }
        }
    }

    fn fill_executors(&self, exec_type: ExecType, defrost_if_needed: bool) {
        if defrost_if_needed {
            trace!(exec_type = ?exec_type, "unfreezing tasks for type");
            self.unfreeze_tasks(Some(exec_type.clone()));
        }
        trace!(exec_type = ?exec_type, "filling executors");
        loop {
            let Some(exec_id) = self.state.get_idle_executor(&exec_type) else {
                break;
            };
            match self.send_task_to_executor(&exec_id, Some(exec_type.clone()), false) {
                Err(e) => {
                    error!(exec_id = ?exec_id, error = %e, "could not send task to executor");
                }
                Ok(None) => break,
                Ok(Some(task_id)) => {
                    info!(?task_id, ?exec_id, "task was sent to executor");
                }
            }
        }
        trace!(exec_type = ?exec_type, "no more idle executors for type");
    }

    fn send_task_to_executor(
        &self,
        exec_id: &ExecId,
        exec_type_hint: Option<ExecType>,
        check_idle: bool,
    ) -> Result<Option<TaskId>, String> {
        if check_idle && self.state.free_slots(exec_id) == 0 {
            return Ok(None);
        }
        let exec_type = match exec_type_hint {
            Some(t) => t,
            None => {
                let executors = self.executors.lock();
                match executors.id_map.get(exec_id) {
                    Some(t) => t.clone(),
                    None => return Err(format!("executor type unknown for {exec_id:?}")),
                }
            }
        };
        let Some(task_id) = self.queues.pop_task(&exec_type) else {
            trace!(?exec_type, "no more tasks waiting for type");
            return Ok(None);
        };
        info!(?task_id, ?exec_type, ?exec_id, "sending task to executor");
        self.state.add_task(exec_id, task_id.clone());

        let task_obj = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(&task_id) {
                Some(etask) => {
                    etask.send_time = Some(Instant::now());
                    etask.task_obj.clone()
                }
                None => {
                    self.state.remove_task(&task_id, Some(exec_id));
                    return Ok(None);
                }
            }
        };

        match self.catch_callback(|| self.callbacks.send_task(exec_id, &task_id, &task_obj)) {
            Ok(()) => Ok(Some(task_id)),
            Err(e) => {
                self.queues.push_task(exec_type, task_id.clone(), true);
                self.state.remove_task(&task_id, Some(exec_id));
                Err(e)
            }
        }
    }

    /// Runs a callback, converting a panic into a synthetic failure message
    /// the same way the embedding process' panic hook would describe it.
    fn catch_callback<F, T>(&self, f: F) -> Result<T, String>
    where
        F: FnOnce() -> Result<T, String>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result,
            Err(payload) => Err(describe_panic_payload(&payload)),
        }
    }
}

fn describe_panic_payload(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        format!("callback panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("callback panicked: {s}")
    } else {
        "callback panicked with a non-string payload".to_string()
    }
}
