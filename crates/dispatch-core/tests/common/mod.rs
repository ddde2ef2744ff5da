use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use dispatch_core::Callbacks;

/// A `Callbacks` impl for tests: `next_stage` walks a fixed pipeline of
/// executor types, `send_task` can be told to fail the first time it is
/// asked to deliver a given task, and every call is recorded so assertions
/// can check ordering.
#[derive(Default)]
pub struct ScriptedCallbacks {
    pub pipeline: Vec<&'static str>,
    pub fail_send_once_for: Mutex<HashSet<u32>>,
    pub sent: Mutex<Vec<(u32, u32)>>,
    pub processed: Mutex<Vec<u32>>,
    pub disconnected: Mutex<Vec<u32>>,
    pub errored: Mutex<Vec<(u32, String)>>,
    pub always_fail_next_stage_for: Mutex<HashSet<u32>>,
}

impl ScriptedCallbacks {
    pub fn new(pipeline: Vec<&'static str>) -> Self {
        Self {
            pipeline,
            ..Default::default()
        }
    }
}

impl Callbacks<u32, u32, String, &'static str> for ScriptedCallbacks {
    fn next_stage(
        &self,
        task_id: &u32,
        _task_obj: &String,
        path_executed: &[&'static str],
    ) -> Result<Option<&'static str>, String> {
        if self.always_fail_next_stage_for.lock().unwrap().contains(task_id) {
            return Err("boom".to_string());
        }
        Ok(self.pipeline.get(path_executed.len()).copied())
    }

    fn send_task(&self, exec_id: &u32, task_id: &u32, _task_obj: &String) -> Result<(), String> {
        let mut fail_once = self.fail_send_once_for.lock().unwrap();
        if fail_once.remove(task_id) {
            return Err("transport refused the task".to_string());
        }
        drop(fail_once);
        self.sent.lock().unwrap().push((*exec_id, *task_id));
        Ok(())
    }

    fn disconnect_executor(&self, exec_id: &u32) -> Result<(), String> {
        self.disconnected.lock().unwrap().push(*exec_id);
        Ok(())
    }

    fn task_error(&self, task_id: &u32, error_message: &str) -> Result<(), String> {
        self.errored.lock().unwrap().push((*task_id, error_message.to_string()));
        Ok(())
    }

    fn task_processed(&self, task_id: &u32, _task_obj: &String, _exec_type: &&'static str) -> Result<(), String> {
        self.processed.lock().unwrap().push(*task_id);
        Ok(())
    }
}

/// Delegates to an `Arc<ScriptedCallbacks>` so both the dispatcher (which
/// owns its callbacks by value) and the test (which wants to inspect the
/// recorded call log afterward) can hold a handle to the same state.
pub struct ArcCallbacks(pub Arc<ScriptedCallbacks>);

impl Callbacks<u32, u32, String, &'static str> for ArcCallbacks {
    fn next_stage(
        &self,
        task_id: &u32,
        task_obj: &String,
        path_executed: &[&'static str],
    ) -> Result<Option<&'static str>, String> {
        self.0.next_stage(task_id, task_obj, path_executed)
    }

    fn send_task(&self, exec_id: &u32, task_id: &u32, task_obj: &String) -> Result<(), String> {
        self.0.send_task(exec_id, task_id, task_obj)
    }

    fn disconnect_executor(&self, exec_id: &u32) -> Result<(), String> {
        self.0.disconnect_executor(exec_id)
    }

    fn task_error(&self, task_id: &u32, error_message: &str) -> Result<(), String> {
        self.0.task_error(task_id, error_message)
    }

    fn task_processed(&self, task_id: &u32, task_obj: &String, exec_type: &&'static str) -> Result<(), String> {
        self.0.task_processed(task_id, task_obj, exec_type)
    }
}
