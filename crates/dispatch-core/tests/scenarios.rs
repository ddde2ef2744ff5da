mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dispatch_core::{Dispatcher, DispatcherPolicy};

use common::{ArcCallbacks, ScriptedCallbacks};

type TestDispatcher = Dispatcher<u32, &'static str, u32, String, ArcCallbacks>;

fn dispatcher(pipeline: Vec<&'static str>) -> (Arc<TestDispatcher>, Arc<ScriptedCallbacks>) {
    let cb = Arc::new(ScriptedCallbacks::new(pipeline));
    // We need the Dispatcher to own the callbacks object, but tests also want
    // a handle to inspect recorded calls. ScriptedCallbacks is plain data
    // behind Mutexes, so clone an Arc in and give the Dispatcher the other.
    let dispatcher = Arc::new(Dispatcher::new(ArcCallbacks(cb.clone())));
    (dispatcher, cb)
}

/// Happy path: task visits A then B, then completes.
#[test]
fn happy_path_a_then_b_then_done() {
    let (dispatcher, cb) = dispatcher(vec!["A", "B"]);
    dispatcher.add_executor(1, "A", 1);
    dispatcher.add_executor(2, "B", 1);

    dispatcher.add_task(100, "payload".to_string()).unwrap();
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 100)]);

    dispatcher.task_processed(&1, &100, None).unwrap();
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 100), (2, 100)]);

    dispatcher.task_processed(&2, &100, None).unwrap();
    assert!(dispatcher.task_ids().is_empty());
    assert_eq!(cb.processed.lock().unwrap().as_slice(), &[100, 100]);
}

/// An unknown executor type freezes the task until a matching executor
/// connects, then it is dispatched immediately (type-hint defrost, no need
/// to wait out the age-based sweep).
#[test]
fn unknown_type_freezes_then_dispatches_on_connect() {
    let (dispatcher, cb) = dispatcher(vec!["C"]);

    dispatcher.add_task(200, "payload".to_string()).unwrap();
    assert!(cb.sent.lock().unwrap().is_empty());
    assert!(dispatcher.task_ids().contains(&200));

    dispatcher.add_executor(9, "C", 1);
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(9, 200)]);
}

/// An executor disappearing mid-flight reinserts its task at the front of
/// the queue, so it is the next thing sent once a replacement connects.
#[test]
fn executor_lost_mid_flight_reinserts_ahead() {
    let (dispatcher, cb) = dispatcher(vec!["A", "B"]);
    dispatcher.add_executor(1, "A", 1);
    dispatcher.add_task(300, "payload".to_string()).unwrap();
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 300)]);

    dispatcher.remove_executor(&1);
    assert_eq!(dispatcher.waiting_tasks(&"A"), 1);
    assert_eq!(cb.disconnected.lock().unwrap().as_slice(), &[1]);

    dispatcher.add_executor(7, "A", 1);
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 300), (7, 300)]);
}

/// A failed send pushes the task back to the front of its queue; the fill
/// loop immediately retries the now-idle executor and succeeds.
#[test]
fn send_failure_pushes_back_ahead_and_resends() {
    let (dispatcher, cb) = dispatcher(vec!["A"]);
    cb.fail_send_once_for.lock().unwrap().insert(400);
    dispatcher.add_executor(1, "A", 1);

    dispatcher.add_task(400, "payload".to_string()).unwrap();

    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 400)]);
    assert!(cb.fail_send_once_for.lock().unwrap().is_empty());
}

/// A task that fails dispatch past the freeze ceiling is declared a
/// terminal failure and removed instead of frozen again.
#[test]
fn freeze_escalates_to_terminal_task_error_on_tenth_freeze() {
    let cb = Arc::new(ScriptedCallbacks::new(vec!["A"]));
    cb.always_fail_next_stage_for.lock().unwrap().insert(500);
    let policy = DispatcherPolicy {
        freeze_ceiling: 3,
        defrost_age: Duration::from_millis(5),
        ..Default::default()
    };
    let dispatcher: TestDispatcher = Dispatcher::with_policy(ArcCallbacks(cb.clone()), policy);

    // First attempt: dispatch fails, task is frozen (count 1 of 3).
    dispatcher.add_task(500, "payload".to_string()).unwrap();
    assert!(dispatcher.task_ids().contains(&500));

    // Each subsequent `add_task` on a known id sweeps the freezer; once the
    // defrost age has elapsed the task is redispatched, fails again, and is
    // refrozen, until the ceiling is hit.
    for _ in 0..5 {
        thread::sleep(Duration::from_millis(10));
        let _ = dispatcher.add_task(500, "payload".to_string());
        if !dispatcher.task_ids().contains(&500) {
            break;
        }
    }

    assert!(!dispatcher.task_ids().contains(&500));
    let errored = cb.errored.lock().unwrap();
    assert_eq!(errored.len(), 1);
    assert_eq!(errored[0].0, 500);
    assert!(errored[0].1.contains("more than 3 times"));
}

/// `retry_task` bumps the retry counter without growing the executed path,
/// and redispatches from the same stage.
#[test]
fn retry_task_increments_retries_without_growing_path() {
    let (dispatcher, cb) = dispatcher(vec!["A", "B"]);
    dispatcher.add_executor(1, "A", 1);
    dispatcher.add_task(600, "payload".to_string()).unwrap();
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 600)]);

    dispatcher.retry_task(&1, &600).unwrap();
    // still stage A: the same executor is idle again and gets it right back
    assert_eq!(cb.sent.lock().unwrap().as_slice(), &[(1, 600), (1, 600)]);
}
