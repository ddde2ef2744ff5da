mod common;

use std::collections::HashSet;
use std::sync::Arc;

use dispatch_core::Dispatcher;
use proptest::prelude::*;

use common::{ArcCallbacks, ScriptedCallbacks};

/// Drives a random sequence of add/process/remove operations and checks
/// that an executor's task count never exceeds its configured capacity and
/// that every currently-assigned task is still a known task.
#[derive(Debug, Clone)]
enum Op {
    AddTask(u32),
    ProcessFirstAssigned,
    RemoveTask(u32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..8).prop_map(Op::AddTask),
        Just(Op::ProcessFirstAssigned),
        (0u32..8).prop_map(Op::RemoveTask),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn single_residence_and_capacity_hold(ops in prop::collection::vec(op_strategy(), 0..60)) {
        let cb = Arc::new(ScriptedCallbacks::new(vec!["A"]));
        let dispatcher = Dispatcher::new(ArcCallbacks(cb.clone()));
        dispatcher.add_executor(1, "A", 2);
        dispatcher.add_executor(2, "A", 2);

        for op in ops {
            match op {
                Op::AddTask(id) => {
                    let _ = dispatcher.add_task(id, "payload".to_string());
                }
                Op::ProcessFirstAssigned => {
                    if let Some((exec_id, task_id)) = cb.sent.lock().unwrap().first().copied() {
                        let _ = dispatcher.task_processed(&exec_id, &task_id, None);
                    }
                }
                Op::RemoveTask(id) => {
                    dispatcher.remove_task(&id);
                }
            }

            // capacity: no executor holds more than its max (2) tasks
            for eid in [1u32, 2u32] {
                prop_assert!(dispatcher.tasks_for_executor(&eid).len() <= 2);
            }

            // single residence: every assigned task is still a known task
            let assigned: HashSet<u32> = [1u32, 2u32]
                .into_iter()
                .flat_map(|eid| dispatcher.tasks_for_executor(&eid))
                .collect();
            prop_assert!(assigned.len() <= dispatcher.task_ids().len());
        }
    }
}
