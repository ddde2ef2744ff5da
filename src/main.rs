use clap::{Parser, Subcommand};
use dispatch_core::{Callbacks, Dispatcher};

#[derive(Parser, Debug)]
#[command(name = "dispatch-rt", author, version, about = "Pipelined task dispatcher demo")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the A -> B -> done happy-path scenario end to end and print the trace.
    Demo,

    /// Print the currently configured policy (loaded from dispatch.yaml / env).
    Config,

    /// Run the same scenario as `demo`, then print per-executor pool
    /// utilization instead of relying on the printed trace.
    Dump,
}

/// An in-memory stand-in for a real transport and scheduling policy, used
/// only to exercise the dispatcher by hand. Every task visits executor type
/// "A" then "B" then finishes. Real transports and policies live in the
/// embedding process; this crate only defines the interface they implement.
struct DemoCallbacks;

impl Callbacks<u32, u32, String, &'static str> for DemoCallbacks {
    fn next_stage(
        &self,
        task_id: &u32,
        _task_obj: &String,
        path_executed: &[&'static str],
    ) -> Result<Option<&'static str>, String> {
        let next = match path_executed {
            [] => Some("A"),
            ["A"] => Some("B"),
            _ => None,
        };
        tracing::info!(task_id, ?path_executed, ?next, "next stage decided");
        Ok(next)
    }

    fn send_task(&self, exec_id: &u32, task_id: &u32, task_obj: &String) -> Result<(), String> {
        println!("sent task {task_id} ({task_obj}) to executor {exec_id}");
        Ok(())
    }

    fn disconnect_executor(&self, exec_id: &u32) -> Result<(), String> {
        println!("executor {exec_id} disconnected");
        Ok(())
    }

    fn task_error(&self, task_id: &u32, error_message: &str) -> Result<(), String> {
        println!("task {task_id} failed terminally: {error_message}");
        Ok(())
    }

    fn task_processed(&self, task_id: &u32, _task_obj: &String, exec_type: &&'static str) -> Result<(), String> {
        println!("task {task_id} processed by {exec_type}");
        Ok(())
    }
}

fn new_demo_dispatcher() -> Dispatcher<u32, &'static str, u32, String, DemoCallbacks> {
    let dispatcher: Dispatcher<u32, &'static str, u32, String, DemoCallbacks> = Dispatcher::new(DemoCallbacks);
    dispatcher.add_executor(1, "A", 1);
    dispatcher.add_executor(2, "B", 1);
    dispatcher
}

fn run_demo() {
    let dispatcher = new_demo_dispatcher();

    dispatcher
        .add_task(42, "build-artifact".to_string())
        .expect("dispatching a fresh task should not fail in this demo");

    dispatcher.task_processed(&1, &42, None).expect("executor 1 reports task done");
    dispatcher.task_processed(&2, &42, None).expect("executor 2 reports task done");

    println!("remaining task ids: {:?}", dispatcher.task_ids());
}

/// Same scenario as `demo`, but reports pool utilization at each stage
/// instead of a printed event trace.
fn run_dump() {
    let dispatcher = new_demo_dispatcher();

    dispatcher
        .add_task(42, "build-artifact".to_string())
        .expect("dispatching a fresh task should not fail in this demo");

    println!("executors connected: {:?}", dispatcher.executors_connected());
    println!("free slots on A: {:?}", dispatcher.free_executors(&"A"));
    println!("tasks on executor 1: {:?}", dispatcher.tasks_for_executor(&1));

    dispatcher.task_processed(&1, &42, None).expect("executor 1 reports task done");
    println!("free slots on B: {:?}", dispatcher.free_executors(&"B"));
    println!("tasks on executor 2: {:?}", dispatcher.tasks_for_executor(&2));

    dispatcher.task_processed(&2, &42, None).expect("executor 2 reports task done");
    println!("free slots on A: {:?}", dispatcher.free_executors(&"A"));
    println!("free slots on B: {:?}", dispatcher.free_executors(&"B"));
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Demo) {
        Command::Demo => run_demo(),
        Command::Dump => run_dump(),
        Command::Config => {
            let settings = dispatch_config::settings();
            println!("{settings:#?}");
        }
    }
}
