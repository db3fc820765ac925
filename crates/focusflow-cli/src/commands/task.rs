//! Task management commands for CLI.

use chrono::Duration;
use clap::Subcommand;
use focusflow_core::gateway::Gateway;
use focusflow_core::{NewTask, TaskKind};

use super::{finish, parse_instant, print_json, session, CliResult};

#[derive(Subcommand)]
pub enum TaskAction {
    /// Schedule a new task
    Add {
        /// Start instant (RFC 3339 or "now")
        #[arg(long, default_value = "now")]
        start: String,
        /// Length in minutes
        #[arg(long, default_value = "25")]
        minutes: i64,
        /// Schedule a break instead of work
        #[arg(long = "break")]
        is_break: bool,
        /// Disable the pomodoro timer for this task
        #[arg(long)]
        no_pomodoro: bool,
    },
    /// List all tasks
    List,
    /// List tasks still running or ahead
    Upcoming,
    /// Delete a task
    Delete {
        /// Task ID
        id: String,
    },
    /// Complete a task before its end
    Complete {
        /// Task ID
        id: String,
    },
}

pub async fn run(action: TaskAction) -> CliResult {
    let mut runtime = session().await?;

    match action {
        TaskAction::Add {
            start,
            minutes,
            is_break,
            no_pomodoro,
        } => {
            let start = parse_instant(&start)?;
            let input = NewTask {
                kind: if is_break { TaskKind::Break } else { TaskKind::Work },
                start,
                end: start + Duration::minutes(minutes),
                pomodoro_enabled: !no_pomodoro && !is_break,
            };
            runtime.create_task(input)?;
            finish(&mut runtime).await?;
            match runtime.timer().active_task() {
                Some(task) if !task.is_temporary() => {
                    println!("Task created: {}", task.id);
                }
                _ => println!("Task created"),
            }
        }
        TaskAction::List => {
            let tasks = runtime.timer().gateway().list_tasks().await?;
            print_json(&tasks)?;
        }
        TaskAction::Upcoming => {
            print_json(&runtime.timer().upcoming())?;
        }
        TaskAction::Delete { id } => {
            runtime.delete_task(&id);
            finish(&mut runtime).await?;
            println!("Task deleted: {id}");
        }
        TaskAction::Complete { id } => {
            if !runtime.complete_task(&id) {
                return Err(format!("task {id} is not upcoming or was already completed").into());
            }
            finish(&mut runtime).await?;
            println!("Task completed: {id}");
        }
    }
    Ok(())
}
