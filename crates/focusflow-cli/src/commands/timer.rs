use clap::Subcommand;
use focusflow_core::{Runtime, TaskTimerEngine};
use serde_json::json;

use super::{print_json, session, CliResult};

#[derive(Subcommand)]
pub enum TimerAction {
    /// Print the tracked task and its progress as JSON
    Status,
    /// Follow the tracked task until interrupted, printing progress and
    /// events as JSON lines
    Watch,
}

fn status(engine: &TaskTimerEngine) -> serde_json::Value {
    json!({
        "task": engine.active_task(),
        "phase": engine.phase(),
        "progress": engine.progress(),
        "running": engine.is_running(),
        "scheduledForFuture": engine.scheduled_for_future(),
    })
}

pub async fn run(action: TimerAction) -> CliResult {
    let mut runtime = session().await?;

    match action {
        TimerAction::Status => print_json(&status(runtime.timer()))?,
        TimerAction::Watch => watch(&mut runtime).await?,
    }
    Ok(())
}

async fn watch(runtime: &mut Runtime) -> CliResult {
    let cancel = runtime.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    let (subscription, mut events) = runtime.bus().subscribe_channel();
    let mut last_seen = None;

    println!("{}", serde_json::to_string(&status(runtime.timer()))?);
    while runtime.step().await {
        while let Ok(event) = events.try_recv() {
            println!("{}", serde_json::to_string(&event)?);
        }
        let pct = runtime.timer().progress().floor() as u8;
        let id = runtime.timer().active_task().map(|t| t.id.clone());
        if last_seen != Some((id.clone(), pct)) {
            println!("{}", serde_json::to_string(&status(runtime.timer()))?);
            last_seen = Some((id, pct));
        }
    }

    runtime.bus().unsubscribe(subscription);
    if runtime.signed_out() {
        return Err("signed out".into());
    }
    Ok(())
}
