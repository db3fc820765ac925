use clap::Subcommand;
use serde_json::json;

use super::{print_json, session, CliResult};

#[derive(Subcommand)]
pub enum WeeklyAction {
    /// Print the seven-day window, oldest day first
    Show,
    /// Print only the current and longest streaks
    Streak,
}

pub async fn run(action: WeeklyAction) -> CliResult {
    let runtime = session().await?;
    let aggregate = runtime.weekly().aggregate();

    match action {
        WeeklyAction::Show => print_json(aggregate)?,
        WeeklyAction::Streak => print_json(&json!({
            "currentStreak": aggregate.streaks.current,
            "longestStreak": aggregate.streaks.longest,
        }))?,
    }
    Ok(())
}
