use clap::Subcommand;
use focusflow_core::NewMood;

use super::{finish, parse_instant, print_json, session, CliResult};

#[derive(Subcommand)]
pub enum MoodAction {
    /// Record a mood check-in
    Add {
        /// Mood, 1 (low) to 5 (high)
        #[arg(long)]
        mood: i64,
        /// Stress, 1 (low) to 5 (high)
        #[arg(long)]
        stress: i64,
        /// Instant of the check-in (RFC 3339 or "now")
        #[arg(long, default_value = "now")]
        at: String,
    },
    /// Edit a mood check-in
    Update {
        /// Mood ID
        id: String,
        #[arg(long)]
        mood: i64,
        #[arg(long)]
        stress: i64,
        #[arg(long, default_value = "now")]
        at: String,
    },
    /// Delete a mood check-in
    Delete {
        /// Mood ID
        id: String,
    },
    /// List mood check-ins known to the backend
    List,
}

pub async fn run(action: MoodAction) -> CliResult {
    let mut runtime = session().await?;

    match action {
        MoodAction::Add { mood, stress, at } => {
            runtime.add_mood(NewMood {
                mood_value: mood,
                stress_value: stress,
                instant: parse_instant(&at)?,
            })?;
            finish(&mut runtime).await?;
            println!("Mood recorded");
        }
        MoodAction::Update {
            id,
            mood,
            stress,
            at,
        } => {
            runtime.update_mood(
                &id,
                NewMood {
                    mood_value: mood,
                    stress_value: stress,
                    instant: parse_instant(&at)?,
                },
            )?;
            finish(&mut runtime).await?;
            println!("Mood updated: {id}");
        }
        MoodAction::Delete { id } => {
            runtime.delete_mood(&id);
            finish(&mut runtime).await?;
            println!("Mood deleted: {id}");
        }
        MoodAction::List => {
            print_json(&runtime.weekly().moods())?;
        }
    }
    Ok(())
}
