use clap::Subcommand;
use focusflow_core::NewBreak;

use super::{finish, parse_instant, session, CliResult};

#[derive(Subcommand)]
pub enum BreakAction {
    /// Record a break
    Add {
        /// Break kind (e.g. "walk", "stretch")
        #[arg(long)]
        kind: String,
        /// Length in minutes
        #[arg(long)]
        minutes: Option<u32>,
        /// Free-form feedback
        #[arg(long)]
        feedback: Option<String>,
        /// Instant of the break (RFC 3339 or "now")
        #[arg(long)]
        at: Option<String>,
    },
}

pub async fn run(action: BreakAction) -> CliResult {
    let mut runtime = session().await?;

    match action {
        BreakAction::Add {
            kind,
            minutes,
            feedback,
            at,
        } => {
            let instant = at.as_deref().map(parse_instant).transpose()?;
            let record = runtime.add_break(NewBreak {
                kind,
                instant,
                duration_minutes: minutes,
                feedback,
            })?;
            finish(&mut runtime).await?;
            println!("Break recorded: {} at {}", record.kind, record.instant.to_rfc3339());
        }
    }
    Ok(())
}
