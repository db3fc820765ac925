pub mod auth;
pub mod breaks;
pub mod config;
pub mod mood;
pub mod task;
pub mod timer;
pub mod weekly;

use chrono::{DateTime, Utc};
use focusflow_core::{Config, Runtime};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Open the saved session, restore cached state and wait for the first
/// lookup and refresh to land.
pub async fn session() -> Result<Runtime, Box<dyn std::error::Error>> {
    let config = Config::load()?;
    let mut runtime = Runtime::open(config)?;
    runtime.start();
    runtime.settle().await;
    ensure_signed_in(&runtime)?;
    Ok(runtime)
}

/// Wait for outstanding requests and report a sign-out caused by them.
pub async fn finish(runtime: &mut Runtime) -> CliResult {
    runtime.settle().await;
    ensure_signed_in(runtime)
}

fn ensure_signed_in(runtime: &Runtime) -> CliResult {
    if runtime.signed_out() {
        return Err("session rejected by the server; run `focusflow auth login` again".into());
    }
    Ok(())
}

/// Parse an RFC 3339 instant, or "now".
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, String> {
    if raw.eq_ignore_ascii_case("now") {
        return Ok(Utc::now());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid instant '{raw}': {e}"))
}

pub fn print_json<T: serde::Serialize>(value: &T) -> CliResult {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
