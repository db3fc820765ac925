use std::sync::Arc;

use clap::Subcommand;
use focusflow_core::gateway::Gateway;
use focusflow_core::{AuthSession, AuthStore, Config, HttpGateway, KvStore, Runtime, SqliteStore};

use super::{print_json, CliResult};

#[derive(Subcommand)]
pub enum AuthAction {
    /// Save a session token and verify it against the backend
    Login {
        /// User id the token belongs to
        #[arg(long)]
        user: String,
        /// Bearer token
        #[arg(long)]
        token: String,
        /// Save without contacting the backend
        #[arg(long)]
        offline: bool,
    },
    /// Sign out and drop every cached entry for the user
    Logout,
    /// Print the saved session's user id
    Status,
}

fn auth_store() -> Result<AuthStore, Box<dyn std::error::Error>> {
    let durable: Arc<dyn KvStore> = Arc::new(SqliteStore::open()?);
    Ok(AuthStore::new(durable))
}

pub async fn run(action: AuthAction) -> CliResult {
    match action {
        AuthAction::Login {
            user,
            token,
            offline,
        } => {
            if !offline {
                let config = Config::load()?;
                let gateway = HttpGateway::new(&config.api, token.clone())?;
                gateway.user_stats().await?;
            }
            auth_store()?.save(&AuthSession {
                user_id: user.clone(),
                token,
            })?;
            println!("Logged in as {user}");
        }
        AuthAction::Logout => {
            let store = auth_store()?;
            if store.session()?.is_none() {
                println!("Not logged in");
                return Ok(());
            }
            // Clears per-user caches and the saved session.
            let mut runtime = Runtime::open(Config::load()?)?;
            runtime.logout();
            println!("Logged out");
        }
        AuthAction::Status => {
            let session = auth_store()?.session()?;
            print_json(&serde_json::json!({
                "loggedIn": session.is_some(),
                "userId": session.map(|s| s.user_id),
            }))?;
        }
    }
    Ok(())
}
