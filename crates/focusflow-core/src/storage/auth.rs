//! Durable bearer token and user id.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::KvStore;
use crate::error::StorageError;

const TOKEN_KEY: &str = "auth_token";
const USER_KEY: &str = "user_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
}

#[derive(Clone)]
pub struct AuthStore {
    durable: Arc<dyn KvStore>,
}

impl AuthStore {
    pub fn new(durable: Arc<dyn KvStore>) -> Self {
        Self { durable }
    }

    /// Current session, if both halves are present.
    pub fn session(&self) -> Result<Option<AuthSession>, StorageError> {
        let token = self.durable.get(TOKEN_KEY)?;
        let user_id = self.durable.get(USER_KEY)?;
        Ok(match (user_id, token) {
            (Some(user_id), Some(token)) if !user_id.is_empty() && !token.is_empty() => {
                Some(AuthSession { user_id, token })
            }
            _ => None,
        })
    }

    pub fn save(&self, session: &AuthSession) -> Result<(), StorageError> {
        self.durable.set(USER_KEY, &session.user_id)?;
        self.durable.set(TOKEN_KEY, &session.token)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.durable.remove(TOKEN_KEY)?;
        self.durable.remove(USER_KEY)
    }

    /// Whether a storage change touched the session entries.
    pub fn is_session_key(key: &str) -> bool {
        key == TOKEN_KEY || key == USER_KEY
    }
}
