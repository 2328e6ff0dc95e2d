use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SessionError, SessionResult};

/// Access + refresh credential pair. Always complete: both fields non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> SessionResult<Self> {
        let pair = Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        };
        pair.validate()?;
        Ok(pair)
    }

    /// Reject pairs with a blank field; a half pair must never reach storage.
    pub fn validate(&self) -> SessionResult<()> {
        if self.access_token.trim().is_empty() {
            return Err(SessionError::Validation("access token is empty".into()));
        }
        if self.refresh_token.trim().is_empty() {
            return Err(SessionError::Validation("refresh token is empty".into()));
        }
        Ok(())
    }
}

/// In-memory view of who is signed in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub is_authenticated: bool,
    pub tokens: Option<TokenPair>,
    pub identity: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Get the bearer token if signed in
    pub fn access_token(&self) -> Option<&str> {
        self.tokens.as_ref().map(|t| t.access_token.as_str())
    }
}
