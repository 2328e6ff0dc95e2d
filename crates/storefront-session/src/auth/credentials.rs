use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, warn};

use super::storage::SecureStorage;
use super::tokens::{SessionState, TokenPair};
use crate::error::{SessionError, SessionResult};
use crate::shell::AppShell;

/// Storage key of the single persisted token record.
const TOKENS_KEY: &str = "auth.tokens";

/// Sole writer of the persisted token pair.
///
/// The pair is stored as one serialized record, so a reader sees either the
/// whole previous pair or the whole new one.
pub struct CredentialStore {
    storage: Arc<dyn SecureStorage>,
    shell: Arc<dyn AppShell>,
    state: RwLock<SessionState>,
}

impl CredentialStore {
    pub fn new(storage: Arc<dyn SecureStorage>, shell: Arc<dyn AppShell>) -> Self {
        Self {
            storage,
            shell,
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Read the persisted pair. Storage failures are logged and read as "no pair".
    pub async fn get(&self) -> Option<TokenPair> {
        let raw = match self.storage.get(TOKENS_KEY).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Failed to read stored tokens");
                return None;
            }
        };

        match serde_json::from_str::<TokenPair>(&raw) {
            Ok(pair) if pair.validate().is_ok() => Some(pair),
            Ok(_) => {
                warn!("Stored token record is incomplete; ignoring it");
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse stored tokens");
                None
            }
        }
    }

    /// Current access token, re-read from storage.
    pub async fn access_token(&self) -> Option<String> {
        self.get().await.map(|pair| pair.access_token)
    }

    pub async fn save(&self, pair: &TokenPair) -> SessionResult<()> {
        pair.validate()?;
        let raw = serde_json::to_string(pair)
            .map_err(|e| SessionError::Storage(format!("Failed to serialize tokens: {e}")))?;
        self.storage.set(TOKENS_KEY, &raw).await?;

        let mut state = self.write_state();
        state.is_authenticated = true;
        state.tokens = Some(pair.clone());
        state.updated_at = Some(Utc::now());
        debug!("Token pair saved");
        Ok(())
    }

    /// Persist a freshly issued pair and record who it belongs to.
    pub async fn sign_in(&self, pair: &TokenPair, identity: impl Into<String>) -> SessionResult<()> {
        self.save(pair).await?;
        self.write_state().identity = Some(identity.into());
        Ok(())
    }

    /// Remove the persisted pair, reset the session, and send the user to sign-in.
    pub async fn clear(&self) {
        if let Err(e) = self.storage.remove(TOKENS_KEY).await {
            warn!(error = %e, "Failed to remove stored tokens");
        }
        *self.write_state() = SessionState::default();
        self.shell.show_sign_in();
    }

    /// Snapshot of the in-memory session state.
    pub fn session(&self) -> SessionState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(|p| p.into_inner())
    }
}
