//! Single-flight token refresh against the identity server.
//!
//! Several callers can notice an expired token at the same moment. Each of
//! them calling the refresh endpoint would race, and the identity server
//! rotates refresh tokens, so the losers would invalidate the winner. The
//! coordinator keeps one shared in-flight refresh; every caller that arrives
//! while it runs awaits that same outcome.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use super::bus::{TokenBus, TokenEvent};
use super::credentials::CredentialStore;
use super::tokens::TokenPair;
use crate::api::transport::{ApiRequest, HttpTransport};
use crate::error::{SessionError, SessionResult};
use crate::shell::AppShell;

/// Path of the refresh endpoint, relative to the API base URL.
pub const REFRESH_PATH: &str = "/auth/refresh-token";

type SharedRefresh = Shared<BoxFuture<'static, SessionResult<TokenPair>>>;

#[derive(Debug, Deserialize)]
struct RefreshEnvelope {
    data: Option<RefreshData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshData {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

struct Inner {
    store: Arc<CredentialStore>,
    bus: TokenBus,
    transport: Arc<dyn HttpTransport>,
    shell: Arc<dyn AppShell>,
    in_flight: Mutex<Option<SharedRefresh>>,
}

/// Clone is cheap; clones share the in-flight slot.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<CredentialStore>,
        bus: TokenBus,
        transport: Arc<dyn HttpTransport>,
        shell: Arc<dyn AppShell>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                bus,
                transport,
                shell,
                in_flight: Mutex::new(None),
            }),
        }
    }

    /// Refresh the token pair, or join the refresh already running.
    pub async fn refresh(&self) -> SessionResult<TokenPair> {
        let outcome = {
            let mut slot = self.inner.slot();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Joining in-flight token refresh");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    // The task clears the slot itself; it cannot take the lock
                    // before this guard is released, so it never clears a slot
                    // it was not stored in.
                    let handle = tokio::spawn(async move {
                        let result = inner.perform_refresh().await;
                        inner.slot().take();
                        result
                    });
                    let shared = async move {
                        handle.await.unwrap_or_else(|e| {
                            Err(SessionError::TransientNetwork(format!("refresh task failed: {e}")))
                        })
                    }
                    .boxed()
                    .shared();
                    *slot = Some(shared.clone());
                    shared
                }
            }
        };
        outcome.await
    }

    pub fn is_refreshing(&self) -> bool {
        self.inner.slot().is_some()
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<SharedRefresh>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn perform_refresh(&self) -> SessionResult<TokenPair> {
        let refresh_token = self
            .store
            .get()
            .await
            .map(|pair| pair.refresh_token)
            .ok_or(SessionError::NoRefreshToken)?;

        info!("Refreshing access token");
        let request = ApiRequest::post(REFRESH_PATH, json!({ "refreshToken": refresh_token }));
        let response = match self.transport.execute(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token refresh failed; credentials kept");
                return Err(e);
            }
        };

        if response.status == 401 {
            self.end_session().await;
            return Err(SessionError::RefreshRejected);
        }

        let response = response.error_for_status().inspect_err(|e| {
            warn!(error = %e, "Token refresh failed; credentials kept");
        })?;
        let pair = parse_refresh_body(response.body)?;

        self.store.save(&pair).await?;
        self.bus.emit(TokenEvent::TokenRefreshed(pair.clone()));
        info!("Access token refreshed");
        Ok(pair)
    }

    /// The refresh token itself is dead: nothing local can be trusted anymore.
    async fn end_session(&self) {
        error!("Refresh token rejected; ending session");
        self.store.clear().await;
        self.bus.emit(TokenEvent::AuthFailed);
        self.shell.wipe_local_state().await;
        self.shell.restart();
    }
}

fn parse_refresh_body(body: serde_json::Value) -> SessionResult<TokenPair> {
    let envelope: RefreshEnvelope = serde_json::from_value(body)
        .map_err(|e| SessionError::InvalidRefreshResponse(e.to_string()))?;
    let data = envelope
        .data
        .ok_or_else(|| SessionError::InvalidRefreshResponse("missing data".into()))?;

    match (data.access_token, data.refresh_token) {
        (Some(access), Some(refresh)) if !access.is_empty() && !refresh.is_empty() => {
            Ok(TokenPair {
                access_token: access,
                refresh_token: refresh,
            })
        }
        _ => Err(SessionError::InvalidRefreshResponse(
            "response lacks accessToken or refreshToken".into(),
        )),
    }
}
