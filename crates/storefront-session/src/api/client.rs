//! Authenticated API client.
//!
//! Every request carries the current bearer token. When the server answers
//! with the expired-token signature the client refreshes once for everyone:
//! the first caller starts the refresh, callers that hit the same signal
//! meanwhile wait in a FIFO queue, and once the refresh settles all of them
//! are replayed in arrival order (or all fail with the refresh error).

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use futures::future::join_all;
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::transport::{ApiRequest, ApiResponse, HttpTransport};
use crate::auth::refresh::{RefreshCoordinator, REFRESH_PATH};
use crate::auth::CredentialStore;
use crate::error::{SessionError, SessionResult};

// ============================================================================
// Constants
// ============================================================================

/// `code` field of a 401 body that means "refresh and try again".
/// Any other 401 is passed through to the caller untouched.
pub const EXPIRED_TOKEN_CODE: &str = "TOKEN_EXPIRED";

/// A request is replayed at most this many times after a refresh.
const MAX_REPLAYS: u8 = 1;

/// Does this response ask the client to refresh and retry?
pub fn is_token_expired(response: &ApiResponse) -> bool {
    response.status == 401
        && response.body.get("code").and_then(|c| c.as_str()) == Some(EXPIRED_TOKEN_CODE)
}

struct PendingReplay {
    request: ApiRequest,
    reply: oneshot::Sender<SessionResult<ApiResponse>>,
}

#[derive(Default)]
struct RefreshGate {
    refreshing: bool,
    queue: VecDeque<PendingReplay>,
}

struct ClientInner {
    transport: Arc<dyn HttpTransport>,
    store: Arc<CredentialStore>,
    coordinator: RefreshCoordinator,
    gate: Mutex<RefreshGate>,
    default_token: RwLock<Option<String>>,
}

/// Clone is cheap; clones share the refresh gate and queue.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

impl ApiClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<CredentialStore>,
        coordinator: RefreshCoordinator,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                transport,
                store,
                coordinator,
                gate: Mutex::new(RefreshGate::default()),
                default_token: RwLock::new(None),
            }),
        }
    }

    /// Token used when storage has none; updated after every refresh.
    pub fn default_token(&self) -> Option<String> {
        self.inner
            .default_token
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn gate(&self) -> MutexGuard<'_, RefreshGate> {
        self.inner.gate.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Send a request, refreshing and replaying once on token expiry.
    ///
    /// Any HTTP status other than the expired-token signature is returned as
    /// an `Ok` response; use the typed helpers to map failures to errors.
    pub async fn send(&self, request: ApiRequest) -> SessionResult<ApiResponse> {
        let response = self.dispatch(request.clone()).await?;
        if !is_token_expired(&response) {
            return Ok(response);
        }
        if request.replays >= MAX_REPLAYS {
            warn!(path = %request.path, "Token still expired after replay");
            return Err(SessionError::TokenExpired);
        }
        self.refresh_and_replay(request).await
    }

    /// Request phase: attach the bearer token, then hand off to the transport.
    async fn dispatch(&self, mut request: ApiRequest) -> SessionResult<ApiResponse> {
        if request.path != REFRESH_PATH {
            // Re-read on every call; a concurrent flow may have rotated it.
            request.bearer = match self.inner.store.access_token().await {
                Some(token) => Some(token),
                None => self.default_token(),
            };
        }
        self.inner.transport.execute(request).await
    }

    /// Hand one queued request to the transport with the refreshed token.
    /// No storage read happens here, so calling this in queue order puts the
    /// replays on the wire in queue order.
    fn replay(
        &self,
        mut request: ApiRequest,
        token: &str,
    ) -> impl Future<Output = SessionResult<ApiResponse>> + Send + '_ {
        request.replays += 1;
        if request.path != REFRESH_PATH {
            request.bearer = Some(token.to_string());
        }
        let sent = self.inner.transport.execute(request);
        async move {
            let response = sent.await?;
            if is_token_expired(&response) {
                return Err(SessionError::TokenExpired);
            }
            Ok(response)
        }
    }

    async fn refresh_and_replay(&self, request: ApiRequest) -> SessionResult<ApiResponse> {
        let (reply, waiter) = oneshot::channel();
        let lead = {
            let mut gate = self.gate();
            gate.queue.push_back(PendingReplay { request, reply });
            if gate.refreshing {
                debug!(queued = gate.queue.len(), "Refresh in progress; request queued");
                false
            } else {
                gate.refreshing = true;
                true
            }
        };

        if lead {
            // Settling runs detached so a caller that stops waiting cannot
            // leave the gate closed or the queue undrained.
            let client = self.clone();
            tokio::spawn(async move { client.settle_refresh().await });
        }

        waiter.await.unwrap_or_else(|_| {
            Err(SessionError::TransientNetwork("request replay was abandoned".into()))
        })
    }

    async fn settle_refresh(&self) {
        let outcome = self.inner.coordinator.refresh().await;
        let queued = {
            let mut gate = self.gate();
            gate.refreshing = false;
            std::mem::take(&mut gate.queue)
        };

        match outcome {
            Ok(pair) => {
                *self
                    .inner
                    .default_token
                    .write()
                    .unwrap_or_else(|p| p.into_inner()) = Some(pair.access_token.clone());
                info!(count = queued.len(), "Replaying queued requests");
                // Every replay is issued to the transport, in queue order,
                // before any completion is awaited.
                let replays: Vec<_> = queued
                    .into_iter()
                    .map(|PendingReplay { request, reply }| {
                        let sent = self.replay(request, &pair.access_token);
                        async move {
                            let _ = reply.send(sent.await);
                        }
                    })
                    .collect();
                join_all(replays).await;
            }
            Err(e) => {
                warn!(error = %e, count = queued.len(), "Refresh failed; rejecting queued requests");
                for pending in queued {
                    let _ = pending.reply.send(Err(e.clone()));
                }
            }
        }
    }

    // ===== Typed helpers =====

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> SessionResult<T> {
        let path = request.path.clone();
        let response = self.send(request).await?.error_for_status()?;
        serde_json::from_value(response.body).map_err(|e| {
            SessionError::InvalidResponse(format!("Failed to parse JSON response from {path}: {e}"))
        })
    }

    fn encode<B: Serialize>(body: &B) -> SessionResult<serde_json::Value> {
        serde_json::to_value(body)
            .map_err(|e| SessionError::Validation(format!("Failed to encode request body: {e}")))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> SessionResult<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> SessionResult<T> {
        self.send_json(ApiRequest::post(path, Self::encode(body)?)).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> SessionResult<T> {
        self.send_json(ApiRequest::new(Method::PUT, path).with_body(Self::encode(body)?))
            .await
    }

    pub async fn delete(&self, path: &str) -> SessionResult<()> {
        self.send(ApiRequest::new(Method::DELETE, path))
            .await?
            .error_for_status()?;
        Ok(())
    }
}
