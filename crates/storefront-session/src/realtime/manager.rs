//! Lifecycle owner for one real-time feed.
//!
//! Two reconnection mechanisms meet here and must not overlap:
//!
//! - Failure to *establish* a connection (`start()` errors on an explicit
//!   `connect()` or one of its retries) is handled by this manager: retries
//!   after 2s, 4s, 8s, 16s and 30s, then a terminal `"error"` event.
//! - Loss of an *established* connection is left to the hub transport's
//!   built-in reconnection. The manager only mirrors its signals into
//!   `Reconnecting`/`Connected`/`Disconnected` and never schedules a manual
//!   retry from them.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::hub::{AccessTokenProvider, HubConnection, HubConnectionFactory, HubLifecycle};
use crate::auth::{CredentialStore, TokenBus, TokenEventKind};
use crate::error::{SessionError, SessionResult};
use crate::events::{Emitter, ListenerId};

// ============================================================================
// Constants
// ============================================================================

/// Manual retries after a failed `start()` before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const BASE_RETRY_DELAY_MS: u64 = 1000;

const MAX_RETRY_DELAY_MS: u64 = 30_000;

/// Delay before manual retry number `attempt` (1-based).
pub fn retry_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_RETRY_DELAY_MS.saturating_mul(factor).min(MAX_RETRY_DELAY_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Local event map of a manager: event name to JSON arguments.
pub type FeedEmitter = Emitter<String, Vec<Value>>;

/// What distinguishes one feed from another: where it lives and which
/// server events it republishes.
pub trait Feed: Send + Sync + 'static {
    fn endpoint(&self) -> &'static str;

    /// `(server event, local event)` pairs wired on every connection.
    fn events(&self) -> &'static [(&'static str, &'static str)];

    fn register(&self, connection: &dyn HubConnection, emitter: &FeedEmitter) {
        for (server, local) in self.events() {
            let emitter = emitter.clone();
            let local = local.to_string();
            connection.on(
                server,
                Arc::new(move |args: &[Value]| emitter.emit(&local, &args.to_vec())),
            );
        }
    }

    fn unregister(&self, connection: &dyn HubConnection) {
        for (server, _) in self.events() {
            connection.off(server);
        }
    }
}

/// Shared collaborators every manager needs.
#[derive(Clone)]
pub struct RealtimeContext {
    pub store: Arc<CredentialStore>,
    pub bus: TokenBus,
    pub factory: Arc<dyn HubConnectionFactory>,
    pub ws_base_url: String,
}

struct Core {
    state: ConnectionState,
    connection: Option<Arc<dyn HubConnection>>,
    /// Bumped on every teardown; lifecycle signals from older connections
    /// carry a stale value and are ignored.
    generation: u64,
    attempts: u32,
    retry_timer: Option<JoinHandle<()>>,
    destroyed: bool,
}

struct ManagerInner<F> {
    feed: F,
    ctx: RealtimeContext,
    core: Mutex<Core>,
    emitter: FeedEmitter,
    bus_listeners: Mutex<Vec<(TokenEventKind, ListenerId)>>,
}

impl<F> Drop for ManagerInner<F> {
    fn drop(&mut self) {
        let listeners = self.bus_listeners.get_mut().unwrap_or_else(|p| p.into_inner());
        for (kind, id) in listeners.drain(..) {
            self.ctx.bus.off(kind, id);
        }
        let core = self.core.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(timer) = core.retry_timer.take() {
            timer.abort();
        }
    }
}

enum RetryDecision {
    Scheduled(u32, Duration),
    Exhausted,
}

/// Clone is cheap; clones drive the same connection.
pub struct ConnectionManager<F> {
    inner: Arc<ManagerInner<F>>,
}

impl<F> Clone for ConnectionManager<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Feed> ConnectionManager<F> {
    /// Create a disconnected manager subscribed to the token bus.
    pub fn new(feed: F, ctx: RealtimeContext) -> Self {
        let inner = Arc::new(ManagerInner {
            feed,
            ctx,
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                connection: None,
                generation: 0,
                attempts: 0,
                retry_timer: None,
                destroyed: false,
            }),
            emitter: FeedEmitter::new(),
            bus_listeners: Mutex::new(Vec::new()),
        });

        let bus = inner.ctx.bus.clone();
        let weak = Arc::downgrade(&inner);
        let refreshed = bus.on(TokenEventKind::TokenRefreshed, move |_| {
            if let Some(manager) = Self::upgrade(&weak) {
                manager.handle_token_refreshed();
            }
        });
        let weak = Arc::downgrade(&inner);
        let failed = bus.on(TokenEventKind::AuthFailed, move |_| {
            if let Some(manager) = Self::upgrade(&weak) {
                manager.handle_auth_failed();
            }
        });
        *inner.bus_listeners.lock().unwrap_or_else(|p| p.into_inner()) = vec![
            (TokenEventKind::TokenRefreshed, refreshed),
            (TokenEventKind::AuthFailed, failed),
        ];

        Self { inner }
    }

    fn upgrade(weak: &Weak<ManagerInner<F>>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn endpoint(&self) -> &'static str {
        self.inner.feed.endpoint()
    }

    pub fn url(&self) -> String {
        format!(
            "{}/{}",
            self.inner.ctx.ws_base_url.trim_end_matches('/'),
            self.inner.feed.endpoint()
        )
    }

    pub fn state(&self) -> ConnectionState {
        self.core().state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.core().attempts
    }

    pub fn has_pending_retry(&self) -> bool {
        self.core().retry_timer.is_some()
    }

    pub fn is_destroyed(&self) -> bool {
        self.core().destroyed
    }

    // ===== Local listeners =====

    pub fn on<L>(&self, event: &str, listener: L) -> ListenerId
    where
        L: Fn(&Vec<Value>) + Send + Sync + 'static,
    {
        self.inner.emitter.on(event.to_string(), listener)
    }

    pub fn off(&self, event: &str, id: ListenerId) {
        self.inner.emitter.off(&event.to_string(), id);
    }

    pub fn emit(&self, event: &str, args: Vec<Value>) {
        self.inner.emitter.emit(&event.to_string(), &args);
    }

    // ===== Lifecycle =====

    /// Open the connection. A no-op while a connection is being established
    /// or is already up. After the retry budget has been exhausted, an
    /// explicit call starts a fresh budget.
    pub async fn connect(&self) -> SessionResult<()> {
        {
            let mut core = self.core();
            if core.attempts >= MAX_RECONNECT_ATTEMPTS && core.retry_timer.is_none() {
                core.attempts = 0;
            }
        }
        self.attempt_connect().await
    }

    async fn attempt_connect(&self) -> SessionResult<()> {
        let (connection, generation) = {
            let mut core = self.core();
            if core.destroyed {
                return Err(SessionError::Connection(format!(
                    "{} manager has been destroyed",
                    self.endpoint()
                )));
            }
            if core.state != ConnectionState::Disconnected {
                return Ok(());
            }
            // Attempts stay sequential: a new one supersedes any pending timer.
            if let Some(timer) = core.retry_timer.take() {
                timer.abort();
            }
            core.state = ConnectionState::Connecting;
            let generation = core.generation;
            let connection = if let Some(existing) = core.connection.clone() {
                existing
            } else {
                let built = self.build_connection(generation);
                core.connection = Some(Arc::clone(&built));
                built
            };
            (connection, generation)
        };

        debug!(endpoint = self.endpoint(), "Starting real-time connection");
        let result = connection.start().await;

        let outcome = {
            let mut core = self.core();
            let superseded = core.destroyed
                || core.generation != generation
                || core.state != ConnectionState::Connecting;
            match result {
                Ok(()) if superseded => Err(None),
                Ok(()) => {
                    core.state = ConnectionState::Connected;
                    core.attempts = 0;
                    Ok(())
                }
                Err(e) if superseded => Err(Some((e, None))),
                Err(e) => {
                    core.state = ConnectionState::Disconnected;
                    let decision = self.schedule_retry(&mut core);
                    Err(Some((e, Some(decision))))
                }
            }
        };

        match outcome {
            Ok(()) => {
                info!(endpoint = self.endpoint(), "Real-time connection established");
                self.emit("connected", Vec::new());
                Ok(())
            }
            Err(None) => {
                // Torn down while starting; whoever tore it down owns the state.
                let _ = connection.stop().await;
                Err(SessionError::Connection("connection closed while starting".into()))
            }
            Err(Some((e, None))) => Err(e),
            Err(Some((e, Some(RetryDecision::Scheduled(attempt, delay))))) => {
                warn!(
                    endpoint = self.endpoint(),
                    error = %e,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Connection failed, retrying"
                );
                Err(e)
            }
            Err(Some((e, Some(RetryDecision::Exhausted)))) => {
                error!(endpoint = self.endpoint(), error = %e, "Connection failed, giving up");
                self.emit(
                    "error",
                    vec![json!({ "message": e.to_string(), "terminal": true })],
                );
                Err(e)
            }
        }
    }

    fn schedule_retry(&self, core: &mut Core) -> RetryDecision {
        if core.attempts >= MAX_RECONNECT_ATTEMPTS {
            return RetryDecision::Exhausted;
        }
        core.attempts += 1;
        let attempt = core.attempts;
        let delay = retry_delay(attempt);
        let weak = Arc::downgrade(&self.inner);
        core.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(manager) = Self::upgrade(&weak) else {
                return;
            };
            // Clear our own handle first so the attempt does not abort itself.
            manager.core().retry_timer = None;
            let _ = manager.attempt_connect().await;
        }));
        RetryDecision::Scheduled(attempt, delay)
    }

    fn build_connection(&self, generation: u64) -> Arc<dyn HubConnection> {
        let store = Arc::clone(&self.inner.ctx.store);
        let token: AccessTokenProvider = Arc::new(move || {
            let store = Arc::clone(&store);
            async move { store.access_token().await }.boxed()
        });
        let connection = self.inner.ctx.factory.build(&self.url(), token);

        let weak = Arc::downgrade(&self.inner);
        connection.on_lifecycle(Arc::new(move |signal: &HubLifecycle| {
            if let Some(manager) = Self::upgrade(&weak) {
                manager.handle_lifecycle(generation, signal);
            }
        }));
        self.inner.feed.register(connection.as_ref(), &self.inner.emitter);
        connection
    }

    fn handle_lifecycle(&self, generation: u64, signal: &HubLifecycle) {
        let event = {
            let mut core = self.core();
            let live = matches!(
                core.state,
                ConnectionState::Connected | ConnectionState::Reconnecting
            );
            if core.destroyed || core.generation != generation || !live {
                return;
            }
            match signal {
                HubLifecycle::Reconnecting(_) => {
                    core.state = ConnectionState::Reconnecting;
                    "reconnecting"
                }
                HubLifecycle::Reconnected => {
                    core.state = ConnectionState::Connected;
                    core.attempts = 0;
                    "reconnected"
                }
                HubLifecycle::Closed(_) => {
                    core.state = ConnectionState::Disconnected;
                    "disconnected"
                }
            }
        };

        let args = match signal {
            HubLifecycle::Reconnecting(Some(reason)) | HubLifecycle::Closed(Some(reason)) => {
                warn!(endpoint = self.endpoint(), reason = %reason, signal = event, "Real-time connection interrupted");
                vec![Value::String(reason.clone())]
            }
            _ => {
                info!(endpoint = self.endpoint(), signal = event, "Real-time connection state changed");
                Vec::new()
            }
        };
        self.emit(event, args);
    }

    /// Synchronous half of disconnect: state, timer and listeners. Returns
    /// the connection that still has to be stopped.
    fn teardown(&self) -> Option<Arc<dyn HubConnection>> {
        let connection = {
            let mut core = self.core();
            if let Some(timer) = core.retry_timer.take() {
                timer.abort();
            }
            core.state = ConnectionState::Disconnected;
            core.generation += 1;
            core.connection.take()
        };
        if let Some(ref connection) = connection {
            self.inner.feed.unregister(connection.as_ref());
        }
        connection
    }

    /// Close the connection. Safe to call in any state, any number of times.
    pub async fn disconnect(&self) {
        let Some(connection) = self.teardown() else {
            return;
        };
        if let Err(e) = connection.stop().await {
            warn!(endpoint = self.endpoint(), error = %e, "Error stopping real-time connection");
        }
        info!(endpoint = self.endpoint(), "Real-time connection closed");
        self.emit("disconnected", Vec::new());
    }

    /// Permanently shut the manager down. It will not connect again.
    pub async fn destroy(&self) {
        if let Some(connection) = self.shutdown() {
            let _ = connection.stop().await;
        }
    }

    fn shutdown(&self) -> Option<Arc<dyn HubConnection>> {
        self.core().destroyed = true;
        let connection = self.teardown();
        let listeners: Vec<_> = self
            .inner
            .bus_listeners
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for (kind, id) in listeners {
            self.inner.ctx.bus.off(kind, id);
        }
        self.inner.emitter.clear();
        debug!(endpoint = self.endpoint(), "Real-time manager destroyed");
        connection
    }

    /// The transport reads its token only at handshake, so a rotated token
    /// needs a fresh connection.
    fn handle_token_refreshed(&self) {
        if self.state() != ConnectionState::Connected {
            debug!(endpoint = self.endpoint(), "Token refreshed while not connected; nothing to do");
            return;
        }
        info!(endpoint = self.endpoint(), "Token refreshed; reconnecting");
        let manager = self.clone();
        tokio::spawn(async move {
            manager.disconnect().await;
            if let Err(e) = manager.connect().await {
                warn!(endpoint = manager.endpoint(), error = %e, "Reconnect after token refresh failed");
            }
        });
    }

    fn handle_auth_failed(&self) {
        warn!(endpoint = self.endpoint(), "Authentication failed; destroying real-time manager");
        if let Some(connection) = self.shutdown() {
            tokio::spawn(async move {
                let _ = connection.stop().await;
            });
        }
    }

    // ===== Outbound =====

    /// Connect unless a connection is up or already being established.
    pub async fn ensure_connected(&self) -> SessionResult<()> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => Ok(()),
            _ => self.connect().await,
        }
    }

    /// Call a server method. Transport failures are returned unmodified.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> SessionResult<Value> {
        self.ensure_connected().await?;
        let connection = self
            .core()
            .connection
            .clone()
            .ok_or_else(|| SessionError::Connection("not connected".into()))?;
        connection.invoke(method, args).await
    }
}
