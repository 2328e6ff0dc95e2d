//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::api::transport::{ApiRequest, ApiResponse, HttpTransport};
use crate::auth::storage::SecureStorage;
use crate::error::{SessionError, SessionResult};
use crate::realtime::hub::{
    AccessTokenProvider, HubConnection, HubConnectionFactory, HubHandler, HubLifecycle,
    LifecycleHandler,
};
use crate::shell::AppShell;

// ============================================================================
// HTTP
// ============================================================================

type Route = dyn Fn(&ApiRequest) -> (Duration, SessionResult<ApiResponse>) + Send + Sync;

/// Records every request and answers through `route` after its delay.
pub struct MockTransport {
    route: Box<Route>,
    calls: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new<F>(route: F) -> Self
    where
        F: Fn(&ApiRequest) -> (Duration, SessionResult<ApiResponse>) + Send + Sync + 'static,
    {
        Self {
            route: Box::new(route),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.path == path).count()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn execute(&self, request: ApiRequest) -> SessionResult<ApiResponse> {
        let (delay, result) = (self.route)(&request);
        self.calls.lock().unwrap().push(request);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

pub fn refresh_ok(access: &str, refresh: &str) -> ApiResponse {
    ApiResponse::new(
        200,
        json!({ "data": { "accessToken": access, "refreshToken": refresh } }),
    )
}

pub fn expired() -> ApiResponse {
    ApiResponse::new(401, json!({ "code": "TOKEN_EXPIRED", "message": "jwt expired" }))
}

// ============================================================================
// Storage and shell
// ============================================================================

pub struct FailingStorage;

#[async_trait]
impl SecureStorage for FailingStorage {
    async fn get(&self, _key: &str) -> SessionResult<Option<String>> {
        Err(SessionError::Storage("keychain locked".into()))
    }

    async fn set(&self, _key: &str, _value: &str) -> SessionResult<()> {
        Err(SessionError::Storage("keychain locked".into()))
    }

    async fn remove(&self, _key: &str) -> SessionResult<()> {
        Err(SessionError::Storage("keychain locked".into()))
    }
}

#[derive(Default)]
pub struct RecordingShell {
    sign_ins: AtomicUsize,
    wipes: AtomicUsize,
    restarts: AtomicUsize,
}

impl RecordingShell {
    pub fn sign_in_count(&self) -> usize {
        self.sign_ins.load(Ordering::SeqCst)
    }

    pub fn wipe_count(&self) -> usize {
        self.wipes.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AppShell for RecordingShell {
    fn show_sign_in(&self) {
        self.sign_ins.fetch_add(1, Ordering::SeqCst);
    }

    async fn wipe_local_state(&self) {
        self.wipes.fetch_add(1, Ordering::SeqCst);
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Hub
// ============================================================================

#[derive(Default)]
struct HubControl {
    start_failures: AtomicU32,
    start_delay: Mutex<Duration>,
}

/// Builds `MockHub`s and remembers each one in build order.
#[derive(Default)]
pub struct MockHubFactory {
    control: Arc<HubControl>,
    hubs: Mutex<Vec<(String, Arc<MockHub>)>>,
}

impl MockHubFactory {
    /// Make the next `count` start calls fail (across all hubs).
    pub fn fail_starts(&self, count: u32) {
        self.control.start_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.control.start_delay.lock().unwrap() = delay;
    }

    pub fn build_count(&self) -> usize {
        self.hubs.lock().unwrap().len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.hubs.lock().unwrap().iter().map(|(url, _)| url.clone()).collect()
    }

    pub fn hub(&self, index: usize) -> Arc<MockHub> {
        Arc::clone(&self.hubs.lock().unwrap()[index].1)
    }
}

impl HubConnectionFactory for MockHubFactory {
    fn build(&self, url: &str, token: AccessTokenProvider) -> Arc<dyn HubConnection> {
        let hub = Arc::new(MockHub {
            control: Arc::clone(&self.control),
            token,
            handlers: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
            start_times: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
            invocations: Mutex::new(Vec::new()),
            invoke_error: Mutex::new(None),
        });
        self.hubs.lock().unwrap().push((url.to_string(), Arc::clone(&hub)));
        hub
    }
}

pub struct MockHub {
    control: Arc<HubControl>,
    token: AccessTokenProvider,
    handlers: Mutex<HashMap<String, HubHandler>>,
    lifecycle: Mutex<Vec<LifecycleHandler>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
    start_times: Mutex<Vec<Instant>>,
    stops: AtomicUsize,
    invocations: Mutex<Vec<(String, Vec<Value>)>>,
    invoke_error: Mutex<Option<SessionError>>,
}

impl MockHub {
    pub fn start_count(&self) -> usize {
        self.start_times.lock().unwrap().len()
    }

    pub fn start_times(&self) -> Vec<Instant> {
        self.start_times.lock().unwrap().clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens_seen.lock().unwrap().clone()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }

    pub fn invocations(&self) -> Vec<(String, Vec<Value>)> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn fail_invocations(&self, error: SessionError) {
        *self.invoke_error.lock().unwrap() = Some(error);
    }

    /// Simulate a server-pushed event.
    pub fn fire(&self, event: &str, args: Vec<Value>) {
        let handler = self.handlers.lock().unwrap().get(event).cloned();
        if let Some(handler) = handler {
            handler(&args);
        }
    }

    /// Simulate a transport lifecycle signal.
    pub fn signal(&self, event: HubLifecycle) {
        let handlers = self.lifecycle.lock().unwrap().clone();
        for handler in handlers {
            handler(&event);
        }
    }
}

#[async_trait]
impl HubConnection for MockHub {
    async fn start(&self) -> SessionResult<()> {
        self.start_times.lock().unwrap().push(Instant::now());
        let token = (self.token)().await;
        self.tokens_seen.lock().unwrap().push(token);

        let delay = *self.control.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failures = &self.control.start_failures;
        let remaining = failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                failures.store(remaining - 1, Ordering::SeqCst);
            }
            return Err(SessionError::Connection("connection refused".into()));
        }
        Ok(())
    }

    async fn stop(&self) -> SessionResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> SessionResult<Value> {
        if let Some(error) = self.invoke_error.lock().unwrap().clone() {
            return Err(error);
        }
        let echo = args.first().cloned().unwrap_or(Value::Null);
        self.invocations.lock().unwrap().push((method.to_string(), args));
        Ok(echo)
    }

    fn on(&self, event: &str, handler: HubHandler) {
        self.handlers.lock().unwrap().insert(event.to_string(), handler);
    }

    fn off(&self, event: &str) {
        self.handlers.lock().unwrap().remove(event);
    }

    fn on_lifecycle(&self, handler: LifecycleHandler) {
        self.lifecycle.lock().unwrap().push(handler);
    }
}
