//! The persistent push connection the managers drive.
//!
//! A hub connection carries named server events and request/response
//! invocations over one long-lived channel. It owns its own reconnection
//! after an established connection drops and reports that through
//! [`HubLifecycle`] signals.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::SessionResult;

/// Handler for one named server event.
pub type HubHandler = Arc<dyn Fn(&[Value]) + Send + Sync>;

/// Supplies the bearer token; called once per (re)connect handshake.
pub type AccessTokenProvider = Arc<dyn Fn() -> BoxFuture<'static, Option<String>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubLifecycle {
    /// An established connection dropped; the transport is retrying.
    Reconnecting(Option<String>),
    /// The transport's own retry succeeded.
    Reconnected,
    /// The connection is gone for good (stopped, or retries exhausted).
    Closed(Option<String>),
}

pub type LifecycleHandler = Arc<dyn Fn(&HubLifecycle) + Send + Sync>;

#[async_trait]
pub trait HubConnection: Send + Sync {
    async fn start(&self) -> SessionResult<()>;

    async fn stop(&self) -> SessionResult<()>;

    /// Call a server method and wait for its completion.
    async fn invoke(&self, method: &str, args: Vec<Value>) -> SessionResult<Value>;

    /// Route a server event to `handler`, replacing any earlier handler.
    fn on(&self, event: &str, handler: HubHandler);

    fn off(&self, event: &str);

    fn on_lifecycle(&self, handler: LifecycleHandler);
}

pub trait HubConnectionFactory: Send + Sync {
    fn build(&self, url: &str, token: AccessTokenProvider) -> Arc<dyn HubConnection>;
}
