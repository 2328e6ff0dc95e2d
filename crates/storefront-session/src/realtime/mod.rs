//! Real-time feeds over persistent push connections.
//!
//! This module provides:
//! - `ConnectionManager`: connect/disconnect, bounded retry on failed
//!   connects, and reaction to token rotation and auth failure
//! - `ChatFeed` / `NotificationFeed`: the concrete feeds
//! - `HubConnection`: the transport seam, with `WsHubConnection` as the
//!   WebSocket implementation

pub mod feeds;
pub mod hub;
pub mod manager;
pub mod ws;

pub use feeds::{ChatFeed, ChatManager, NotificationFeed, NotificationManager};
pub use hub::{AccessTokenProvider, HubConnection, HubConnectionFactory, HubLifecycle};
pub use manager::{ConnectionManager, ConnectionState, Feed, RealtimeContext, MAX_RECONNECT_ATTEMPTS};
pub use ws::{WsHubConnection, WsHubFactory};
