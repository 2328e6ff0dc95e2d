//! Storefront session core.
//!
//! Keeps a signed-in shopper's credentials fresh across every network caller:
//! HTTP requests refresh once and replay, real-time feeds reconnect with the
//! rotated token, and a dead refresh token ends the session everywhere.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod realtime;
pub mod session;
pub mod shell;

#[cfg(test)]
mod testutil;

pub use config::Config;
pub use error::{ErrorKind, SessionError, SessionResult};
pub use session::SessionManager;
pub use shell::{AppShell, HeadlessShell};
