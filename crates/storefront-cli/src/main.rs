//! Storefront session host.
//!
//! Restores (or seeds) a shopper session, keeps the chat and notification
//! feeds connected, and logs what they push until interrupted or until the
//! session ends.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storefront_session::auth::TokenPair;
use storefront_session::realtime::{ConnectionManager, Feed};
use storefront_session::{AppShell, Config, SessionManager};

const ACCESS_TOKEN_VAR: &str = "STOREFRONT_ACCESS_TOKEN";
const REFRESH_TOKEN_VAR: &str = "STOREFRONT_REFRESH_TOKEN";
const IDENTITY_VAR: &str = "STOREFRONT_IDENTITY";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

/// A restart request ends the main loop; the process exits and the
/// supervisor starts it again.
struct CliShell {
    restart: Arc<Notify>,
}

#[async_trait]
impl AppShell for CliShell {
    fn show_sign_in(&self) {
        eprintln!("Session ended. Provide new tokens via {ACCESS_TOKEN_VAR} and {REFRESH_TOKEN_VAR}.");
    }

    async fn wipe_local_state(&self) {
        info!("No local state to wipe");
    }

    fn restart(&self) {
        self.restart.notify_one();
    }
}

/// Log every listed local event of a feed.
fn log_feed<F: Feed>(manager: &ConnectionManager<F>, events: &[&'static str]) {
    let feed = manager.endpoint();
    for event in events {
        let event = *event;
        manager.on(event, move |args| {
            let args = Value::Array(args.clone());
            info!(feed = feed, event = event, args = %args, "Feed event");
        });
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    info!("Storefront session host starting");

    let config = Config::from_env().context("Invalid configuration")?;
    let restart = Arc::new(Notify::new());
    let shell = Arc::new(CliShell {
        restart: Arc::clone(&restart),
    });
    let session = SessionManager::from_config(&config, shell)?;

    let seeded = match (std::env::var(ACCESS_TOKEN_VAR), std::env::var(REFRESH_TOKEN_VAR)) {
        (Ok(access), Ok(refresh)) => {
            let identity = std::env::var(IDENTITY_VAR).unwrap_or_else(|_| "shopper".to_string());
            let pair = TokenPair::new(access, refresh)?;
            session.sign_in(&pair, &identity).await?;
            true
        }
        _ => false,
    };
    if !seeded && !session.restore().await {
        bail!("No saved session. Set {ACCESS_TOKEN_VAR} and {REFRESH_TOKEN_VAR} to sign in.");
    }

    let chat = session.chat();
    let notifications = session.notifications();

    log_feed(
        &chat,
        &["message", "message_read", "typing", "connected", "reconnecting", "reconnected", "disconnected", "error"],
    );
    log_feed(
        &notifications,
        &["notification", "notification_read", "connected", "reconnecting", "reconnected", "disconnected", "error"],
    );

    if let Err(e) = chat.connect().await {
        warn!(error = %e, "Chat connection failed; retrying in background");
    }
    if let Err(e) = notifications.connect().await {
        warn!(error = %e, "Notification connection failed; retrying in background");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        _ = restart.notified() => info!("Session ended; restarting"),
    }

    chat.destroy().await;
    notifications.destroy().await;

    info!("Storefront session host shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;
    use storefront_session::api::ReqwestTransport;
    use storefront_session::auth::MemoryStorage;
    use storefront_session::realtime::WsHubFactory;
    use storefront_session::HeadlessShell;

    #[test]
    fn test_feed_logging_runs_alongside_other_listeners() {
        let config = Config {
            api_base_url: "http://127.0.0.1:9".into(),
            ws_base_url: "ws://127.0.0.1:9".into(),
            request_timeout: Duration::from_secs(1),
            keyring_service: "storefront-test".into(),
        };
        let transport = ReqwestTransport::new(config.api_base_url.clone(), config.request_timeout).unwrap();
        let session = SessionManager::new(
            &config,
            Arc::new(MemoryStorage::new()),
            Arc::new(transport),
            Arc::new(WsHubFactory),
            Arc::new(HeadlessShell),
        );
        let chat = session.chat();
        let seen = Arc::new(std::sync::Mutex::new(0));
        let sink = Arc::clone(&seen);
        chat.on("message", move |_| *sink.lock().unwrap() += 1);

        log_feed(&chat, &["message", "typing"]);
        chat.emit("message", vec![json!({"text": "hello"})]);
        chat.emit("typing", vec![]);

        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
