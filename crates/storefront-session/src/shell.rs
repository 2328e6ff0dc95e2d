//! Hooks into the host application that the session layer drives but does
//! not implement: screen navigation, local data disposal, and restart.

use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait AppShell: Send + Sync {
    /// Fallback navigation to the unauthenticated view.
    fn show_sign_in(&self);

    /// Discard every piece of locally held application data.
    async fn wipe_local_state(&self);

    /// Restart the application from its entry point.
    fn restart(&self);
}

/// Shell for hosts without a UI: every hook is a log line.
pub struct HeadlessShell;

#[async_trait]
impl AppShell for HeadlessShell {
    fn show_sign_in(&self) {
        info!("Session cleared; sign-in required");
    }

    async fn wipe_local_state(&self) {
        info!("Local state wiped");
    }

    fn restart(&self) {
        info!("Restart requested");
    }
}
