//! Wiring for one signed-in session.
//!
//! `SessionManager` owns the bus, the credential store, the refresh
//! coordinator and the API client, and hands the same instances to every
//! real-time feed it creates. Nothing here is global: tests build as many
//! independent sessions as they like.

use std::sync::Arc;

use tracing::info;

use crate::api::{ApiClient, HttpTransport, ReqwestTransport};
use crate::auth::{
    CredentialStore, KeyringStorage, RefreshCoordinator, SecureStorage, SessionState, TokenBus,
    TokenEvent, TokenPair,
};
use crate::config::Config;
use crate::error::SessionResult;
use crate::realtime::{
    ChatFeed, ChatManager, HubConnectionFactory, NotificationFeed, NotificationManager,
    RealtimeContext, WsHubFactory,
};
use crate::shell::AppShell;

pub struct SessionManager {
    store: Arc<CredentialStore>,
    bus: TokenBus,
    coordinator: RefreshCoordinator,
    client: ApiClient,
    realtime: RealtimeContext,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        storage: Arc<dyn SecureStorage>,
        transport: Arc<dyn HttpTransport>,
        hub_factory: Arc<dyn HubConnectionFactory>,
        shell: Arc<dyn AppShell>,
    ) -> Self {
        let bus = TokenBus::new();
        let store = Arc::new(CredentialStore::new(storage, Arc::clone(&shell)));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::clone(&transport),
            shell,
        );
        let client = ApiClient::new(transport, Arc::clone(&store), coordinator.clone());
        let realtime = RealtimeContext {
            store: Arc::clone(&store),
            bus: bus.clone(),
            factory: hub_factory,
            ws_base_url: config.ws_base_url.clone(),
        };

        Self {
            store,
            bus,
            coordinator,
            client,
            realtime,
        }
    }

    /// Production wiring: OS keychain, reqwest, WebSocket hubs.
    pub fn from_config(config: &Config, shell: Arc<dyn AppShell>) -> SessionResult<Self> {
        let transport = ReqwestTransport::new(config.api_base_url.clone(), config.request_timeout)?;
        Ok(Self::new(
            config,
            Arc::new(KeyringStorage::new(config.keyring_service.clone())),
            Arc::new(transport),
            Arc::new(WsHubFactory),
            shell,
        ))
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn bus(&self) -> &TokenBus {
        &self.bus
    }

    pub fn session(&self) -> SessionState {
        self.store.session()
    }

    pub fn chat(&self) -> ChatManager {
        ChatManager::new(ChatFeed, self.realtime.clone())
    }

    pub fn notifications(&self) -> NotificationManager {
        NotificationManager::new(NotificationFeed, self.realtime.clone())
    }

    pub async fn sign_in(&self, pair: &TokenPair, identity: &str) -> SessionResult<()> {
        self.store.sign_in(pair, identity).await?;
        info!(identity = identity, "Signed in");
        Ok(())
    }

    /// Restore a session persisted by an earlier run.
    pub async fn restore(&self) -> bool {
        match self.store.get().await {
            Some(pair) => self.store.save(&pair).await.is_ok(),
            None => false,
        }
    }

    /// Force a refresh now (joins one already running).
    pub async fn refresh(&self) -> SessionResult<TokenPair> {
        self.coordinator.refresh().await
    }

    /// Drop the credentials and tear down every feed.
    pub async fn sign_out(&self) {
        self.store.clear().await;
        self.bus.emit(TokenEvent::AuthFailed);
        info!("Signed out");
    }
}
