use tracing::debug;

use super::tokens::TokenPair;
use crate::events::{Emitter, ListenerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenEventKind {
    TokenRefreshed,
    AuthFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    TokenRefreshed(TokenPair),
    AuthFailed,
}

impl TokenEvent {
    pub fn kind(&self) -> TokenEventKind {
        match self {
            TokenEvent::TokenRefreshed(_) => TokenEventKind::TokenRefreshed,
            TokenEvent::AuthFailed => TokenEventKind::AuthFailed,
        }
    }
}

/// Publish/subscribe channel for credential changes.
///
/// One bus is created per session and handed to every component that reacts
/// to token rotation. Clones share the same listeners.
#[derive(Clone, Default)]
pub struct TokenBus {
    emitter: Emitter<TokenEventKind, TokenEvent>,
}

impl TokenBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, kind: TokenEventKind, listener: F) -> ListenerId
    where
        F: Fn(&TokenEvent) + Send + Sync + 'static,
    {
        self.emitter.on(kind, listener)
    }

    pub fn off(&self, kind: TokenEventKind, id: ListenerId) {
        self.emitter.off(&kind, id);
    }

    pub fn emit(&self, event: TokenEvent) {
        debug!(event = ?event.kind(), "Broadcasting token event");
        self.emitter.emit(&event.kind(), &event);
    }

    pub fn listener_count(&self, kind: TokenEventKind) -> usize {
        self.emitter.listener_count(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_events_reach_only_their_listeners() {
        let bus = TokenBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.on(TokenEventKind::TokenRefreshed, move |e| sink.lock().unwrap().push(e.clone()));
        let sink = Arc::clone(&seen);
        bus.on(TokenEventKind::AuthFailed, move |e| sink.lock().unwrap().push(e.clone()));

        let pair = TokenPair::new("a", "r").unwrap();
        bus.emit(TokenEvent::TokenRefreshed(pair.clone()));
        bus.emit(TokenEvent::AuthFailed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![TokenEvent::TokenRefreshed(pair), TokenEvent::AuthFailed]
        );
    }

    #[test]
    fn test_clones_share_listeners() {
        let bus = TokenBus::new();
        let other = bus.clone();
        let id = other.on(TokenEventKind::AuthFailed, |_| {});
        assert_eq!(bus.listener_count(TokenEventKind::AuthFailed), 1);

        bus.off(TokenEventKind::AuthFailed, id);
        assert_eq!(other.listener_count(TokenEventKind::AuthFailed), 0);
    }
}
