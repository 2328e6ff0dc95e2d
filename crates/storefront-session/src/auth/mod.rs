//! Authentication module for managing the session's credentials.
//!
//! This module provides:
//! - `CredentialStore`: the persisted token pair and in-memory session state
//! - `TokenBus`: broadcast of token rotation and terminal auth failure
//! - `RefreshCoordinator`: single-flight refresh against the identity server
//! - `SecureStorage`: OS keychain (`KeyringStorage`) or in-memory backends

pub mod bus;
pub mod credentials;
pub mod refresh;
pub mod storage;
pub mod tokens;

pub use bus::{TokenBus, TokenEvent, TokenEventKind};
pub use credentials::CredentialStore;
pub use refresh::RefreshCoordinator;
pub use storage::{KeyringStorage, MemoryStorage, SecureStorage};
pub use tokens::{SessionState, TokenPair};
