use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use keyring::Entry;

use crate::error::{SessionError, SessionResult};

/// Minimal secure key/value persistence the credential store sits on.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn get(&self, key: &str) -> SessionResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> SessionResult<()>;
    async fn remove(&self, key: &str) -> SessionResult<()>;
}

/// OS keychain storage. Each key becomes one keyring entry under `service`.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    async fn with_entry<T, F>(&self, key: &str, op: F) -> SessionResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Entry) -> SessionResult<T> + Send + 'static,
    {
        let service = self.service.clone();
        let key = key.to_string();
        // keyring talks to the platform store synchronously
        tokio::task::spawn_blocking(move || {
            let entry = Entry::new(&service, &key)
                .map_err(|e| SessionError::Storage(format!("Failed to create keyring entry: {e}")))?;
            op(entry)
        })
        .await
        .map_err(|e| SessionError::Storage(format!("Keyring task failed: {e}")))?
    }
}

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn get(&self, key: &str) -> SessionResult<Option<String>> {
        self.with_entry(key, |entry| match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(SessionError::Storage(format!(
                "Failed to retrieve credential from keychain: {e}"
            ))),
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> SessionResult<()> {
        let value = value.to_string();
        self.with_entry(key, move |entry| {
            entry.set_password(&value).map_err(|e| {
                SessionError::Storage(format!("Failed to store credential in keychain: {e}"))
            })
        })
        .await
    }

    async fn remove(&self, key: &str) -> SessionResult<()> {
        self.with_entry(key, |entry| match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(SessionError::Storage(format!(
                "Failed to delete credential from keychain: {e}"
            ))),
        })
        .await
    }
}

/// Process-local storage for tests and headless hosts.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn get(&self, key: &str) -> SessionResult<Option<String>> {
        Ok(self.entries().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> SessionResult<()> {
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> SessionResult<()> {
        self.entries().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage_roundtrip_and_remove() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get("k").await.unwrap(), None);

        storage.set("k", "v").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));

        storage.remove("k").await.unwrap();
        storage.remove("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }
}
