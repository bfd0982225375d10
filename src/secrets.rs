//! Secret storage contract and implementations
//!
//! Persisted token sets live in an external secret store.  This module
//! defines the consumed contract ([`SecretStore`]: get/set/delete plus a
//! change subscription), the canonical key format for dynamic provider
//! token sets, and two implementations:
//!
//! - [`KeyringSecretStore`] -- OS-native credential store (Keychain on
//!   macOS, Secret Service on Linux, Windows Credential Manager on Windows)
//! - [`MemorySecretStore`] -- in-process map for tests and embedders
//!   without an OS keyring
//!
//! The encryption backend itself is out of scope; only this contract is
//! consumed by the rest of the crate.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{DynauthError, Result};

// ---------------------------------------------------------------------------
// SecretKey
// ---------------------------------------------------------------------------

/// Canonical key under which a dynamic provider's token set is persisted.
///
/// Encoded as a JSON object so the cross-process change channel can route
/// events back to the owning provider:
/// `{"isDynamicAuthProvider":true,"authProviderId":"...","clientId":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretKey {
    /// Marks the key as belonging to a dynamic auth provider token set.
    #[serde(rename = "isDynamicAuthProvider")]
    pub is_dynamic_auth_provider: bool,

    /// The provider id the token set belongs to.
    #[serde(rename = "authProviderId")]
    pub auth_provider_id: String,

    /// The client id the token set was issued to.
    #[serde(rename = "clientId")]
    pub client_id: String,
}

impl SecretKey {
    /// Builds the key for a provider + client pair.
    pub fn new(auth_provider_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            is_dynamic_auth_provider: true,
            auth_provider_id: auth_provider_id.into(),
            client_id: client_id.into(),
        }
    }

    /// Encodes the key to its canonical JSON string form.
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| DynauthError::SecretStorage(format!("failed to encode secret key: {e}")))
    }

    /// Parses a raw store key, returning `None` for keys that are not
    /// dynamic-provider token set keys.
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_str::<Self>(raw)
            .ok()
            .filter(|key| key.is_dynamic_auth_provider)
    }
}

// ---------------------------------------------------------------------------
// SecretStore
// ---------------------------------------------------------------------------

/// Notification that the value stored under `key` changed.
#[derive(Debug, Clone)]
pub struct SecretChange {
    /// The raw store key whose value was set or deleted.
    pub key: String,
}

/// Consumed contract of the external secret storage collaborator.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the stored value for `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Deletes the value under `key`.  Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Subscribes to change notifications for all keys in this store.
    fn subscribe(&self) -> broadcast::Receiver<SecretChange>;
}

// ---------------------------------------------------------------------------
// KeyringSecretStore
// ---------------------------------------------------------------------------

/// [`SecretStore`] backed by the OS-native credential store.
///
/// Each key is stored as a keyring entry under a fixed service name, so
/// token sets for different providers never collide with other
/// applications.  Keyring access is blocking and runs on the tokio
/// blocking pool.
///
/// Change notifications cover writes made through this instance; a
/// cross-process change feed requires an external watcher pushing into the
/// same contract.
pub struct KeyringSecretStore {
    service: String,
    changes: broadcast::Sender<SecretChange>,
}

impl KeyringSecretStore {
    /// Creates a store namespaced under the given keyring service name.
    pub fn new(service: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            service: service.into(),
            changes,
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| DynauthError::SecretStorage(format!("keyring entry failed: {e}")))
    }
}

#[async_trait]
impl SecretStore for KeyringSecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entry = self.entry(key)?;
        let value = tokio::task::spawn_blocking(move || match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(DynauthError::SecretStorage(format!("keyring read failed: {e}"))),
        })
        .await
        .map_err(|e| DynauthError::SecretStorage(format!("keyring task failed: {e}")))??;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let entry = self.entry(key)?;
        let value = value.to_string();
        tokio::task::spawn_blocking(move || {
            entry
                .set_password(&value)
                .map_err(|e| DynauthError::SecretStorage(format!("keyring write failed: {e}")))
        })
        .await
        .map_err(|e| DynauthError::SecretStorage(format!("keyring task failed: {e}")))??;

        let _ = self.changes.send(SecretChange {
            key: key.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let entry = self.entry(key)?;
        tokio::task::spawn_blocking(move || match entry.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(DynauthError::SecretStorage(format!("keyring delete failed: {e}"))),
        })
        .await
        .map_err(|e| DynauthError::SecretStorage(format!("keyring task failed: {e}")))??;

        let _ = self.changes.send(SecretChange {
            key: key.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChange> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// MemorySecretStore
// ---------------------------------------------------------------------------

/// In-process [`SecretStore`] for tests and keyring-less environments.
///
/// Behaves like the keyring store, including change notifications, but
/// keeps all values in a plain map.
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<SecretChange>,
}

impl Default for MemorySecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySecretStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            values: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, key: &str) {
        let _ = self.changes.send(SecretChange {
            key: key.to_string(),
        });
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.notify(key);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self.values.lock().unwrap().remove(key).is_some();
        if removed {
            self.notify(key);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SecretChange> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // SecretKey
    // -----------------------------------------------------------------------

    #[test]
    fn test_secret_key_encodes_canonical_json() {
        let key = SecretKey::new("https://auth.example.com", "client-1");
        let encoded = key.encode().expect("encode");
        assert_eq!(
            encoded,
            r#"{"isDynamicAuthProvider":true,"authProviderId":"https://auth.example.com","clientId":"client-1"}"#
        );
    }

    #[test]
    fn test_secret_key_round_trips() {
        let key = SecretKey::new("provider-id", "client-id");
        let parsed = SecretKey::parse(&key.encode().expect("encode")).expect("parse");
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_secret_key_parse_rejects_foreign_keys() {
        assert!(SecretKey::parse("not-json").is_none());
        assert!(SecretKey::parse(r#"{"some":"other key"}"#).is_none());
        assert!(SecretKey::parse(
            r#"{"isDynamicAuthProvider":false,"authProviderId":"a","clientId":"b"}"#
        )
        .is_none());
    }

    // -----------------------------------------------------------------------
    // MemorySecretStore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_memory_store_set_get_delete() {
        let store = MemorySecretStore::new();

        assert!(store.get("k").await.unwrap().is_none());

        store.set("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.delete("k").await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_delete_is_idempotent() {
        let store = MemorySecretStore::new();
        store.delete("missing").await.unwrap();
        store.delete("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store_notifies_on_set() {
        let store = MemorySecretStore::new();
        let mut rx = store.subscribe();

        store.set("token-key", "value").await.unwrap();

        let change = rx.recv().await.expect("change event");
        assert_eq!(change.key, "token-key");
    }

    #[tokio::test]
    async fn test_memory_store_delete_of_absent_key_does_not_notify() {
        let store = MemorySecretStore::new();
        let mut rx = store.subscribe();

        store.delete("missing").await.unwrap();
        store.set("present", "v").await.unwrap();

        // The first observed event must be the set, not the no-op delete.
        let change = rx.recv().await.expect("change event");
        assert_eq!(change.key, "present");
    }

    // -----------------------------------------------------------------------
    // KeyringSecretStore  (requires system keyring; skipped in CI)
    // -----------------------------------------------------------------------

    #[tokio::test]
    #[ignore = "requires system keyring"]
    async fn test_keyring_store_round_trip() {
        let store = KeyringSecretStore::new("dynauth-test");
        let key = SecretKey::new("test-provider", "test-client")
            .encode()
            .expect("encode");

        store.set(&key, "[{\"fake\":true}]").await.expect("set");
        let loaded = store.get(&key).await.expect("get");
        assert_eq!(loaded, Some("[{\"fake\":true}]".to_string()));

        store.delete(&key).await.expect("delete");
        assert!(store.get(&key).await.expect("get after delete").is_none());
    }
}
