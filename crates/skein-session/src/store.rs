//! Persistence seam for channel membership.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Errors raised by a channel store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Set-valued key store used to replay channel membership after a restart.
#[async_trait]
pub trait ChannelStore: Send + Sync {
    /// Add `value` to the set under `key`.
    async fn add(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `value` from the set under `key`.
    async fn remove(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// All values under `key`.
    async fn load(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Drop `key` entirely.
    async fn remove_all(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store. Values under a key keep insertion order and are unique.
#[derive(Default)]
pub struct MemoryChannelStore {
    entries: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryChannelStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChannelStore for MemoryChannelStore {
    async fn add(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let values = entries.entry(key.to_string()).or_default();
        if !values.iter().any(|v| v == value) {
            values.push(value.to_string());
        }
        Ok(())
    }

    async fn remove(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        if let Some(values) = entries.get_mut(key) {
            values.retain(|v| v != value);
            if values.is_empty() {
                entries.remove(key);
            }
        }
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .read()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn remove_all(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_set_semantics() {
        let store = MemoryChannelStore::new();
        store.add("k", "a").await.unwrap();
        store.add("k", "b").await.unwrap();
        store.add("k", "a").await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), vec!["a", "b"]);

        store.remove("k", "a").await.unwrap();
        assert_eq!(store.load("k").await.unwrap(), vec!["b"]);

        store.remove_all("k").await.unwrap();
        assert!(store.load("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_key_loads_empty() {
        let store = MemoryChannelStore::new();
        assert!(store.load("nothing").await.unwrap().is_empty());
        store.remove("nothing", "x").await.unwrap();
    }
}
