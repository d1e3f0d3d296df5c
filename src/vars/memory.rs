use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::vars::{ScopeKey, VariableStore, normalize};

struct StoredVar {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredVar {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-memory variable store. Keys are (scope key, name); concurrent
/// writes to the same key are last-write-wins.
pub struct MemoryVariableStore {
    entries: RwLock<HashMap<(ScopeKey, String), StoredVar>>,
}

impl Default for MemoryVariableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryVariableStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VariableStore for MemoryVariableStore {
    async fn get(&self, key: &ScopeKey, name: &str) -> Option<Value> {
        let now = Utc::now();
        let map_key = (key.clone(), name.to_string());

        {
            let entries = self.entries.read().await;
            match entries.get(&map_key) {
                Some(stored) if !stored.is_expired(now) => return Some(stored.value.clone()),
                Some(_) => {} // expired, purge below
                None => return None,
            }
        }

        // Lazy purge of the expired entry.
        self.entries.write().await.remove(&map_key);
        None
    }

    async fn set(
        &self,
        key: &ScopeKey,
        name: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let expires_at = ttl.and_then(|d| {
            chrono::Duration::from_std(d)
                .ok()
                .map(|cd| Utc::now() + cd)
        });

        self.entries.write().await.insert(
            (key.clone(), name.to_string()),
            StoredVar {
                value: normalize(value),
                expires_at,
            },
        );
        Ok(())
    }

    async fn has(&self, key: &ScopeKey, name: &str) -> bool {
        self.get(key, name).await.is_some()
    }

    async fn delete(&self, key: &ScopeKey, name: &str) -> Result<bool> {
        let removed = self
            .entries
            .write()
            .await
            .remove(&(key.clone(), name.to_string()))
            .is_some();
        Ok(removed)
    }

    async fn list(&self, key: &ScopeKey) -> HashMap<String, Value> {
        let now = Utc::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|((k, _), stored)| k == key && !stored.is_expired(now))
            .map(|((_, name), stored)| (name.clone(), stored.value.clone()))
            .collect()
    }

    async fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, stored| !stored.is_expired(now));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryVariableStore::new();
        let key = ScopeKey::session("s1");
        store.set(&key, "name", json!("Alice"), None).await.unwrap();
        assert_eq!(store.get(&key, "name").await, Some(json!("Alice")));
        assert!(store.has(&key, "name").await);
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = MemoryVariableStore::new();
        store
            .set(&ScopeKey::session("s1"), "x", json!(1), None)
            .await
            .unwrap();
        assert_eq!(store.get(&ScopeKey::session("s2"), "x").await, None);
        assert_eq!(store.get(&ScopeKey::user("s1"), "x").await, None);
    }

    #[tokio::test]
    async fn expired_values_are_absent() {
        let store = MemoryVariableStore::new();
        let key = ScopeKey::session("s1");
        store
            .set(&key, "temp", json!(1), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.get(&key, "temp").await, None);
        assert!(store.list(&key).await.is_empty());
    }

    #[tokio::test]
    async fn cleanup_counts_purged_entries() {
        let store = MemoryVariableStore::new();
        let key = ScopeKey::global();
        store
            .set(&key, "a", json!(1), Some(Duration::from_millis(0)))
            .await
            .unwrap();
        store.set(&key, "b", json!(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_expired().await, 1);
        assert_eq!(store.get(&key, "b").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryVariableStore::new();
        let key = ScopeKey::project("p");
        store.set(&key, "x", json!(true), None).await.unwrap();
        assert!(store.delete(&key, "x").await.unwrap());
        assert!(!store.delete(&key, "x").await.unwrap());
    }
}
