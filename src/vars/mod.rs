pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The namespace a variable is stored under. Lookup is scope-exact:
/// there is no implicit fallback between scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarScope {
    Global,
    Project,
    User,
    Session,
}

impl std::fmt::Display for VarScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VarScope::Global => write!(f, "global"),
            VarScope::Project => write!(f, "project"),
            VarScope::User => write!(f, "user"),
            VarScope::Session => write!(f, "session"),
        }
    }
}

/// A scope plus its owning key (project/user/session id; empty for
/// global). Two sessions never share a `Session` key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope: VarScope,
    pub owner: String,
}

impl ScopeKey {
    pub fn global() -> Self {
        Self {
            scope: VarScope::Global,
            owner: String::new(),
        }
    }

    pub fn project(id: impl Into<String>) -> Self {
        Self {
            scope: VarScope::Project,
            owner: id.into(),
        }
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self {
            scope: VarScope::User,
            owner: id.into(),
        }
    }

    pub fn session(id: impl Into<String>) -> Self {
        Self {
            scope: VarScope::Session,
            owner: id.into(),
        }
    }
}

/// Scoped key/value state with optional expiry.
///
/// Reads return `None` both for unset names and on storage errors, so
/// handler logic treats "unset" and "error" uniformly. Expiry is checked
/// lazily on read and by the explicit `cleanup_expired` sweep.
#[async_trait]
pub trait VariableStore: Send + Sync {
    async fn get(&self, key: &ScopeKey, name: &str) -> Option<Value>;

    async fn set(
        &self,
        key: &ScopeKey,
        name: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn has(&self, key: &ScopeKey, name: &str) -> bool;

    async fn delete(&self, key: &ScopeKey, name: &str) -> Result<bool>;

    /// All live variables under one scope key.
    async fn list(&self, key: &ScopeKey) -> HashMap<String, Value>;

    /// Purge expired entries, returning how many were removed.
    async fn cleanup_expired(&self) -> usize;
}

/// Largest integer a JSON number can carry without precision loss.
const MAX_SAFE_INT: i64 = 9_007_199_254_740_991;

/// Normalize a value to a storable primitive/plain-object form.
/// Integers beyond the safe range become strings so they survive
/// serialization through systems that read JSON numbers as f64.
pub fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64()
                && i.abs() > MAX_SAFE_INT
            {
                return Value::String(i.to_string());
            }
            if let Some(u) = n.as_u64()
                && u > MAX_SAFE_INT as u64
            {
                return Value::String(u.to_string());
            }
            Value::Number(n)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_passes_small_numbers() {
        assert_eq!(normalize(json!(42)), json!(42));
        assert_eq!(normalize(json!(3.5)), json!(3.5));
    }

    #[test]
    fn normalize_stringifies_unsafe_integers() {
        let big: i64 = 9_007_199_254_740_993;
        assert_eq!(normalize(json!(big)), json!("9007199254740993"));
    }

    #[test]
    fn normalize_recurses_into_objects() {
        let big: u64 = 18_446_744_073_709_551_615;
        let v = normalize(json!({ "a": [big], "b": "x" }));
        assert_eq!(v, json!({ "a": ["18446744073709551615"], "b": "x" }));
    }
}
