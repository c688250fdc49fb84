//! In-memory store backend
//!
//! The tree lives behind a single `parking_lot::RwLock`: reads proceed
//! concurrently, writes are exclusive. The store itself never emits change
//! notifications; the API layer broadcasts after a successful write.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::config::StoreKind;
use crate::error::{GalenaError, Result};
use crate::query::filter;
use crate::query::matcher::{self, MatchResult};
use crate::store::Store;

/// Memory-resident document tree.
pub struct MemoryStore {
    // Invariant: always a Value::Object.
    data: RwLock<Value>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Value::Object(Map::new())),
        }
    }

    fn is_root(path: &str) -> bool {
        path.is_empty() || path == "."
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn initialize(&self, data: Map<String, Value>) -> Result<()> {
        *self.data.write() = Value::Object(data);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let (clean_path, conditions) = filter::extract_conditions(path);

        let value = {
            let tree = self.data.read();
            if Self::is_root(&clean_path) {
                tree.clone()
            } else {
                matcher::get(&tree, &clean_path)?
            }
        };

        Ok(filter::apply_conditions(value, &conditions))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        let mut tree = self.data.write();

        if Self::is_root(path) {
            if !value.is_object() {
                return Err(GalenaError::InvalidOperation(
                    "value must be a mapping when setting the root".to_string(),
                ));
            }
            *tree = value;
            return Ok(());
        }

        matcher::set(&mut tree, path, value)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut tree = self.data.write();

        if Self::is_root(path) {
            *tree = Value::Object(Map::new());
            return Ok(());
        }

        matcher::delete(&mut tree, path)
    }

    async fn to_bytes(&self) -> Result<Vec<u8>> {
        let tree = self.data.read();
        Ok(serde_json::to_vec(&*tree)?)
    }

    async fn find_matches(&self, path: &str) -> Result<Vec<MatchResult>> {
        let (clean_path, conditions) = filter::extract_conditions(path);

        let results = {
            let tree = self.data.read();
            matcher::find_matches(&tree, &clean_path)?
        };

        if conditions.is_empty() {
            return Ok(results);
        }

        Ok(results
            .into_iter()
            .filter_map(|m| {
                filter::narrow_by_conditions(&m.value, &conditions).map(|value| MatchResult {
                    path: m.path,
                    value,
                })
            })
            .collect())
    }

    fn kind(&self) -> StoreKind {
        StoreKind::Memory
    }

    async fn describe(&self) -> String {
        let tree = self.data.read();
        let top_level = tree.as_object().map(|m| m.len()).unwrap_or(0);
        let size_kb = serde_json::to_vec(&*tree)
            .map(|b| b.len() as f64 / 1024.0)
            .unwrap_or(0.0);
        format!("in-memory store: {top_level} top-level keys, {size_kb:.2} KB")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object literal")
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        let data = object(json!({
            "data": {
                "users": [
                    {"id": 1, "status": "online"},
                    {"id": 2, "status": "offline"}
                ],
                "positions": [
                    {"trader": "abc", "amt": 10},
                    {"trader": "xyz", "amt": 20}
                ]
            }
        }));
        store.initialize(data).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_initialize_and_get_root() {
        let store = seeded().await;
        let root = store.get(".").await.unwrap();
        assert!(root.get("data").is_some());
        assert_eq!(store.get("").await.unwrap(), root);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = seeded().await;
        store
            .set(".data.users[0].status", json!("away"))
            .await
            .unwrap();
        assert_eq!(
            store.get(".data.users[0].status").await.unwrap(),
            json!("away")
        );
    }

    #[tokio::test]
    async fn test_set_root_requires_mapping() {
        let store = seeded().await;
        let err = store.set(".", json!([1, 2, 3])).await.unwrap_err();
        assert!(matches!(err, GalenaError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn test_set_root_replaces_tree() {
        let store = seeded().await;
        store.set(".", json!({"fresh": true})).await.unwrap();
        assert_eq!(store.get(".fresh").await.unwrap(), json!(true));
        assert!(store.get(".data").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_mapping_entry() {
        let store = seeded().await;
        store.delete(".data.positions").await.unwrap();
        assert!(matches!(
            store.get(".data.positions").await,
            Err(GalenaError::PathNotFound)
        ));
    }

    #[tokio::test]
    async fn test_delete_sequence_slot_becomes_null() {
        let store = seeded().await;
        store.delete(".data.users[0]").await.unwrap();
        assert_eq!(store.get(".data.users[0]").await.unwrap(), Value::Null);
        assert_eq!(
            store.get(".data.users[1].id").await.unwrap(),
            json!(2)
        );
    }

    #[tokio::test]
    async fn test_delete_root_resets() {
        let store = seeded().await;
        store.delete(".").await.unwrap();
        assert_eq!(store.get(".").await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_get_with_predicate_suffix() {
        let store = seeded().await;
        let value = store.get(".data.positions[trader=abc]").await.unwrap();
        assert_eq!(value, json!([{"trader": "abc", "amt": 10}]));
    }

    #[tokio::test]
    async fn test_get_rejects_wildcard() {
        let store = seeded().await;
        assert!(matches!(
            store.get(".data.users[*]").await,
            Err(GalenaError::InvalidOperation(_))
        ));
    }

    #[tokio::test]
    async fn test_find_matches_wildcard() {
        let store = seeded().await;
        let matches = store.find_matches(".data.users[*].status").await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].path, ".data.users[0].status");
    }

    #[tokio::test]
    async fn test_find_matches_with_predicates_drops_empty() {
        let store = seeded().await;
        let matches = store
            .find_matches(".data.positions[trader=nobody]")
            .await
            .unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_to_bytes_round_trip() {
        let store = seeded().await;
        let bytes = store.to_bytes().await.unwrap();
        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, store.get(".").await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_from_bytes_rejects_non_object() {
        let store = MemoryStore::new();
        assert!(store.initialize_from_bytes(b"[1,2,3]").await.is_err());
        assert!(store.initialize_from_bytes(b"not json").await.is_err());
    }
}
