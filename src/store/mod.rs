//! Hierarchical store abstraction
//!
//! A [`Store`] is a path-addressed JSON document tree. Two backends implement
//! the same contract: an in-process tree behind a reader/writer lock and a
//! MongoDB-backed tree with a change-stream feed. The broadcast hub depends
//! only on this trait plus the change-feed capability probe.

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::config::{Config, StoreKind};
use crate::error::Result;
use crate::query::matcher::MatchResult;

/// Callback invoked by a backend when its change feed reports a mutation.
///
/// Receives the changed path and the new value (`null` for deletions).
pub type ChangeListener = Box<dyn Fn(&str, Value) + Send + Sync>;

/// Contract shared by all store backends.
///
/// All operations are safe for arbitrary concurrent callers. Paths may carry
/// a `[key=value]` predicate suffix, which implicitly filters read results.
#[async_trait]
pub trait Store: Send + Sync {
    /// Replace the whole tree atomically.
    async fn initialize(&self, data: Map<String, Value>) -> Result<()>;

    /// Retrieve the value at `path`. Empty or `.` returns the whole tree.
    async fn get(&self, path: &str) -> Result<Value>;

    /// Set the value at `path`. Setting the root requires a mapping.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Delete the value at `path`. The root delete resets the tree.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Serialize the whole tree to JSON bytes.
    async fn to_bytes(&self) -> Result<Vec<u8>>;

    /// Wildcard- and predicate-aware multi-result lookup.
    async fn find_matches(&self, path: &str) -> Result<Vec<MatchResult>>;

    /// Which backend this store is.
    fn kind(&self) -> StoreKind;

    /// Human-readable summary of the store contents, for startup logging.
    async fn describe(&self) -> String;

    /// Parse JSON bytes and [`initialize`](Store::initialize).
    async fn initialize_from_bytes(&self, bytes: &[u8]) -> Result<()> {
        let data: Map<String, Value> = serde_json::from_slice(bytes)?;
        self.initialize(data).await
    }

    /// Parse JSON bytes and [`set`](Store::set).
    async fn set_from_bytes(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let value: Value = serde_json::from_slice(bytes)?;
        self.set(path, value).await
    }

    /// Whether this backend can push change notifications.
    fn supports_change_feed(&self) -> bool {
        false
    }

    /// Install the change-notification callback. A no-op for backends
    /// without a change feed.
    fn set_change_listener(&self, _listener: ChangeListener) {}

    /// Release backend resources. A no-op for in-process backends.
    async fn disconnect(&self) {}
}

/// Build the store selected by the configuration.
pub async fn create_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.store_type {
        StoreKind::Memory => {
            info!("using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreKind::Mongo => {
            info!(
                db = %config.mongo.db_name,
                collection = %config.mongo.collection,
                collection_root = config.mongo.collection_root,
                "using MongoDB store"
            );
            let store = MongoStore::connect(&config.mongo).await?;
            Ok(Arc::new(store))
        }
    }
}
