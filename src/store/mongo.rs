//! MongoDB store backend
//!
//! The tree is the `data` field of a single document in a configured
//! collection. Writes translate the parsed path into Mongo's dotted
//! field-update syntax (`$set`/`$unset` on `data.<segment>...`); reads fetch
//! the document and navigate in memory so the path semantics stay identical
//! to the in-process backend.
//!
//! A change stream filtered to the store document feeds mutations back into
//! the broadcast hub as root-level snapshots: the stream's patch semantics
//! are not lossless under every mutation type, so narrowing is left to the
//! hub's filter pipeline.
//!
//! Collection-rooted mode treats every document in the collection as a
//! root-level child keyed by its `_id`; the first path segment names the
//! document.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{MongoConfig, StoreKind};
use crate::error::{GalenaError, Result};
use crate::query::filter;
use crate::query::matcher::{self, MatchResult};
use crate::query::parser::{self, Segment};
use crate::store::{ChangeListener, Store};

/// Delay between change-stream reconnection attempts
const CHANGE_FEED_RETRY: Duration = Duration::from_secs(5);

type SharedListener = Arc<RwLock<Option<ChangeListener>>>;

/// MongoDB-backed document tree.
pub struct MongoStore {
    client: Client,
    collection: Collection<Document>,
    config: MongoConfig,
    listener: SharedListener,
    shutdown_tx: watch::Sender<bool>,
}

impl MongoStore {
    /// Connect to MongoDB, verify the connection, and start the change feed.
    pub async fn connect(config: &MongoConfig) -> Result<Self> {
        let client = tokio::time::timeout(config.connect_timeout, Client::with_uri_str(&config.uri))
            .await
            .map_err(|_| GalenaError::Backend("timed out connecting to MongoDB".to_string()))??;

        tokio::time::timeout(
            config.connect_timeout,
            client.database("admin").run_command(doc! {"ping": 1}),
        )
        .await
        .map_err(|_| GalenaError::Backend("timed out pinging MongoDB".to_string()))??;

        let collection = client
            .database(&config.db_name)
            .collection::<Document>(&config.collection);

        let listener: SharedListener = Arc::new(RwLock::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if config.collection_root {
            info!(
                collection = %config.collection,
                "MongoDB store initialized with the collection as root"
            );
        } else {
            info!(
                document_id = %config.document_id,
                "MongoDB store initialized with a single tree document"
            );
        }

        tokio::spawn(run_change_feed(
            collection.clone(),
            Arc::clone(&listener),
            config.document_id.clone(),
            config.collection_root,
            shutdown_rx,
        ));

        Ok(Self {
            client,
            collection,
            config: config.clone(),
            listener,
            shutdown_tx,
        })
    }

    fn is_root(path: &str) -> bool {
        path.is_empty() || path == "."
    }

    async fn with_timeout<T, F>(&self, future: F) -> Result<T>
    where
        F: IntoFuture<Output = mongodb::error::Result<T>>,
    {
        tokio::time::timeout(self.config.op_timeout, future)
            .await
            .map_err(|_| GalenaError::Backend("MongoDB operation timed out".to_string()))?
            .map_err(GalenaError::from)
    }

    async fn fetch_document(&self) -> Result<Option<Document>> {
        self.with_timeout(
            self.collection
                .find_one(doc! {"_id": &self.config.document_id}),
        )
        .await
    }

    /// The tree of the single-document mode, or an empty mapping when the
    /// document does not exist yet.
    async fn document_tree(&self) -> Result<Value> {
        match self.fetch_document().await? {
            Some(doc) => document_data_value(&doc),
            None => Ok(Value::Object(Map::new())),
        }
    }

    /// The synthetic root of collection mode: every document keyed by its id.
    async fn collection_tree(&self) -> Result<Value> {
        let cursor = self.with_timeout(self.collection.find(doc! {})).await?;
        let documents: Vec<Document> = tokio::time::timeout(
            self.config.op_timeout,
            cursor.try_collect::<Vec<Document>>(),
        )
        .await
        .map_err(|_| GalenaError::Backend("MongoDB cursor read timed out".to_string()))??;

        let mut root = Map::new();
        for document in documents {
            let Some(id) = document.get("_id").map(bson_id_string) else {
                continue;
            };
            root.insert(id, serde_json::to_value(&document)?);
        }
        Ok(Value::Object(root))
    }

    async fn tree(&self) -> Result<Value> {
        if self.config.collection_root {
            self.collection_tree().await
        } else {
            self.document_tree().await
        }
    }

    /// Replace the collection contents with one document per top-level entry.
    async fn replace_collection(&self, data: Map<String, Value>) -> Result<()> {
        self.with_timeout(self.collection.delete_many(doc! {})).await?;

        for (key, value) in data {
            let mut document = match bson::to_bson(&value)? {
                Bson::Document(doc) => doc,
                other => doc! {"value": other},
            };
            if !document.contains_key("_id") {
                document.insert("_id", key);
            }
            self.with_timeout(self.collection.insert_one(document)).await?;
        }
        Ok(())
    }

    async fn set_collection(&self, path: &str, value: Value) -> Result<()> {
        if Self::is_root(path) {
            let map = value.as_object().cloned().ok_or_else(|| {
                GalenaError::InvalidOperation(
                    "value must be a mapping of documents when setting the collection root"
                        .to_string(),
                )
            })?;
            return self.replace_collection(map).await;
        }

        let segments = parser::parse(path)?;
        let (doc_id, rest) = split_document_path(&segments)?;

        if rest.is_empty() {
            // Whole-document replacement.
            let mut document = match bson::to_bson(&value)? {
                Bson::Document(doc) => doc,
                other => doc! {"value": other},
            };
            document.insert("_id", doc_id.clone());
            self.with_timeout(
                self.collection
                    .replace_one(doc! {"_id": &doc_id}, document)
                    .upsert(true),
            )
            .await?;
            return Ok(());
        }

        let field = mongo_field_path(rest)?;
        let mut set_doc = Document::new();
        set_doc.insert(field, bson::to_bson(&value)?);
        self.with_timeout(
            self.collection
                .update_one(doc! {"_id": &doc_id}, doc! {"$set": set_doc})
                .upsert(true),
        )
        .await?;
        Ok(())
    }

    async fn delete_collection(&self, path: &str) -> Result<()> {
        if Self::is_root(path) {
            self.with_timeout(self.collection.delete_many(doc! {})).await?;
            return Ok(());
        }

        let segments = parser::parse(path)?;
        let (doc_id, rest) = split_document_path(&segments)?;

        if rest.is_empty() {
            self.with_timeout(self.collection.delete_one(doc! {"_id": &doc_id}))
                .await?;
            return Ok(());
        }

        let field = mongo_field_path(rest)?;
        let mut unset_doc = Document::new();
        unset_doc.insert(field, Bson::String(String::new()));
        self.with_timeout(
            self.collection
                .update_one(doc! {"_id": &doc_id}, doc! {"$unset": unset_doc}),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn initialize(&self, data: Map<String, Value>) -> Result<()> {
        if self.config.collection_root {
            return self.replace_collection(data).await;
        }

        let data_doc = bson::to_document(&data)?;
        self.with_timeout(
            self.collection
                .replace_one(
                    doc! {"_id": &self.config.document_id},
                    doc! {"_id": &self.config.document_id, "data": data_doc},
                )
                .upsert(true),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let (clean_path, conditions) = filter::extract_conditions(path);

        let value = if Self::is_root(&clean_path) {
            self.tree().await?
        } else if self.config.collection_root {
            let segments = parser::parse(&clean_path)?;
            let (doc_id, rest) = split_document_path(&segments)?;
            let document = self
                .with_timeout(self.collection.find_one(doc! {"_id": &doc_id}))
                .await?
                .ok_or(GalenaError::PathNotFound)?;
            let doc_value = serde_json::to_value(&document)?;
            if rest.is_empty() {
                doc_value
            } else {
                navigate_segments(&doc_value, rest)?
            }
        } else {
            let tree = self.document_tree().await?;
            matcher::get(&tree, &clean_path)?
        };

        Ok(filter::apply_conditions(value, &conditions))
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        if self.config.collection_root {
            return self.set_collection(path, value).await;
        }

        if Self::is_root(path) {
            let map = value.as_object().cloned().ok_or_else(|| {
                GalenaError::InvalidOperation(
                    "value must be a mapping when setting the root".to_string(),
                )
            })?;
            return self.initialize(map).await;
        }

        let segments = parser::parse(path)?;
        let field = mongo_field_path(&segments)?;
        let mut set_doc = Document::new();
        set_doc.insert(format!("data.{field}"), bson::to_bson(&value)?);
        self.with_timeout(
            self.collection
                .update_one(
                    doc! {"_id": &self.config.document_id},
                    doc! {"$set": set_doc},
                )
                .upsert(true),
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.config.collection_root {
            return self.delete_collection(path).await;
        }

        if Self::is_root(path) {
            self.with_timeout(
                self.collection
                    .delete_one(doc! {"_id": &self.config.document_id}),
            )
            .await?;
            return Ok(());
        }

        let segments = parser::parse(path)?;
        let field = mongo_field_path(&segments)?;
        let mut unset_doc = Document::new();
        unset_doc.insert(format!("data.{field}"), Bson::String(String::new()));
        self.with_timeout(
            self.collection
                .update_one(
                    doc! {"_id": &self.config.document_id},
                    doc! {"$unset": unset_doc},
                ),
        )
        .await?;
        Ok(())
    }

    async fn to_bytes(&self) -> Result<Vec<u8>> {
        let tree = self.tree().await?;
        Ok(serde_json::to_vec(&tree)?)
    }

    async fn find_matches(&self, path: &str) -> Result<Vec<MatchResult>> {
        let (clean_path, conditions) = filter::extract_conditions(path);

        let tree = self.tree().await?;
        let results = matcher::find_matches(&tree, &clean_path)?;

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
        StoreKind::Mongo
    }

    async fn describe(&self) -> String {
        let mode = if self.config.collection_root {
            "collection-rooted".to_string()
        } else {
            format!("document-rooted (id: {})", self.config.document_id)
        };
        let count = self
            .with_timeout(self.collection.count_documents(doc! {}))
            .await
            .map(|n| n.to_string())
            .unwrap_or_else(|_| "unavailable".to_string());
        format!(
            "MongoDB store: {mode}, db={}, collection={}, documents={count}",
            self.config.db_name, self.config.collection
        )
    }

    fn supports_change_feed(&self) -> bool {
        true
    }

    fn set_change_listener(&self, listener: ChangeListener) {
        *self.listener.write() = Some(listener);
    }

    async fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
        self.client.clone().shutdown().await;
        info!("disconnected from MongoDB");
    }
}

/// Translate parsed segments to Mongo's dotted field syntax.
///
/// Indices become numeric field names; wildcards are not addressable in an
/// atomic update and are rejected.
fn mongo_field_path(segments: &[Segment]) -> Result<String> {
    let mut parts = Vec::new();
    for segment in segments {
        match segment {
            Segment::Root => continue,
            Segment::Property(name) => parts.push(name.clone()),
            Segment::Index(index) => parts.push(index.to_string()),
            Segment::Wildcard => {
                return Err(GalenaError::InvalidOperation(
                    "wildcards are not supported in backend updates".to_string(),
                ))
            }
        }
    }

    if parts.is_empty() {
        return Err(GalenaError::InvalidOperation(
            "path resolves to the document root".to_string(),
        ));
    }
    Ok(parts.join("."))
}

/// Split a collection-rooted path into the document id and the remainder.
fn split_document_path(segments: &[Segment]) -> Result<(String, &[Segment])> {
    let rest = match segments.first() {
        Some(Segment::Root) => &segments[1..],
        _ => segments,
    };
    match rest.split_first() {
        Some((Segment::Property(doc_id), tail)) => Ok((doc_id.clone(), tail)),
        _ => Err(GalenaError::InvalidOperation(
            "collection-rooted paths must begin with a document name".to_string(),
        )),
    }
}

fn navigate_segments(value: &Value, segments: &[Segment]) -> Result<Value> {
    let mut suffix = String::new();
    for segment in segments {
        match segment {
            Segment::Root => {}
            Segment::Property(name) => {
                suffix.push('.');
                suffix.push_str(name);
            }
            Segment::Index(index) => {
                suffix.push('[');
                suffix.push_str(&index.to_string());
                suffix.push(']');
            }
            Segment::Wildcard => {
                return Err(GalenaError::InvalidOperation(
                    "wildcards are not supported in get".to_string(),
                ))
            }
        }
    }
    matcher::get_relative(value, &suffix)
}

/// Extract the `data` field of a store document as a JSON value.
fn document_data_value(document: &Document) -> Result<Value> {
    match document.get("data").and_then(Bson::as_document) {
        Some(data) => Ok(serde_json::to_value(data)?),
        None => Ok(Value::Object(Map::new())),
    }
}

fn bson_id_string(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn change_feed_pipeline(document_id: &str, collection_root: bool) -> Vec<Document> {
    if collection_root {
        vec![doc! {
            "$match": {
                "operationType": {"$in": ["update", "replace", "insert", "delete"]},
            }
        }]
    } else {
        vec![doc! {
            "$match": {
                "operationType": {"$in": ["update", "replace", "insert"]},
                "documentKey._id": document_id,
            }
        }]
    }
}

/// Watch the collection's change stream and push snapshots to the installed
/// listener. Errors are logged and the stream is re-established after a
/// short delay; the task exits only on shutdown.
async fn run_change_feed(
    collection: Collection<Document>,
    listener: SharedListener,
    document_id: String,
    collection_root: bool,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let pipeline = change_feed_pipeline(&document_id, collection_root);
        let open = collection
            .watch()
            .pipeline(pipeline)
            .full_document(FullDocumentType::UpdateLookup)
            .into_future();

        let mut stream = tokio::select! {
            _ = shutdown_rx.changed() => return,
            result = open => match result {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "failed to open change stream, retrying");
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = tokio::time::sleep(CHANGE_FEED_RETRY) => continue,
                    }
                }
            },
        };

        debug!(
            mode = if collection_root { "collection" } else { "document" },
            "change stream established"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                event = stream.next() => match event {
                    Some(Ok(change)) => dispatch_change(change, &listener, collection_root),
                    Some(Err(e)) => {
                        warn!(error = %e, "change stream error, reconnecting");
                        break;
                    }
                    None => {
                        warn!("change stream closed, reconnecting");
                        break;
                    }
                },
            }
        }

        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(CHANGE_FEED_RETRY) => {}
        }
    }
}

fn dispatch_change(
    event: ChangeStreamEvent<Document>,
    listener: &SharedListener,
    collection_root: bool,
) {
    let guard = listener.read();
    let Some(callback) = guard.as_ref() else {
        return;
    };

    if collection_root {
        let Some(doc_id) = event
            .document_key
            .as_ref()
            .and_then(|key| key.get("_id"))
            .map(bson_id_string)
        else {
            return;
        };

        if matches!(event.operation_type, OperationType::Delete) {
            callback(&doc_id, Value::Null);
            return;
        }

        let Some(document) = event.full_document else {
            return;
        };
        match serde_json::to_value(&document) {
            Ok(value) => callback(&doc_id, value),
            Err(e) => debug!(error = %e, "failed to decode change-stream document"),
        }
    } else {
        let Some(document) = event.full_document else {
            return;
        };
        match document_data_value(&document) {
            // The stream cannot express sub-field patches losslessly, so
            // every change surfaces as a root-level snapshot; the hub's
            // filter pipeline narrows it per subscriber.
            Ok(value) => callback(".", value),
            Err(e) => debug!(error = %e, "failed to decode change-stream document"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mongo_field_path_translation() {
        let segments = parser::parse(".users[0].status").unwrap();
        assert_eq!(mongo_field_path(&segments).unwrap(), "users.0.status");
    }

    #[test]
    fn test_mongo_field_path_rejects_wildcard() {
        let segments = parser::parse(".users[*].status").unwrap();
        assert!(matches!(
            mongo_field_path(&segments),
            Err(GalenaError::InvalidOperation(_))
        ));
    }

    #[test]
    fn test_split_document_path() {
        let segments = parser::parse(".orders.items[2]").unwrap();
        let (doc_id, rest) = split_document_path(&segments).unwrap();
        assert_eq!(doc_id, "orders");
        assert_eq!(
            rest,
            &[Segment::Property("items".into()), Segment::Index(2)]
        );
    }

    #[test]
    fn test_split_document_path_rejects_index_first() {
        let segments = parser::parse(".[0]");
        // The parser itself refuses a bare index after the leading dot.
        assert!(segments.is_err());
    }

    #[test]
    fn test_change_feed_pipeline_document_mode() {
        let pipeline = change_feed_pipeline("latest", false);
        assert_eq!(pipeline.len(), 1);
        let matched = pipeline[0].get_document("$match").unwrap();
        assert_eq!(matched.get_str("documentKey._id").unwrap(), "latest");
    }

    #[test]
    fn test_change_feed_pipeline_collection_mode_watches_deletes() {
        let pipeline = change_feed_pipeline("ignored", true);
        let matched = pipeline[0].get_document("$match").unwrap();
        assert!(matched.get("documentKey._id").is_none());
        let ops = matched
            .get_document("operationType")
            .unwrap()
            .get_array("$in")
            .unwrap();
        assert!(ops.iter().any(|op| op.as_str() == Some("delete")));
    }

    #[test]
    fn test_document_data_value() {
        let document = doc! {"_id": "latest", "data": {"users": [{"id": 1}]}};
        let value = document_data_value(&document).unwrap();
        assert_eq!(value, json!({"users": [{"id": 1}]}));

        let empty = doc! {"_id": "latest"};
        assert_eq!(document_data_value(&empty).unwrap(), json!({}));
    }

    #[test]
    fn test_bson_id_string() {
        assert_eq!(bson_id_string(&Bson::String("abc".into())), "abc");
        assert_eq!(bson_id_string(&Bson::Int64(7)), "7");
    }

    // Requires a running MongoDB with change streams enabled (replica set).
    #[tokio::test]
    #[ignore]
    async fn test_live_round_trip() {
        let config = MongoConfig {
            uri: std::env::var("MONGO_URI")
                .unwrap_or_else(|_| "mongodb://localhost:27017".to_string()),
            db_name: "galena_test".to_string(),
            collection: "round_trip".to_string(),
            ..MongoConfig::default()
        };
        let store = MongoStore::connect(&config).await.unwrap();

        store
            .initialize_from_bytes(br#"{"data": {"users": [{"id": 1, "status": "online"}]}}"#)
            .await
            .unwrap();
        store
            .set(".data.users[0].status", json!("away"))
            .await
            .unwrap();
        assert_eq!(
            store.get(".data.users[0].status").await.unwrap(),
            json!("away")
        );

        store.delete(".data.users[0]").await.unwrap();
        assert_eq!(store.get(".data.users[0]").await.unwrap(), Value::Null);

        store.disconnect().await;
    }
}
