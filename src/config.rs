//! Configuration module for Galena
//!
//! Configuration is environment-driven (the service is container-first), with
//! sensible defaults for every option. The server binary layers CLI overrides
//! on top of what `Config::from_env` produces.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Which storage backend a store handle is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// In-process tree guarded by a reader/writer lock
    Memory,
    /// MongoDB-backed tree with a change-stream feed
    Mongo,
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKind::Memory => write!(f, "memory"),
            StoreKind::Mongo => write!(f, "mongo"),
        }
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreKind::Memory),
            "mongo" | "mongodb" => Ok(StoreKind::Mongo),
            other => Err(format!("unknown store type: {other}")),
        }
    }
}

/// MongoDB backend configuration.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// Connection URI, credentials included when configured
    pub uri: String,
    /// Database name
    pub db_name: String,
    /// Collection holding the store document(s)
    pub collection: String,
    /// Identifier of the single tree document (document mode)
    pub document_id: String,
    /// When true, every document in the collection is a root-level child
    /// keyed by its `_id` and `document_id` is ignored
    pub collection_root: bool,
    /// Timeout applied to each database operation
    pub op_timeout: Duration,
    /// Timeout for the initial connection and ping
    pub connect_timeout: Duration,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            db_name: "test".to_string(),
            collection: "sse".to_string(),
            document_id: "latest".to_string(),
            collection_root: false,
            op_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port
    pub port: u16,
    /// Address to bind on
    pub bind: String,
    /// Storage backend selection
    pub store_type: StoreKind,
    /// Maximum request body size in megabytes
    pub max_request_size_mb: usize,
    /// Default log filter directive
    pub log_level: String,
    /// MongoDB options (used when `store_type` is `Mongo`)
    pub mongo: MongoConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: "0.0.0.0".to_string(),
            store_type: StoreKind::Memory,
            max_request_size_mb: 20,
            log_level: "info".to_string(),
            mongo: MongoConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Unrecognized values fall back to the defaults with a warning rather
    /// than failing startup.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(port) = env::var("PORT") {
            match port.parse::<u16>() {
                Ok(p) => config.port = p,
                Err(_) => warn!(value = %port, "ignoring unparseable PORT"),
            }
        }

        if let Ok(store_type) = env::var("STORE_TYPE") {
            match store_type.parse::<StoreKind>() {
                Ok(kind) => config.store_type = kind,
                Err(_) => {
                    warn!(value = %store_type, "unknown STORE_TYPE, defaulting to memory")
                }
            }
        }

        if let Ok(size) = env::var("MAX_REQUEST_SIZE_MB") {
            match size.parse::<usize>() {
                Ok(mb) if mb > 0 => config.max_request_size_mb = mb,
                _ => warn!(value = %size, "ignoring invalid MAX_REQUEST_SIZE_MB"),
            }
        }

        if let Ok(level) = env::var("GALENA_LOG_LEVEL") {
            config.log_level = level;
        }

        config.mongo = mongo_config_from_env();
        config
    }

    /// Maximum request body size in bytes.
    pub fn max_body_bytes(&self) -> usize {
        self.max_request_size_mb * 1024 * 1024
    }
}

fn mongo_config_from_env() -> MongoConfig {
    let mut mongo = MongoConfig {
        uri: build_mongo_uri(),
        ..MongoConfig::default()
    };

    if let Ok(db) = env::var("MONGO_DB_NAME") {
        if !db.is_empty() {
            mongo.db_name = db;
        }
    }
    if let Ok(coll) = env::var("MONGO_COLLECTION") {
        if !coll.is_empty() {
            mongo.collection = coll;
        }
    }

    let use_collection_root = matches!(
        env::var("MONGO_USE_COLLECTION_ROOT").as_deref(),
        Ok("true") | Ok("1")
    );
    let document_id = env::var("MONGO_DOCUMENT_ID").unwrap_or_default();

    // An explicit collection-root toggle, or an empty/sentinel document id,
    // switches the backend into collection-rooted mode.
    if use_collection_root || document_id == "collection" {
        mongo.collection_root = true;
    } else if !document_id.is_empty() {
        mongo.document_id = document_id;
    }

    if let Ok(secs) = env::var("MONGO_OP_TIMEOUT_SECS") {
        match secs.parse::<u64>() {
            Ok(s) if s > 0 => mongo.op_timeout = Duration::from_secs(s),
            _ => warn!(value = %secs, "ignoring invalid MONGO_OP_TIMEOUT_SECS"),
        }
    }

    mongo
}

/// Construct a MongoDB connection URI from the environment.
///
/// A fully configured `MONGO_URI` wins. A URI without credentials is spliced
/// with `MONGO_USER`/`MONGO_PASSWORD` when both are present. With no URI at
/// all, one is assembled from host/port/user/password/auth-db parts.
pub fn build_mongo_uri() -> String {
    if let Ok(uri) = env::var("MONGO_URI") {
        if !uri.is_empty() {
            if uri.contains('@') {
                return uri;
            }

            let user = env::var("MONGO_USER").unwrap_or_default();
            let pass = env::var("MONGO_PASSWORD").unwrap_or_default();
            if !user.is_empty() && !pass.is_empty() {
                if let Some((protocol, host)) = uri.split_once("://") {
                    return format!("{protocol}://{user}:{pass}@{host}");
                }
                warn!("MONGO_URI format not recognized, using as-is");
            }
            return uri;
        }
    }

    let host = env::var("MONGO_HOST").unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("MONGO_PORT").unwrap_or_else(|_| "27017".to_string());
    let user = env::var("MONGO_USER").unwrap_or_default();
    let pass = env::var("MONGO_PASSWORD").unwrap_or_default();
    let auth_db = env::var("MONGO_AUTH_DB").unwrap_or_else(|_| "admin".to_string());

    if !user.is_empty() && !pass.is_empty() {
        format!("mongodb://{user}:{pass}@{host}:{port}/?authSource={auth_db}")
    } else {
        format!("mongodb://{host}:{port}")
    }
}
