//! # Galena
//!
//! A real-time change-broadcast server built around a hierarchical JSON
//! key-value store. Producers mutate sub-paths of a single logical document
//! over HTTP; consumers hold long-lived server-sent-event connections and
//! receive only the changes their path-plus-predicate filters select.
//!
//! ## Architecture
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`query`] | Path-expression parsing, evaluation, and predicate filters |
//! | [`store`] | The store contract with memory and MongoDB backends |
//! | [`sse`] | Per-connection subscribers and the broadcast hub |
//! | [`server`] | The hyper HTTP gateway and route handlers |
//!
//! Changes flow from producers through the store, into the hub's broadcast
//! entry point, and out through each matching subscriber's own bounded,
//! drop-on-full delivery queue. When the MongoDB backend is active, its
//! change stream feeds the same broadcast entry point, so a fleet of
//! instances sharing one database converges on the same events.

pub mod config;
pub mod error;
pub mod query;
pub mod server;
pub mod sse;
pub mod store;
pub mod telemetry;

pub use config::{Config, StoreKind};
pub use error::{GalenaError, Result};
pub use query::Filter;
pub use server::Gateway;
pub use sse::Hub;
pub use store::{create_store, MemoryStore, MongoStore, Store};
