//! Streaming fan-out engine
//!
//! Server-sent-events delivery: per-connection [`Subscriber`]s with bounded
//! buffers and their own delivery tasks, fanned out to by the [`Hub`].

pub mod hub;
pub mod subscriber;

pub use hub::Hub;
pub use subscriber::{SseSink, Subscriber, MESSAGE_BUFFER_CAPACITY};
