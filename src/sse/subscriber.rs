//! SSE subscriber
//!
//! One subscriber per long-lived `/events` connection. Each subscriber owns a
//! bounded frame buffer and a delivery task; the hub only ever enqueues,
//! non-blocking, so one slow consumer can never stall the fan-out or its
//! peers. A full buffer drops the frame.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{GalenaError, Result};
use crate::query::filter::{self, Filter};

/// Capacity of the per-subscriber frame buffer
pub const MESSAGE_BUFFER_CAPACITY: usize = 100;

/// Idle period after which a keep-alive comment is written
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// The streaming output sink of one subscriber.
///
/// The server layer bridges this channel to the HTTP response body; a failed
/// send means the client is gone.
pub type SseSink = mpsc::Sender<Bytes>;

/// A connected SSE subscriber.
#[derive(Debug)]
pub struct Subscriber {
    id: String,
    filters: Vec<Filter>,
    frame_tx: mpsc::Sender<Bytes>,
    last_activity_ms: AtomicI64,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl Subscriber {
    /// Create a subscriber over `sink` and start its delivery task.
    ///
    /// Empty filter expressions are ignored; with none left, a root filter
    /// that matches every change is installed. Fails with
    /// `StreamingUnsupported` when the sink is already closed.
    pub fn connect(sink: SseSink, filter_exprs: &[String]) -> Result<Arc<Self>> {
        if sink.is_closed() {
            return Err(GalenaError::StreamingUnsupported);
        }

        let mut filters: Vec<Filter> = filter_exprs
            .iter()
            .filter(|expr| !expr.is_empty())
            .map(|expr| Filter::new(expr))
            .collect();
        if filters.is_empty() {
            filters.push(Filter::new("."));
        }

        let (frame_tx, frame_rx) = mpsc::channel(MESSAGE_BUFFER_CAPACITY);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let subscriber = Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            filters,
            frame_tx,
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            cancel_tx,
            cancel_rx,
        });

        tokio::spawn(deliver(Arc::clone(&subscriber), frame_rx, sink));

        Ok(subscriber)
    }

    /// Opaque unique subscriber id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The subscriber's filter set (never empty)
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Millisecond-epoch timestamp of the last successful sink write
    pub fn last_activity_ms(&self) -> i64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Serialize and enqueue one event frame.
    ///
    /// String payloads are sent verbatim; everything else is JSON-encoded.
    /// A full buffer drops the frame and reports `QueueFull`.
    pub fn send(&self, event: &str, payload: &Value) -> Result<()> {
        if self.is_cancelled() {
            return Err(GalenaError::StreamClosed);
        }

        let body = match payload {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        self.enqueue(Bytes::from(format!("event: {event}\ndata: {body}\n\n")))
    }

    /// Enqueue a comment frame (`: <text>`).
    pub fn send_comment(&self, comment: &str) -> Result<()> {
        if self.is_cancelled() {
            return Err(GalenaError::StreamClosed);
        }
        self.enqueue(Bytes::from(format!(": {comment}\n\n")))
    }

    fn enqueue(&self, frame: Bytes) -> Result<()> {
        self.frame_tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => GalenaError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => GalenaError::StreamClosed,
        })
    }

    /// Should this subscriber be told about a change at `path`?
    ///
    /// Fast paths first: a filter more specific than a root-level change is
    /// probed against the change value (including the conventional `data`
    /// sub-mapping), so predicates are honored before the generic path
    /// equivalence test runs.
    pub fn should_notify(&self, path: &str, value: &Value) -> bool {
        for f in &self.filters {
            if f.path().starts_with(path) {
                if let Some(target) = f.target_field() {
                    if path == "." || path == ".data" || path == "data" {
                        if let Some(map) = value.as_object() {
                            if let Some(field_value) = map.get(target) {
                                return f.conditions().is_empty()
                                    || filter::matches_conditions(field_value, f.conditions());
                            }
                            if let Some(field_value) =
                                map.get("data").and_then(|d| d.get(target))
                            {
                                return f.conditions().is_empty()
                                    || filter::matches_conditions(field_value, f.conditions());
                            }
                        }
                    }
                }
                if f.conditions().is_empty() {
                    return true;
                }
            }
        }

        self.filters.iter().any(|f| f.is_match(path, value))
    }

    /// Trip the cancellation token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Has the cancellation token been tripped?
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolve once the subscriber is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// The delivery loop: forwards buffered frames to the sink, writes keep-alive
/// comments when idle, and exits on cancellation. A failed sink write trips
/// the cancellation token so the hub's disconnect observer cleans up.
async fn deliver(subscriber: Arc<Subscriber>, mut frame_rx: mpsc::Receiver<Bytes>, sink: SseSink) {
    let mut cancel_rx = subscriber.cancel_rx.clone();
    let start = tokio::time::Instant::now() + KEEPALIVE_PERIOD;
    let mut keepalive = tokio::time::interval_at(start, KEEPALIVE_PERIOD);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_rx.changed() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    if sink.send(frame).await.is_err() {
                        debug!(id = %subscriber.id, "sink write failed, cancelling subscriber");
                        subscriber.cancel();
                        break;
                    }
                    subscriber.touch();
                }
                None => break,
            },
            _ = keepalive.tick() => {
                if sink.send(Bytes::from_static(b": keepalive\n\n")).await.is_err() {
                    debug!(id = %subscriber.id, "keep-alive write failed, cancelling subscriber");
                    subscriber.cancel();
                    break;
                }
                subscriber.touch();
            }
        }
    }

    trace!(id = %subscriber.id, "delivery task exited");
}
