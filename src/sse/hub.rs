//! Broadcast hub
//!
//! The fan-out engine: owns the subscriber table, selects matching
//! subscribers for each change, narrows the payload per subscriber, and
//! enqueues frames without ever blocking on a sink. A periodic reaper
//! removes subscribers that have gone quiet; backend change feeds are
//! bridged into the same broadcast entry point.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::error::{GalenaError, Result};
use crate::query::filter::{self, Condition, Filter};
use crate::query::matcher;
use crate::sse::subscriber::{SseSink, Subscriber};
use crate::store::Store;

/// Default maximum number of concurrent subscribers
const MAX_SUBSCRIBERS: usize = 10_000;

/// How often the inactivity reaper runs
const REAP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Subscribers idle longer than this are reaped
const INACTIVITY_THRESHOLD: Duration = Duration::from_secs(2 * 60);

/// Pause after the `connected` frame so it flushes before initial data
const CONNECTED_FLUSH_DELAY: Duration = Duration::from_millis(50);

/// The subscriber table and fan-out engine.
pub struct Hub {
    store: Arc<dyn Store>,
    subscribers: RwLock<HashMap<String, Arc<Subscriber>>>,
    max_subscribers: usize,
    shutting_down: AtomicBool,
    reaper_tx: watch::Sender<bool>,
}

impl Hub {
    /// Create a hub over `store` with the default subscriber limit.
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Self::with_capacity(store, MAX_SUBSCRIBERS)
    }

    /// Create a hub with an explicit subscriber limit.
    ///
    /// Starts the inactivity reaper and, when the backend supports a change
    /// feed, installs the bridge that turns feed notifications into
    /// broadcasts (`update`, or `delete` for null values).
    pub fn with_capacity(store: Arc<dyn Store>, max_subscribers: usize) -> Arc<Self> {
        let (reaper_tx, reaper_rx) = watch::channel(false);

        let hub = Arc::new(Self {
            store,
            subscribers: RwLock::new(HashMap::new()),
            max_subscribers,
            shutting_down: AtomicBool::new(false),
            reaper_tx,
        });

        if hub.store.supports_change_feed() {
            let weak = Arc::downgrade(&hub);
            hub.store.set_change_listener(Box::new(move |path, value| {
                if let Some(hub) = weak.upgrade() {
                    let kind = if value.is_null() { "delete" } else { "update" };
                    hub.broadcast_event(path, &value, kind);
                }
            }));
        }

        tokio::spawn(run_reaper(Arc::downgrade(&hub), reaper_rx));

        hub
    }

    /// Register a new subscriber over `sink`.
    ///
    /// Fails with `Unavailable` during shutdown and `AtCapacity` when the
    /// table is full (without registering anything). On success the
    /// subscriber's delivery task is running, a disconnect observer is
    /// armed, the `connected` frame is queued, and — when requested — the
    /// per-filter initial snapshot has been sent.
    pub async fn add_subscriber(
        self: &Arc<Self>,
        sink: SseSink,
        filter_exprs: &[String],
        send_initial: bool,
    ) -> Result<Arc<Subscriber>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(GalenaError::Unavailable);
        }

        let subscriber = {
            let mut table = self.subscribers.write();
            if table.len() >= self.max_subscribers {
                return Err(GalenaError::AtCapacity);
            }
            let subscriber = Subscriber::connect(sink, filter_exprs)?;
            table.insert(subscriber.id().to_string(), Arc::clone(&subscriber));
            subscriber
        };

        info!(
            id = %subscriber.id(),
            filters = ?subscriber
                .filters()
                .iter()
                .map(Filter::expression)
                .collect::<Vec<_>>(),
            "subscriber connected"
        );

        // Remove the table entry as soon as the subscriber cancels, whether
        // from client disconnect, write failure, or shutdown.
        {
            let weak = Arc::downgrade(self);
            let observed = Arc::clone(&subscriber);
            tokio::spawn(async move {
                observed.cancelled().await;
                if let Some(hub) = weak.upgrade() {
                    hub.remove_subscriber(observed.id());
                }
            });
        }

        if let Err(e) = subscriber.send("connected", &json!({"id": subscriber.id()})) {
            debug!(id = %subscriber.id(), error = %e, "failed to queue connected frame");
        }

        // Let the connected frame flush before any initial data follows it.
        tokio::time::sleep(CONNECTED_FLUSH_DELAY).await;

        if send_initial {
            self.send_initial_snapshot(&subscriber).await;
        }

        Ok(subscriber)
    }

    /// Remove a subscriber from the table and cancel it. Idempotent.
    pub fn remove_subscriber(&self, id: &str) {
        let removed = self.subscribers.write().remove(id);
        if let Some(subscriber) = removed {
            subscriber.cancel();
            debug!(id, "subscriber removed");
        }
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Fan a change event out to every matching subscriber.
    ///
    /// The subscriber table is snapshotted under the read lock; the lock is
    /// never held across a send. Delivery is per-subscriber narrowed and
    /// non-blocking.
    pub fn broadcast_event(&self, path: &str, value: &Value, kind: &str) {
        let targets: Vec<Arc<Subscriber>> = {
            let table = self.subscribers.read();
            table
                .values()
                .filter(|s| s.should_notify(path, value))
                .cloned()
                .collect()
        };

        if targets.is_empty() {
            trace!(path, kind, "no subscribers matched change event");
            return;
        }
        debug!(path, kind, subscribers = targets.len(), "broadcasting change event");

        let envelope = event_envelope(path, value.clone());

        for subscriber in targets {
            let payload = narrow_for_subscriber(&subscriber, path, value, &envelope);
            match subscriber.send(kind, &payload) {
                Ok(()) => {}
                Err(GalenaError::QueueFull) => {
                    warn!(id = %subscriber.id(), path, "subscriber queue full, dropping frame");
                }
                Err(e) => {
                    debug!(id = %subscriber.id(), error = %e, "failed to queue frame");
                }
            }
        }
    }

    /// Remove every subscriber idle longer than `threshold`.
    pub fn reap_inactive(&self, threshold: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - threshold.as_millis() as i64;

        let stale: Vec<String> = {
            let table = self.subscribers.read();
            table
                .iter()
                .filter(|(_, s)| s.last_activity_ms() < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &stale {
            self.remove_subscriber(id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "reaped inactive subscribers");
        }
        stale.len()
    }

    /// Shut the hub down: stop the reaper, cancel and drop every
    /// subscriber, and release the backend.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.reaper_tx.send(true);

        let drained: Vec<Arc<Subscriber>> = {
            let mut table = self.subscribers.write();
            table.drain().map(|(_, s)| s).collect()
        };
        for subscriber in drained {
            subscriber.cancel();
        }

        self.store.disconnect().await;
        info!("broadcast hub shut down");
    }

    /// Materialize and send the per-filter initial frames.
    ///
    /// Root filters send the whole tree, or — with predicates — one frame
    /// per sequence-valued field under the conventional `data` sub-mapping
    /// that the predicates narrow non-empty. Other filters try a direct
    /// lookup first and fall back to pattern matching. Paths are
    /// deduplicated across filters; empty post-predicate payloads are
    /// skipped.
    async fn send_initial_snapshot(&self, subscriber: &Subscriber) {
        let root = match self.store.get(".").await {
            Ok(value) => value,
            Err(e) => {
                warn!(id = %subscriber.id(), error = %e, "failed to fetch initial data");
                return;
            }
        };

        let mut sent: HashSet<String> = HashSet::new();

        for f in subscriber.filters() {
            let has_conditions = !f.conditions().is_empty();

            if f.path().is_empty() || f.path() == "." {
                if has_conditions {
                    self.send_initial_root_fields(subscriber, f, &root, &mut sent);
                } else if sent.insert(".".to_string()) {
                    let envelope = event_envelope(".", root.clone());
                    self.queue_initial(subscriber, envelope);
                }
                continue;
            }

            match self.store.get(f.path()).await {
                Ok(value) => {
                    if sent.contains(f.path()) {
                        continue;
                    }
                    let Some(value) = narrow_initial_value(value, f.conditions()) else {
                        continue;
                    };
                    let mut envelope = event_envelope(f.path(), value);
                    mark_filtered(&mut envelope, f, has_conditions);
                    self.queue_initial(subscriber, envelope);
                    sent.insert(f.path().to_string());
                }
                Err(_) => {
                    let Ok(matches) = self.store.find_matches(f.path()).await else {
                        continue;
                    };
                    for m in matches {
                        if sent.contains(&m.path) {
                            continue;
                        }
                        let Some(value) = narrow_initial_value(m.value, f.conditions()) else {
                            continue;
                        };
                        let mut envelope = event_envelope(&m.path, value);
                        mark_filtered(&mut envelope, f, has_conditions);
                        self.queue_initial(subscriber, envelope);
                        sent.insert(m.path);
                    }
                }
            }
        }
    }

    /// The root-filter-with-predicates case: walk the `data` sub-mapping for
    /// sequence-valued fields and send each one the predicates leave
    /// non-empty.
    fn send_initial_root_fields(
        &self,
        subscriber: &Subscriber,
        f: &Filter,
        root: &Value,
        sent: &mut HashSet<String>,
    ) {
        let Some(data) = root.get("data").and_then(Value::as_object) else {
            return;
        };

        for (field, field_value) in data {
            if !field_value.is_array() {
                continue;
            }
            let Some(filtered) = filter::narrow_by_conditions(field_value, f.conditions()) else {
                continue;
            };

            let path = format!(".data.{field}");
            if !sent.insert(path.clone()) {
                continue;
            }

            let mut envelope = event_envelope(&path, filtered);
            envelope.insert("filtered".to_string(), Value::Bool(true));
            envelope.insert(
                "filtered_field".to_string(),
                Value::String(field.clone()),
            );
            envelope.insert("key_value_filtered".to_string(), Value::Bool(true));
            self.queue_initial(subscriber, envelope);
        }
    }

    fn queue_initial(&self, subscriber: &Subscriber, envelope: Map<String, Value>) {
        if let Err(e) = subscriber.send("initial_data", &Value::Object(envelope)) {
            debug!(id = %subscriber.id(), error = %e, "failed to queue initial frame");
        }
    }
}

/// The base change-event payload: `path`, `value`, and a millisecond epoch.
fn event_envelope(path: &str, value: Value) -> Map<String, Value> {
    let mut envelope = Map::new();
    envelope.insert("path".to_string(), Value::String(path.to_string()));
    envelope.insert("value".to_string(), value);
    envelope.insert(
        "time".to_string(),
        json!(Utc::now().timestamp_millis()),
    );
    envelope
}

fn mark_filtered(envelope: &mut Map<String, Value>, f: &Filter, has_conditions: bool) {
    envelope.insert("filtered".to_string(), Value::Bool(true));
    if let Some(field) = f.target_field() {
        envelope.insert(
            "filtered_field".to_string(),
            Value::String(field.to_string()),
        );
    }
    if has_conditions {
        envelope.insert("key_value_filtered".to_string(), Value::Bool(true));
    }
}

/// Narrow an initial-snapshot value by predicates; `None` means skip the
/// frame (nothing survives the predicates).
fn narrow_initial_value(value: Value, conditions: &[Condition]) -> Option<Value> {
    if conditions.is_empty() {
        return Some(value);
    }
    filter::narrow_by_conditions(&value, conditions)
}

/// Conditional narrowing for broadcast payloads: `Some` when the value shape
/// can take the predicates (sequences keep matching elements, mappings pass
/// whole or not at all), `None` when it cannot.
fn narrow_conditions(value: &Value, conditions: &[Condition]) -> Option<Value> {
    if conditions.is_empty() {
        return None;
    }
    match value {
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter(|&item| filter::matches_conditions(item, conditions))
                .cloned()
                .collect(),
        )),
        Value::Object(_) => {
            filter::matches_conditions(value, conditions).then(|| value.clone())
        }
        _ => None,
    }
}

/// Build the per-subscriber payload for one change event.
///
/// The first filter that matches one of the narrowing cases wins:
/// 1. exact path — predicates narrow the value in place;
/// 2. filter below the change — the sub-value at the relative suffix
///    replaces the payload;
/// 3. change below the filter — delivered as-is, predicates applied when
///    the shape allows;
/// 4. both under the conventional root-level `data` mapping — the matching
///    child is extracted from the change value.
fn narrow_for_subscriber(
    subscriber: &Subscriber,
    path: &str,
    value: &Value,
    base: &Map<String, Value>,
) -> Value {
    let mut envelope = base.clone();

    for f in subscriber.filters() {
        let has_conditions = !f.conditions().is_empty();

        // Case 1: the change is exactly the filter path.
        if path == f.path() {
            envelope.insert("filtered".to_string(), Value::Bool(true));
            if has_conditions {
                if let Some(narrowed) = narrow_conditions(value, f.conditions()) {
                    envelope.insert("value".to_string(), narrowed);
                    envelope.insert("key_value_filtered".to_string(), Value::Bool(true));
                }
            }
            break;
        }

        // Case 2: the filter wants something below the changed path;
        // extract the sub-value at the relative suffix.
        if filter::is_descendant(f.path(), path) && f.path() != path {
            let suffix = filter::relative_suffix(f.path(), path);
            if let Ok(extracted) = matcher::get_relative(value, suffix) {
                let mut narrowed_value = extracted;
                envelope.insert("filtered".to_string(), Value::Bool(true));
                if has_conditions {
                    if let Some(narrowed) = narrow_conditions(&narrowed_value, f.conditions()) {
                        narrowed_value = narrowed;
                        envelope.insert("key_value_filtered".to_string(), Value::Bool(true));
                    }
                }
                envelope.insert("value".to_string(), narrowed_value);
                break;
            }
        }

        // Case 3: the change is below the filter path; the payload is
        // already the finest view there is.
        if filter::is_descendant(path, f.path()) && f.path() != path {
            envelope.insert("filtered".to_string(), Value::Bool(true));
            if has_conditions {
                if let Some(narrowed) = narrow_conditions(value, f.conditions()) {
                    envelope.insert("value".to_string(), narrowed);
                    envelope.insert("key_value_filtered".to_string(), Value::Bool(true));
                }
            }
            break;
        }

        // Case 4: no strict prefix relationship, but both live under the
        // conventional `.data` mapping and the change value carries the
        // child the filter wants.
        if f.path().starts_with(".data.") && path.starts_with(".data") {
            let target = &f.path()[".data.".len()..];
            if let Some(target_value) = value
                .as_object()
                .and_then(|m| m.get("data"))
                .and_then(|d| d.get(target))
            {
                let mut narrowed_value = target_value.clone();
                if has_conditions {
                    if let Some(narrowed) = narrow_conditions(&narrowed_value, f.conditions()) {
                        narrowed_value = narrowed;
                        envelope.insert("key_value_filtered".to_string(), Value::Bool(true));
                    }
                }
                envelope.insert("value".to_string(), narrowed_value);
                envelope.insert("filtered".to_string(), Value::Bool(true));
                break;
            }
        }
    }

    Value::Object(envelope)
}

/// The periodic inactivity reaper. Holds only a weak hub handle so shutdown
/// (or a dropped hub in tests) ends the task.
async fn run_reaper(hub: Weak<Hub>, mut shutdown_rx: watch::Receiver<bool>) {
    let start = tokio::time::Instant::now() + REAP_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, REAP_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = ticker.tick() => {
                let Some(hub) = hub.upgrade() else { return };
                hub.reap_inactive(INACTIVITY_THRESHOLD);
            }
        }
    }
}
