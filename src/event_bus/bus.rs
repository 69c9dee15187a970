use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::event::{BusEvent, EventChannel};
use super::sink::EventSink;

/// Subscriber callback. Must be non-blocking: delivery is synchronous.
pub type Listener = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Errors that can occur when emitting typed payloads.
#[derive(Debug, Error, Diagnostic)]
pub enum EventBusError {
    /// The payload could not be serialized onto the channel.
    #[error("failed to encode payload for channel '{channel}': {source}")]
    #[diagnostic(code(taskloom::event_bus::encode))]
    Encode {
        channel: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Default)]
struct ListenerTable {
    by_channel: FxHashMap<String, Vec<Listener>>,
    all: Vec<Listener>,
}

/// Named-channel pub/sub with per-channel retained state.
///
/// Each `emit` retains the payload as the channel's state (for replay and
/// snapshotting) and notifies subscribers synchronously in subscription
/// order. Every emission is additionally forwarded to the attached
/// [`EventSink`]s, so a bus can be observed (stdout, memory capture, flume
/// channel) without subscribing.
///
/// One bus belongs to one workflow instance; cross-workflow sharing is not
/// supported.
///
/// # Examples
///
/// ```
/// use taskloom::event_bus::{channels, EventBus, StatusPayload, WorkflowStatus};
///
/// let bus = EventBus::new();
/// bus.on(channels::STATUS.name(), |event| {
///     println!("status update: {}", event.payload);
/// });
/// bus.emit(&channels::STATUS, &StatusPayload::new(WorkflowStatus::Pending)).unwrap();
/// assert!(bus.state(channels::STATUS.name()).is_some());
/// ```
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<RwLock<ListenerTable>>,
    state: Arc<RwLock<FxHashMap<String, Value>>>,
    sinks: Arc<Mutex<Vec<Box<dyn EventSink>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no sinks attached.
    #[must_use]
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(ListenerTable::default())),
            state: Arc::new(RwLock::new(FxHashMap::default())),
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a bus with a single sink.
    pub fn with_sink<S: EventSink + 'static>(sink: S) -> Self {
        let bus = Self::new();
        bus.add_sink(sink);
        bus
    }

    /// Attach a sink (useful for per-request streaming).
    pub fn add_sink<S: EventSink + 'static>(&self, sink: S) {
        self.sinks.lock().push(Box::new(sink));
    }

    /// Emit a typed payload on a channel.
    pub fn emit<T: Serialize>(
        &self,
        channel: &EventChannel<T>,
        payload: &T,
    ) -> Result<(), EventBusError> {
        let value = serde_json::to_value(payload).map_err(|source| EventBusError::Encode {
            channel: channel.name().to_string(),
            source,
        })?;
        self.emit_value(channel.name(), value);
        Ok(())
    }

    /// Emit a raw payload on a channel by name.
    pub fn emit_value(&self, channel: &str, payload: Value) {
        self.state
            .write()
            .insert(channel.to_string(), payload.clone());
        self.dispatch(BusEvent::new(channel, payload));
    }

    /// Functional update of the retained channel state, then notify.
    pub fn update(&self, channel: &str, f: impl FnOnce(Option<Value>) -> Value) {
        let next = {
            let mut guard = self.state.write();
            let next = f(guard.get(channel).cloned());
            guard.insert(channel.to_string(), next.clone());
            next
        };
        self.dispatch(BusEvent::new(channel, next));
    }

    /// Subscribe to a single channel.
    pub fn on(&self, channel: &str, cb: impl Fn(&BusEvent) + Send + Sync + 'static) {
        self.listeners
            .write()
            .by_channel
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(cb));
    }

    /// Subscribe to every channel.
    pub fn on_all(&self, cb: impl Fn(&BusEvent) + Send + Sync + 'static) {
        self.listeners.write().all.push(Arc::new(cb));
    }

    /// Retained state for one channel.
    #[must_use]
    pub fn state(&self, channel: &str) -> Option<Value> {
        self.state.read().get(channel).cloned()
    }

    /// Retained state for one channel, decoded as its payload type.
    pub fn typed_state<T: DeserializeOwned>(&self, channel: &EventChannel<T>) -> Option<T> {
        let value = self.state(channel.name())?;
        serde_json::from_value(value).ok()
    }

    /// Snapshot of every channel's retained state.
    #[must_use]
    pub fn all_state(&self) -> FxHashMap<String, Value> {
        self.state.read().clone()
    }

    /// Restore retained state from a snapshot. Listeners are not notified;
    /// this is a replay primitive, not an emission.
    pub fn set_all_state(&self, snapshot: FxHashMap<String, Value>) {
        *self.state.write() = snapshot;
    }

    fn dispatch(&self, event: BusEvent) {
        // Collect under the read lock, invoke outside it, so listeners can
        // safely emit follow-up events.
        let targets: Vec<Listener> = {
            let guard = self.listeners.read();
            guard
                .by_channel
                .get(&event.channel)
                .into_iter()
                .flatten()
                .chain(guard.all.iter())
                .cloned()
                .collect()
        };
        for listener in targets {
            listener(&event);
        }

        let mut sinks = self.sinks.lock();
        for sink in sinks.iter_mut() {
            if let Err(err) = sink.handle(&event) {
                tracing::warn!(channel = %event.channel, error = %err, "event sink error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_bus::event::channels;
    use crate::event_bus::{StatusPayload, WorkflowStatus};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_retains_state_and_notifies_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        bus.on("answer", move |_| o1.lock().push("first"));
        let o2 = order.clone();
        bus.on("answer", move |_| o2.lock().push("second"));

        bus.emit_value("answer", json!({"text": "hi"}));
        assert_eq!(order.lock().as_slice(), &["first", "second"]);
        assert_eq!(bus.state("answer"), Some(json!({"text": "hi"})));
    }

    #[test]
    fn on_all_sees_every_channel() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on_all(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit_value("a", json!(1));
        bus.emit_value("b", json!(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn update_applies_function_to_retained_state() {
        let bus = EventBus::new();
        bus.emit_value("counter", json!(1));
        bus.update("counter", |prev| {
            json!(prev.and_then(|v| v.as_i64()).unwrap_or(0) + 1)
        });
        assert_eq!(bus.state("counter"), Some(json!(2)));
    }

    #[test]
    fn set_all_state_roundtrip_is_identity() {
        let bus = EventBus::new();
        bus.emit_value("a", json!({"x": 1}));
        bus.emit_value("b", json!([1, 2, 3]));
        let snapshot = bus.all_state();
        bus.set_all_state(snapshot.clone());
        assert_eq!(bus.all_state(), snapshot);
    }

    #[test]
    fn typed_emit_and_state() {
        let bus = EventBus::new();
        bus.emit(&channels::STATUS, &StatusPayload::new(WorkflowStatus::Completed))
            .unwrap();
        let state = bus.typed_state(&channels::STATUS).unwrap();
        assert_eq!(state.status, WorkflowStatus::Completed);
    }

    #[test]
    fn listener_can_emit_without_deadlock() {
        let bus = EventBus::new();
        let inner = bus.clone();
        bus.on("outer", move |_| inner.emit_value("inner", json!(true)));
        bus.emit_value("outer", json!(1));
        assert_eq!(bus.state("inner"), Some(json!(true)));
    }
}
