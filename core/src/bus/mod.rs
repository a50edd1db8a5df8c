//! Process-local event bus: durable, filterable pub/sub with correlation
//! tracking and replay.
//!
//! Emission is synchronous: every matching listener runs before `emit`
//! returns, so a caller's subsequent reads observe its own event and any
//! handler side effects. Listener dispatch iterates over a snapshot of the
//! registry, so handlers may subscribe or unsubscribe re-entrantly without
//! invalidating the iteration.

mod filter;
mod persist;

pub use filter::{EventFilter, TypeFilter};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::BusConfig;
use crate::error::BusError;
use crate::util;

/// An emitted event. Immutable once returned from [`EventBus::emit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Optional fields attached at emission time.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub correlation_id: Option<String>,
    pub source_id: Option<String>,
    pub metadata: Option<Map<String, Value>>,
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub filter: EventFilter,
    /// Skip the synchronous replay of already-stored matching events.
    pub only_future: bool,
    /// Caller-supplied subscription id; generated when unset.
    pub subscription_id: Option<String>,
}

pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::on`]; pass back to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

/// Handle for a filtered subscription. `unsubscribe` is idempotent.
pub struct SubscriptionHandle {
    id: String,
    listener: ListenerId,
    bus: Weak<EventBus>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.off(self.listener);
            bus.inner.lock().unwrap().subscriptions.remove(&self.id);
        }
    }
}

struct Listener {
    id: ListenerId,
    /// `None` listens to every type (wildcard).
    topic: Option<String>,
    handler: EventHandler,
}

struct SubscriptionRecord {
    #[allow(dead_code)]
    filter: EventFilter,
    listener: ListenerId,
}

#[derive(Default)]
struct BusInner {
    /// Per-type event history, each list in timestamp order.
    store: HashMap<String, Vec<Event>>,
    /// correlation id -> set of event ids.
    correlation: HashMap<String, HashSet<String>>,
    listeners: Vec<Listener>,
    subscriptions: HashMap<String, SubscriptionRecord>,
}

pub struct EventBus {
    max_events_per_type: Option<usize>,
    storage_dir: Option<PathBuf>,
    inner: Mutex<BusInner>,
}

impl EventBus {
    /// Construct a bus. With persistence enabled, previously stored events are
    /// loaded eagerly; unreadable files are skipped with a warning.
    pub fn new(config: BusConfig) -> Result<Arc<Self>, BusError> {
        let storage_dir = if config.persistence_enabled {
            config.storage_dir.as_ref().map(PathBuf::from)
        } else {
            None
        };

        let mut inner = BusInner::default();
        if let Some(dir) = &storage_dir {
            std::fs::create_dir_all(dir)?;
            inner.store = persist::load_events(dir);
            for events in inner.store.values() {
                for event in events {
                    if let Some(cid) = &event.correlation_id {
                        inner
                            .correlation
                            .entry(cid.clone())
                            .or_default()
                            .insert(event.id.clone());
                    }
                }
            }
        }

        Ok(Arc::new(Self {
            max_events_per_type: config.max_events_per_type,
            storage_dir,
            inner: Mutex::new(inner),
        }))
    }

    /// Construct an in-memory bus with no persistence and no per-type cap.
    pub fn in_memory() -> Arc<Self> {
        // BusConfig::default() disables persistence, so new() cannot fail.
        Self::new(BusConfig::default()).expect("in-memory bus construction")
    }

    /// Emit an event: store it, persist it (when enabled), dispatch it
    /// synchronously to all type-matching and wildcard listeners, then index
    /// its correlation id. A persistence write failure propagates.
    pub fn emit(
        &self,
        event_type: &str,
        payload: Value,
        options: EmitOptions,
    ) -> Result<Event, BusError> {
        let event = Event {
            id: util::event_id(),
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
            correlation_id: options.correlation_id,
            source_id: options.source_id,
            metadata: options.metadata,
        };

        let handlers = {
            let mut inner = self.inner.lock().unwrap();

            let list = inner.store.entry(event.event_type.clone()).or_default();
            list.push(event.clone());
            if let Some(cap) = self.max_events_per_type {
                if list.len() > cap {
                    let excess = list.len() - cap;
                    list.drain(..excess);
                }
            }

            if let Some(dir) = &self.storage_dir {
                persist::write_event(dir, &event)?;
            }

            self.matching_handlers(&inner, &event.event_type)
        };

        debug!(event_type, id = %event.id, "emit");
        for handler in &handlers {
            handler(&event);
        }

        if let Some(cid) = &event.correlation_id {
            let mut inner = self.inner.lock().unwrap();
            inner
                .correlation
                .entry(cid.clone())
                .or_default()
                .insert(event.id.clone());
        }

        Ok(event)
    }

    /// Register a handler for one event type. Returns the id to pass to
    /// [`EventBus::off`].
    pub fn on(&self, event_type: &str, handler: EventHandler) -> ListenerId {
        let id = ListenerId(Uuid::new_v4());
        self.inner.lock().unwrap().listeners.push(Listener {
            id,
            topic: Some(event_type.to_string()),
            handler,
        });
        id
    }

    /// Remove a listener registered via [`EventBus::on`] or a subscription's
    /// internal listener. Unknown ids are ignored.
    pub fn off(&self, id: ListenerId) {
        self.inner.lock().unwrap().listeners.retain(|l| l.id != id);
    }

    /// Register a filtered subscription. Unless `only_future` is set, every
    /// already-stored matching event is replayed to the handler in timestamp
    /// order before this returns.
    pub fn subscribe(
        self: &Arc<Self>,
        options: SubscribeOptions,
        handler: EventHandler,
    ) -> SubscriptionHandle {
        let id = options
            .subscription_id
            .unwrap_or_else(util::subscription_id);
        let filter = options.filter;

        if !options.only_future {
            for event in self.find_events(&filter) {
                handler(&event);
            }
        }

        let listener_id = ListenerId(Uuid::new_v4());
        let live_filter = filter.clone();
        let live_handler = handler.clone();
        let wildcard: EventHandler = Arc::new(move |event| {
            if live_filter.matches(event) {
                live_handler(event);
            }
        });

        {
            let mut inner = self.inner.lock().unwrap();
            inner.listeners.push(Listener {
                id: listener_id,
                topic: None,
                handler: wildcard,
            });
            inner.subscriptions.insert(
                id.clone(),
                SubscriptionRecord {
                    filter,
                    listener: listener_id,
                },
            );
        }

        SubscriptionHandle {
            id,
            listener: listener_id,
            bus: Arc::downgrade(self),
        }
    }

    /// All stored events matching `filter`, in timestamp order.
    pub fn find_events(&self, filter: &EventFilter) -> Vec<Event> {
        self.get_all_events()
            .into_iter()
            .filter(|e| filter.matches(e))
            .collect()
    }

    /// Stored events of one type, in emission order.
    pub fn get_event_history(&self, event_type: &str) -> Vec<Event> {
        self.inner
            .lock()
            .unwrap()
            .store
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Timestamp-sorted merge of every type's history.
    pub fn get_all_events(&self) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        let mut events: Vec<Event> = inner.store.values().flatten().cloned().collect();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    /// Events sharing a correlation id, in timestamp order.
    pub fn get_correlated_events(&self, correlation_id: &str) -> Vec<Event> {
        let ids = {
            let inner = self.inner.lock().unwrap();
            match inner.correlation.get(correlation_id) {
                Some(ids) => ids.clone(),
                None => return Vec::new(),
            }
        };
        self.get_all_events()
            .into_iter()
            .filter(|e| ids.contains(&e.id))
            .collect()
    }

    /// Re-deliver stored events in timestamp order. With a handler, events go
    /// only to it; without one they are re-dispatched to every live listener,
    /// so replay is not side-effect-free for other subscribers. Returns the
    /// number of events replayed.
    pub fn replay_events(
        &self,
        filter: Option<&EventFilter>,
        handler: Option<&dyn Fn(&Event)>,
    ) -> usize {
        let mut events = self.get_all_events();
        if let Some(filter) = filter {
            events.retain(|e| filter.matches(e));
        }

        for event in &events {
            match handler {
                Some(h) => h(event),
                None => {
                    let handlers = {
                        let inner = self.inner.lock().unwrap();
                        self.matching_handlers(&inner, &event.event_type)
                    };
                    for h in &handlers {
                        h(event);
                    }
                }
            }
        }

        events.len()
    }

    /// Drop all stored events and correlation indexes; empties the
    /// persistence directory when persistence is enabled.
    pub fn clear_event_history(&self) -> Result<(), BusError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.store.clear();
            inner.correlation.clear();
        }
        if let Some(dir) = &self.storage_dir {
            persist::clear_dir(dir)?;
        }
        Ok(())
    }

    /// Snapshot of handlers to run for `event_type`: typed listeners first,
    /// then wildcards, each in registration order.
    fn matching_handlers(&self, inner: &BusInner, event_type: &str) -> Vec<EventHandler> {
        let mut handlers = Vec::new();
        for listener in &inner.listeners {
            if listener.topic.as_deref() == Some(event_type) {
                handlers.push(listener.handler.clone());
            }
        }
        for listener in &inner.listeners {
            if listener.topic.is_none() {
                handlers.push(listener.handler.clone());
            }
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn collector() -> (EventHandler, Arc<Mutex<Vec<Event>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: EventHandler = Arc::new(move |e: &Event| {
            sink.lock().unwrap().push(e.clone());
        });
        (handler, seen)
    }

    #[test]
    fn emit_stores_and_returns_event() {
        let bus = EventBus::in_memory();
        let event = bus
            .emit("task:created", json!({"n": 1}), EmitOptions::default())
            .unwrap();

        let all = bus.get_all_events();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, event.id);
        assert_eq!(bus.get_event_history("task:created").len(), 1);
        assert!(bus.get_event_history("other").is_empty());
    }

    #[test]
    fn same_type_events_keep_emission_order() {
        let bus = EventBus::in_memory();
        for n in 0..5 {
            bus.emit("tick", json!({ "n": n }), EmitOptions::default())
                .unwrap();
        }
        let history = bus.get_event_history("tick");
        let ns: Vec<i64> = history
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn per_type_cap_trims_oldest() {
        let bus = EventBus::new(BusConfig {
            max_events_per_type: Some(3),
            ..Default::default()
        })
        .unwrap();
        for n in 0..5 {
            bus.emit("tick", json!({ "n": n }), EmitOptions::default())
                .unwrap();
        }
        let history = bus.get_event_history("tick");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].payload["n"], 2);
    }

    #[test]
    fn typed_listener_fires_synchronously() {
        let bus = EventBus::in_memory();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        bus.on(
            "task:created",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.emit("task:created", Value::Null, EmitOptions::default())
            .unwrap();
        bus.emit("task:other", Value::Null, EmitOptions::default())
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_listener() {
        let bus = EventBus::in_memory();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = bus.on(
            "tick",
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );
        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();
        bus.off(id);
        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_replays_stored_events_before_returning() {
        let bus = EventBus::in_memory();
        bus.emit("user:login", json!({"u": "a"}), EmitOptions::default())
            .unwrap();
        bus.emit("user:logout", json!({"u": "a"}), EmitOptions::default())
            .unwrap();

        let (handler, seen) = collector();
        let sub = bus.subscribe(
            SubscribeOptions {
                filter: EventFilter::for_type("user:login"),
                ..Default::default()
            },
            handler,
        );

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].event_type, "user:login");
        sub.unsubscribe();
    }

    #[test]
    fn only_future_skips_replay_but_sees_new_events() {
        let bus = EventBus::in_memory();
        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();

        let (handler, seen) = collector();
        let _sub = bus.subscribe(
            SubscribeOptions {
                filter: EventFilter::for_type("tick"),
                only_future: true,
                ..Default::default()
            },
            handler,
        );
        assert!(seen.lock().unwrap().is_empty());

        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let bus = EventBus::in_memory();
        let (handler, seen) = collector();
        let sub = bus.subscribe(SubscribeOptions::default(), handler);
        sub.unsubscribe();
        sub.unsubscribe();
        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_can_unsubscribe_during_dispatch() {
        let bus = EventBus::in_memory();
        let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
        let slot_in_handler = slot.clone();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();

        let sub = bus.subscribe(
            SubscribeOptions {
                only_future: true,
                ..Default::default()
            },
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = slot_in_handler.lock().unwrap().take() {
                    handle.unsubscribe();
                }
            }),
        );
        *slot.lock().unwrap() = Some(sub);

        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();
        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn correlated_events_in_timestamp_order() {
        let bus = EventBus::in_memory();
        let opts = EmitOptions {
            correlation_id: Some("s1".into()),
            ..Default::default()
        };
        bus.emit("user:login", json!({"u": "a"}), opts.clone()).unwrap();
        bus.emit("user:logout", json!({"u": "a"}), opts).unwrap();
        bus.emit("unrelated", Value::Null, EmitOptions::default())
            .unwrap();

        let correlated = bus.get_correlated_events("s1");
        assert_eq!(correlated.len(), 2);
        assert_eq!(correlated[0].event_type, "user:login");
        assert_eq!(correlated[1].event_type, "user:logout");
        assert!(bus.get_correlated_events("nope").is_empty());
    }

    #[test]
    fn replay_to_explicit_handler_does_not_touch_listeners() {
        let bus = EventBus::in_memory();
        bus.emit("tick", json!({"n": 1}), EmitOptions::default())
            .unwrap();

        let live = Arc::new(AtomicUsize::new(0));
        let l = live.clone();
        bus.on(
            "tick",
            Arc::new(move |_| {
                l.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let replayed = Arc::new(AtomicUsize::new(0));
        let r = replayed.clone();
        let handler = move |_: &Event| {
            r.fetch_add(1, Ordering::SeqCst);
        };
        let n = bus.replay_events(None, Some(&handler));

        assert_eq!(n, 1);
        assert_eq!(replayed.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn replay_without_handler_redispatches_to_listeners() {
        let bus = EventBus::in_memory();
        bus.emit("tick", Value::Null, EmitOptions::default()).unwrap();

        let live = Arc::new(AtomicUsize::new(0));
        let l = live.clone();
        bus.on(
            "tick",
            Arc::new(move |_| {
                l.fetch_add(1, Ordering::SeqCst);
            }),
        );

        bus.replay_events(None, None);
        assert_eq!(live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn persisted_events_survive_restart() {
        let dir = TempDir::new().unwrap();
        let config = BusConfig {
            persistence_enabled: true,
            storage_dir: Some(dir.path().to_string_lossy().into_owned()),
            max_events_per_type: None,
        };

        {
            let bus = EventBus::new(config.clone()).unwrap();
            let opts = EmitOptions {
                correlation_id: Some("boot".into()),
                ..Default::default()
            };
            bus.emit("sys:start", json!({"pid": 1}), opts).unwrap();
        }

        let bus = EventBus::new(config).unwrap();
        let history = bus.get_event_history("sys:start");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload["pid"], 1);
        assert_eq!(bus.get_correlated_events("boot").len(), 1);
    }

    #[test]
    fn clear_event_history_drops_everything() {
        let bus = EventBus::in_memory();
        bus.emit(
            "tick",
            Value::Null,
            EmitOptions {
                correlation_id: Some("c".into()),
                ..Default::default()
            },
        )
        .unwrap();
        bus.clear_event_history().unwrap();
        assert!(bus.get_all_events().is_empty());
        assert!(bus.get_correlated_events("c").is_empty());
    }

    #[test]
    fn find_events_applies_filter() {
        let bus = EventBus::in_memory();
        bus.emit(
            "job:done",
            Value::Null,
            EmitOptions {
                source_id: Some("w1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        bus.emit(
            "job:done",
            Value::Null,
            EmitOptions {
                source_id: Some("w2".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let found = bus.find_events(&EventFilter {
            event_type: Some("job:done".into()),
            source_id: Some("w1".into()),
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
    }
}
