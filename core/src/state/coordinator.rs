//! Versioned shared-state coordinator.
//!
//! Each instance owns a JSON tree addressed by dot paths, a monotonically
//! increasing version, and a capped operation log. Mutations append to the
//! log and replicate to peers over the bus as `state:change` events;
//! late-joining instances catch up via `state:sync:request` /
//! `state:sync:response`. Incoming remote operations are forwarded from the
//! synchronous bus callbacks into a channel and applied by a background task,
//! so bus dispatch never blocks on state persistence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::{EmitOptions, EventBus, EventHandler, ListenerId};
use crate::config::StateConfig;
use crate::error::StateError;
use crate::storage::StorageSystem;
use crate::util;

use super::subscription::{StateHandler, StateSubscribeOptions, SubscriptionEntry};
use super::types::{
    ConflictDecision, ConflictResolutionStrategy, ConflictResolver, StateOperation,
    StateOperationType, StateSnapshot, StateUpdateEvent, StateUpdateOptions,
};
use super::value;

pub const STATE_CHANGE_EVENT: &str = "state:change";
pub const STATE_SYNC_REQUEST_EVENT: &str = "state:sync:request";
pub const STATE_SYNC_RESPONSE_EVENT: &str = "state:sync:response";

/// Storage key under which the snapshot is persisted.
pub const STATE_STORAGE_KEY: &str = "unitState";

enum RemoteMessage {
    Change(StateOperation),
    SyncRequest { requester: String },
    SyncResponse { operations: Vec<StateOperation> },
}

#[derive(Default)]
struct CoreState {
    tree: Value,
    version: u64,
    op_log: Vec<StateOperation>,
    /// Ids of the operations currently in the log, for replication dedup.
    /// Evicted together with trimmed log entries, so an operation older than
    /// the log cap can be applied a second time (at-least-once delivery).
    known_ops: HashSet<String>,
}

struct Inner {
    source_id: String,
    config: StateConfig,
    bus: Arc<EventBus>,
    storage: Option<Arc<StorageSystem>>,
    resolver: Mutex<Option<ConflictResolver>>,
    core: Mutex<CoreState>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionEntry>>>,
    listeners: Mutex<Vec<ListenerId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

enum WriteOutcome {
    Proceed { value: Value, merged: bool },
    Abort,
}

/// Handle to a coordinator. Clones share the same state.
#[derive(Clone)]
pub struct StateCoordinator {
    inner: Arc<Inner>,
}

/// Handle for a state subscription. `unsubscribe` is idempotent.
pub struct StateSubscription {
    id: String,
    inner: Weak<Inner>,
}

impl StateSubscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn unsubscribe(&self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(entry) = inner.subscriptions.lock().unwrap().remove(&self.id) {
                entry.cancel();
            }
        }
    }
}

impl StateCoordinator {
    /// Construct a coordinator on `bus`, wire up replication listeners, and
    /// (unless disabled) schedule the initial sync request. Must be called
    /// inside a tokio runtime.
    pub fn new(
        config: StateConfig,
        bus: Arc<EventBus>,
        storage: Option<Arc<StorageSystem>>,
    ) -> Self {
        let source_id = config
            .source_id
            .clone()
            .unwrap_or_else(|| format!("unit-{}", Uuid::new_v4()));

        let inner = Arc::new(Inner {
            source_id,
            config,
            bus,
            storage,
            resolver: Mutex::new(None),
            core: Mutex::new(CoreState {
                tree: Value::Object(Map::new()),
                ..Default::default()
            }),
            subscriptions: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        inner.register_bus_listeners(&tx);
        inner
            .tasks
            .lock()
            .unwrap()
            .push(Inner::spawn_apply_task(Arc::downgrade(&inner), rx));

        if let Some(delay_ms) = inner.config.sync_delay_ms {
            let weak = Arc::downgrade(&inner);
            inner.tasks.lock().unwrap().push(tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                if let Some(inner) = weak.upgrade() {
                    inner.emit_sync_request();
                }
            }));
        }

        Self { inner }
    }

    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    /// Install the resolver consulted under
    /// [`ConflictResolutionStrategy::Custom`].
    pub fn set_conflict_resolver(&self, resolver: ConflictResolver) {
        *self.inner.resolver.lock().unwrap() = Some(resolver);
    }

    /// Write `value` at `path`. Returns `false` when a conflicting recent
    /// remote write won and this write was dropped.
    pub async fn set_state(
        &self,
        path: &str,
        value: Value,
        options: StateUpdateOptions,
    ) -> Result<bool, StateError> {
        if path.is_empty() {
            return Err(StateError::EmptyPath);
        }
        let inner = &self.inner;

        let (op, event) = {
            let mut core = inner.core.lock().unwrap();
            let previous = value::get_path(&core.tree, path).cloned();

            // Non-broadcast writes are local bookkeeping and bypass conflict
            // resolution entirely.
            let conflicting = if options.broadcast {
                inner.detect_conflict(&core, path)
            } else {
                None
            };
            let outcome = match conflicting {
                Some(conflicting) => inner.resolve_conflict(
                    &core,
                    path,
                    previous.as_ref(),
                    value,
                    &conflicting,
                    options.conflict_strategy,
                ),
                None => WriteOutcome::Proceed {
                    value,
                    merged: false,
                },
            };
            let (value, was_merged) = match outcome {
                WriteOutcome::Proceed { value, merged } => (value, merged),
                WriteOutcome::Abort => {
                    debug!(path, "local write dropped by conflict resolution");
                    return Ok(false);
                }
            };

            let new_value = if options.merge {
                let mut base = previous.clone().unwrap_or_else(|| json!({}));
                value::deep_merge(&mut base, &value);
                base
            } else {
                value
            };
            value::set_path(&mut core.tree, path, new_value.clone());

            let mut metadata = options.metadata.clone();
            if let Some(updated_by) = &options.updated_by {
                metadata
                    .get_or_insert_with(Map::new)
                    .insert("updated_by".into(), json!(updated_by));
            }
            if was_merged {
                metadata
                    .get_or_insert_with(Map::new)
                    .insert("merged".into(), json!(true));
            }

            inner.record_operation(
                &mut core,
                StateOperationType::Set,
                path,
                Some(new_value),
                previous,
                metadata,
            )
        };

        inner.finish_local_mutation(op, event, &options).await?;
        Ok(true)
    }

    /// Remove the value at `path`. Removing an absent path is a no-op and
    /// returns `false` without logging an operation.
    pub async fn delete_state(
        &self,
        path: &str,
        options: StateUpdateOptions,
    ) -> Result<bool, StateError> {
        if path.is_empty() {
            return Err(StateError::EmptyPath);
        }
        let inner = &self.inner;

        let Some((op, event)) = ({
            let mut core = inner.core.lock().unwrap();
            value::delete_path(&mut core.tree, path).map(|previous| {
                inner.record_operation(
                    &mut core,
                    StateOperationType::Delete,
                    path,
                    None,
                    Some(previous),
                    options.metadata.clone(),
                )
            })
        }) else {
            return Ok(false);
        };

        inner.finish_local_mutation(op, event, &options).await?;
        Ok(true)
    }

    /// Reset the tree to empty.
    pub async fn clear_state(&self, options: StateUpdateOptions) -> Result<(), StateError> {
        self.replace_tree(Value::Object(Map::new()), None, options)
            .await
    }

    /// Replace the whole tree. Replicates as a single operation so peers end
    /// up with an identical tree.
    pub async fn set_full_state(
        &self,
        state: Value,
        options: StateUpdateOptions,
    ) -> Result<(), StateError> {
        self.replace_tree(state.clone(), Some(state), options).await
    }

    async fn replace_tree(
        &self,
        tree: Value,
        op_value: Option<Value>,
        options: StateUpdateOptions,
    ) -> Result<(), StateError> {
        let inner = &self.inner;
        let (op, event) = {
            let mut core = inner.core.lock().unwrap();
            let previous = std::mem::replace(&mut core.tree, tree);
            inner.record_operation(
                &mut core,
                StateOperationType::Clear,
                "*",
                op_value,
                Some(previous),
                options.metadata.clone(),
            )
        };
        inner.finish_local_mutation(op, event, &options).await
    }

    pub fn get_state(&self, path: &str) -> Option<Value> {
        let core = self.inner.core.lock().unwrap();
        value::get_path(&core.tree, path).cloned()
    }

    pub fn get_state_or(&self, path: &str, default: Value) -> Value {
        self.get_state(path).unwrap_or(default)
    }

    /// Typed read; absence is `None`, a shape mismatch is an error.
    pub fn get_state_as<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StateError> {
        match self.get_state(path) {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| StateError::Decode {
                    path: path.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    pub fn has_state(&self, path: &str) -> bool {
        let core = self.inner.core.lock().unwrap();
        value::get_path(&core.tree, path).is_some()
    }

    pub fn get_full_state(&self) -> Value {
        self.inner.core.lock().unwrap().tree.clone()
    }

    pub fn get_state_version(&self) -> u64 {
        self.inner.core.lock().unwrap().version
    }

    pub fn get_operation_log(&self) -> Vec<StateOperation> {
        self.inner.core.lock().unwrap().op_log.clone()
    }

    /// Register a subscriber for updates under `path` (`"*"` for all). With
    /// `immediate`, the current value is delivered synchronously before this
    /// returns, but only if the path resolves to one.
    pub fn subscribe(
        &self,
        path: &str,
        options: StateSubscribeOptions,
        handler: StateHandler,
    ) -> StateSubscription {
        let id = util::subscription_id();
        let entry = SubscriptionEntry::new(id.clone(), path.to_string(), &options, handler);

        if options.immediate {
            let (value, version) = {
                let core = self.inner.core.lock().unwrap();
                let value = if path == "*" {
                    Some(core.tree.clone())
                } else {
                    value::get_path(&core.tree, path).cloned()
                };
                (value, core.version)
            };
            // A never-written path has no current value to deliver.
            if value.is_some() {
                entry.notify_immediate(&StateUpdateEvent {
                    id: util::event_id(),
                    path: path.to_string(),
                    value,
                    previous_value: None,
                    metadata: None,
                    timestamp: Utc::now(),
                    version,
                    source_id: self.inner.source_id.clone(),
                });
            }
        }

        self.inner
            .subscriptions
            .lock()
            .unwrap()
            .insert(id.clone(), entry);
        StateSubscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Apply a batch of operations received out of band (a sync response or a
    /// caller-driven import). Own and already-known operations are skipped;
    /// the rest apply in `(timestamp, version)` order. Returns the number
    /// applied.
    pub async fn sync_state(&self, operations: Vec<StateOperation>) -> usize {
        let applied = self.inner.apply_operation_batch(operations);
        if applied > 0 {
            if let Err(err) = self.inner.persist().await {
                warn!(%err, "state persistence after sync failed");
            }
        }
        applied
    }

    /// Ask peers on the bus for their operation logs.
    pub fn request_state_sync(&self) -> Result<(), StateError> {
        self.inner.emit_sync_request_checked()
    }

    /// Restore tree, version, and operation log from the persisted snapshot.
    /// Returns `false` when no snapshot exists.
    pub async fn load_from_storage(&self) -> Result<bool, StateError> {
        let Some(storage) = &self.inner.storage else {
            return Ok(false);
        };
        let Some(snapshot) = storage.get::<StateSnapshot>(STATE_STORAGE_KEY).await? else {
            return Ok(false);
        };

        let mut core = self.inner.core.lock().unwrap();
        core.known_ops = snapshot.operation_log.iter().map(|op| op.id.clone()).collect();
        core.tree = snapshot.state;
        core.version = snapshot.version;
        core.op_log = snapshot.operation_log;
        Ok(true)
    }

    /// Detach from the bus and stop background tasks. Pending debounced
    /// subscriber deliveries are dropped.
    pub fn close(&self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn register_bus_listeners(&self, tx: &mpsc::UnboundedSender<RemoteMessage>) {
        let own = self.source_id.clone();
        let sender = tx.clone();
        let on_change: EventHandler = Arc::new(move |event| {
            match serde_json::from_value::<StateOperation>(event.payload.clone()) {
                Ok(op) if op.source_id != own => {
                    let _ = sender.send(RemoteMessage::Change(op));
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "ignoring malformed state change event"),
            }
        });

        let own = self.source_id.clone();
        let sender = tx.clone();
        let on_request: EventHandler = Arc::new(move |event| {
            let requester = event.payload["source_id"].as_str().unwrap_or_default();
            if !requester.is_empty() && requester != own {
                let _ = sender.send(RemoteMessage::SyncRequest {
                    requester: requester.to_string(),
                });
            }
        });

        let own = self.source_id.clone();
        let sender = tx.clone();
        let on_response: EventHandler = Arc::new(move |event| {
            if event.payload["target"].as_str() != Some(own.as_str()) {
                return;
            }
            match serde_json::from_value::<Vec<StateOperation>>(event.payload["operations"].clone())
            {
                Ok(operations) => {
                    let _ = sender.send(RemoteMessage::SyncResponse { operations });
                }
                Err(err) => warn!(%err, "ignoring malformed sync response"),
            }
        });

        let mut listeners = self.listeners.lock().unwrap();
        listeners.push(self.bus.on(STATE_CHANGE_EVENT, on_change));
        listeners.push(self.bus.on(STATE_SYNC_REQUEST_EVENT, on_request));
        listeners.push(self.bus.on(STATE_SYNC_RESPONSE_EVENT, on_response));
    }

    fn spawn_apply_task(
        weak: Weak<Self>,
        mut rx: mpsc::UnboundedReceiver<RemoteMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match message {
                    RemoteMessage::Change(op) => {
                        if let Some(event) = inner.apply_remote_operation(op) {
                            inner.notify_subscribers(&event);
                        }
                    }
                    RemoteMessage::SyncRequest { requester } => {
                        inner.answer_sync_request(&requester);
                    }
                    RemoteMessage::SyncResponse { operations } => {
                        let applied = inner.apply_operation_batch(operations);
                        if applied > 0 {
                            debug!(applied, "synced operations from peer");
                            if let Err(err) = inner.persist().await {
                                warn!(%err, "state persistence after sync failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Append an operation for a local mutation and build its update event.
    /// Caller holds the core lock and has already mutated the tree.
    fn record_operation(
        &self,
        core: &mut CoreState,
        operation_type: StateOperationType,
        path: &str,
        value: Option<Value>,
        previous: Option<Value>,
        metadata: Option<Map<String, Value>>,
    ) -> (StateOperation, StateUpdateEvent) {
        core.version += 1;
        let op = StateOperation {
            id: Uuid::new_v4().to_string(),
            operation_type,
            path: path.to_string(),
            value: value.clone(),
            timestamp: Utc::now(),
            version: core.version,
            source_id: self.source_id.clone(),
            metadata: metadata.clone(),
        };
        core.known_ops.insert(op.id.clone());
        core.op_log.push(op.clone());
        self.trim_log(core);

        let event = StateUpdateEvent {
            id: op.id.clone(),
            path: path.to_string(),
            value,
            previous_value: previous,
            metadata,
            timestamp: op.timestamp,
            version: core.version,
            source_id: self.source_id.clone(),
        };
        (op, event)
    }

    /// Notify, broadcast, persist. Runs after the core lock is released.
    async fn finish_local_mutation(
        &self,
        op: StateOperation,
        event: StateUpdateEvent,
        options: &StateUpdateOptions,
    ) -> Result<(), StateError> {
        if options.notify {
            self.notify_subscribers(&event);
        }
        if options.broadcast {
            let payload = serde_json::to_value(&op).map_err(crate::error::BusError::from)?;
            self.bus.emit(
                STATE_CHANGE_EVENT,
                payload,
                EmitOptions {
                    source_id: Some(self.source_id.clone()),
                    ..Default::default()
                },
            )?;
        }
        self.persist().await
    }

    /// Most recent remote operation on `path` inside the conflict window.
    fn detect_conflict(&self, core: &CoreState, path: &str) -> Option<StateOperation> {
        let window = ChronoDuration::milliseconds(self.config.conflict_window_ms as i64);
        let now = Utc::now();
        core.op_log
            .iter()
            .rev()
            .find(|op| {
                op.path == path
                    && op.source_id != self.source_id
                    && now.signed_duration_since(op.timestamp) <= window
            })
            .cloned()
    }

    fn resolve_conflict(
        &self,
        core: &CoreState,
        path: &str,
        current: Option<&Value>,
        incoming: Value,
        conflicting: &StateOperation,
        override_strategy: Option<ConflictResolutionStrategy>,
    ) -> WriteOutcome {
        let strategy = override_strategy.unwrap_or(self.config.conflict_strategy);
        debug!(path, %strategy, remote = %conflicting.source_id, "resolving write conflict");
        match strategy {
            ConflictResolutionStrategy::LastWriteWins => WriteOutcome::Proceed {
                value: incoming,
                merged: false,
            },
            ConflictResolutionStrategy::HighestVersionWins => {
                // The side that has seen more writes wins; ties go to the
                // remote operation already in the tree.
                if conflicting.version >= core.version {
                    WriteOutcome::Abort
                } else {
                    WriteOutcome::Proceed {
                        value: incoming,
                        merged: false,
                    }
                }
            }
            ConflictResolutionStrategy::Merge => {
                let mut merged = current.cloned().unwrap_or_else(|| json!({}));
                value::deep_merge(&mut merged, &incoming);
                WriteOutcome::Proceed {
                    value: merged,
                    merged: true,
                }
            }
            ConflictResolutionStrategy::Custom => {
                let resolver = self.resolver.lock().unwrap().clone();
                match resolver {
                    Some(resolver) => match resolver(path, current, &incoming) {
                        ConflictDecision::KeepCurrent => WriteOutcome::Abort,
                        ConflictDecision::UseIncoming => WriteOutcome::Proceed {
                            value: incoming,
                            merged: false,
                        },
                        ConflictDecision::UseValue(value) => WriteOutcome::Proceed {
                            value,
                            merged: true,
                        },
                    },
                    None => {
                        warn!(path, "custom conflict strategy without a resolver, last write wins");
                        WriteOutcome::Proceed {
                            value: incoming,
                            merged: false,
                        }
                    }
                }
            }
        }
    }

    /// Apply one replicated operation. Returns the update event for
    /// subscriber delivery, or `None` when the operation was already known.
    fn apply_remote_operation(&self, op: StateOperation) -> Option<StateUpdateEvent> {
        let mut core = self.core.lock().unwrap();
        if !core.known_ops.insert(op.id.clone()) {
            return None;
        }

        // Replication keeps versions converging on the highest seen.
        core.version = core.version.max(op.version);

        let previous;
        let value;
        match op.operation_type {
            StateOperationType::Set => {
                previous = value::get_path(&core.tree, &op.path).cloned();
                let new_value = op.value.clone().unwrap_or(Value::Null);
                value::set_path(&mut core.tree, &op.path, new_value.clone());
                value = Some(new_value);
            }
            StateOperationType::Delete => {
                previous = value::delete_path(&mut core.tree, &op.path);
                value = None;
            }
            StateOperationType::Clear => {
                let tree = op.value.clone().unwrap_or_else(|| json!({}));
                previous = Some(std::mem::replace(&mut core.tree, tree.clone()));
                value = Some(tree);
            }
        }

        core.op_log.push(op.clone());
        self.trim_log(&mut core);

        Some(StateUpdateEvent {
            id: op.id,
            path: op.path,
            value,
            previous_value: previous,
            metadata: op.metadata,
            timestamp: op.timestamp,
            version: core.version,
            source_id: op.source_id,
        })
    }

    /// Filter, order, and apply a batch of operations, notifying subscribers
    /// for each one that lands.
    fn apply_operation_batch(&self, operations: Vec<StateOperation>) -> usize {
        let mut fresh: Vec<StateOperation> = {
            let core = self.core.lock().unwrap();
            operations
                .into_iter()
                .filter(|op| op.source_id != self.source_id && !core.known_ops.contains(&op.id))
                .collect()
        };
        fresh.sort_by(|a, b| (a.timestamp, a.version).cmp(&(b.timestamp, b.version)));

        let mut applied = 0;
        for op in fresh {
            if let Some(event) = self.apply_remote_operation(op) {
                self.notify_subscribers(&event);
                applied += 1;
            }
        }
        applied
    }

    fn answer_sync_request(&self, requester: &str) {
        let operations = self.core.lock().unwrap().op_log.clone();
        if operations.is_empty() {
            return;
        }
        let payload = json!({
            "target": requester,
            "operations": operations,
        });
        let result = self.bus.emit(
            STATE_SYNC_RESPONSE_EVENT,
            payload,
            EmitOptions {
                source_id: Some(self.source_id.clone()),
                ..Default::default()
            },
        );
        if let Err(err) = result {
            warn!(%err, requester, "sync response emission failed");
        }
    }

    fn emit_sync_request(&self) {
        if let Err(err) = self.emit_sync_request_checked() {
            warn!(%err, "sync request emission failed");
        }
    }

    fn emit_sync_request_checked(&self) -> Result<(), StateError> {
        self.bus.emit(
            STATE_SYNC_REQUEST_EVENT,
            json!({ "source_id": self.source_id }),
            EmitOptions {
                source_id: Some(self.source_id.clone()),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn notify_subscribers(&self, event: &StateUpdateEvent) {
        let entries: Vec<Arc<SubscriptionEntry>> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.values()
                .filter(|entry| entry.matches(event))
                .cloned()
                .collect()
        };
        for entry in entries {
            entry.notify(event);
        }
    }

    /// Keep only the newest `max_operation_log` entries, ordered oldest
    /// first. Trimmed operations also leave the dedup set, bounding both to
    /// the log cap.
    fn trim_log(&self, core: &mut CoreState) {
        let max = self.config.max_operation_log;
        if core.op_log.len() <= max {
            return;
        }
        core.op_log
            .sort_by(|a, b| (a.timestamp, a.version).cmp(&(b.timestamp, b.version)));
        let excess = core.op_log.len() - max;
        for op in core.op_log.drain(..excess) {
            core.known_ops.remove(&op.id);
        }
    }

    async fn persist(&self) -> Result<(), StateError> {
        if !self.config.persistence_enabled {
            return Ok(());
        }
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let snapshot = {
            let core = self.core.lock().unwrap();
            StateSnapshot {
                state: core.tree.clone(),
                version: core.version,
                operation_log: core.op_log.clone(),
                timestamp: Utc::now(),
            }
        };
        storage.set(STATE_STORAGE_KEY, &snapshot, None).await?;
        Ok(())
    }

    fn shutdown(&self) {
        for id in self.listeners.lock().unwrap().drain(..) {
            self.bus.off(id);
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for entry in self.subscriptions.lock().unwrap().values() {
            entry.cancel();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
