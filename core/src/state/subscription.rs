//! Local state subscriptions with path filtering and trailing-edge debounce.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::types::StateUpdateEvent;

pub type StateHandler = Arc<dyn Fn(&StateUpdateEvent) + Send + Sync>;

/// Options for [`StateCoordinator::subscribe`](super::StateCoordinator::subscribe).
#[derive(Debug, Clone, Default)]
pub struct StateSubscribeOptions {
    /// Deliver the current value synchronously at registration time.
    pub immediate: bool,
    /// Also match dot-delimited descendants of the subscribed path
    /// (`"agents"` then matches `"agents.a1.status"`).
    pub path_prefix: bool,
    /// Require an exact metadata subset on each update.
    pub metadata: Option<Map<String, Value>>,
    /// Coalesce rapid updates: only the latest update within the window is
    /// delivered, after the window elapses.
    pub debounce: Option<Duration>,
}

/// `"*"` matches every path; otherwise a pattern matches itself and, with
/// `prefix`, any descendant path.
pub(super) fn path_matches(pattern: &str, path: &str, prefix: bool) -> bool {
    pattern == "*"
        || path == pattern
        || (prefix
            && path.len() > pattern.len()
            && path.starts_with(pattern)
            && path.as_bytes()[pattern.len()] == b'.')
}

fn metadata_matches(wanted: &Map<String, Value>, actual: Option<&Map<String, Value>>) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    wanted.iter().all(|(k, v)| actual.get(k) == Some(v))
}

#[derive(Default)]
struct DebounceState {
    latest: Option<StateUpdateEvent>,
    timer: Option<JoinHandle<()>>,
}

pub(super) struct SubscriptionEntry {
    pub(super) id: String,
    pattern: String,
    path_prefix: bool,
    metadata: Option<Map<String, Value>>,
    debounce: Option<Duration>,
    handler: StateHandler,
    pending: Mutex<DebounceState>,
}

impl SubscriptionEntry {
    pub(super) fn new(
        id: String,
        pattern: String,
        options: &StateSubscribeOptions,
        handler: StateHandler,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            pattern,
            path_prefix: options.path_prefix,
            metadata: options.metadata.clone(),
            debounce: options.debounce,
            handler,
            pending: Mutex::new(DebounceState::default()),
        })
    }

    pub(super) fn matches(&self, event: &StateUpdateEvent) -> bool {
        if !path_matches(&self.pattern, &event.path, self.path_prefix) {
            return false;
        }
        match &self.metadata {
            Some(wanted) => metadata_matches(wanted, event.metadata.as_ref()),
            None => true,
        }
    }

    /// Deliver an update, honoring the debounce window. Without debounce the
    /// handler runs on the caller's stack.
    pub(super) fn notify(self: &Arc<Self>, event: &StateUpdateEvent) {
        let Some(window) = self.debounce else {
            (self.handler)(event);
            return;
        };

        let mut pending = self.pending.lock().unwrap();
        pending.latest = Some(event.clone());
        // Trailing edge: every new update restarts the window.
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        let entry = Arc::clone(self);
        pending.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let latest = {
                let mut pending = entry.pending.lock().unwrap();
                pending.timer = None;
                pending.latest.take()
            };
            if let Some(event) = latest {
                (entry.handler)(&event);
            }
        }));
    }

    /// Deliver synchronously, bypassing the debounce window. Used for the
    /// `immediate` initial delivery.
    pub(super) fn notify_immediate(&self, event: &StateUpdateEvent) {
        (self.handler)(event);
    }

    pub(super) fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
        pending.latest = None;
    }
}
