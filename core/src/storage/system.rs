//! Storage facade: backend selection, typed encode/decode, TTL expiry, and
//! observability events on the bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{EmitOptions, EventBus};
use crate::config::{BackendKind, StorageConfig};
use crate::error::StorageError;

use super::{FileBackend, MemoryBackend, QueryOptions, StorageBackend, StorageItem};

const DEFAULT_STORAGE_DIR: &str = "./.storage";

/// Construction options for [`StorageSystem`].
#[derive(Clone, Default)]
pub struct StorageOptions {
    pub backend: BackendKind,
    /// Directory for the file backend. Defaults to `./.storage`.
    pub storage_dir: Option<String>,
    /// Item time-to-live. `None` disables expiry and the sweeper.
    pub cache_ttl: Option<Duration>,
    /// Required when `backend` is [`BackendKind::Custom`].
    pub custom_backend: Option<Arc<dyn StorageBackend>>,
}

impl From<&StorageConfig> for StorageOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            backend: config.backend,
            storage_dir: config.storage_dir.clone(),
            cache_ttl: config.cache_ttl_ms.map(Duration::from_millis),
            custom_backend: None,
        }
    }
}

/// Facade over a [`StorageBackend`]: serializes values at the API edge,
/// expires stale items lazily on read (and periodically via a background
/// sweeper), and mirrors mutations onto the bus as `storage:*` events.
pub struct StorageSystem {
    backend: Arc<dyn StorageBackend>,
    cache_ttl: Option<Duration>,
    bus: Option<Arc<EventBus>>,
    in_transaction: AtomicBool,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl StorageSystem {
    pub fn new(
        options: StorageOptions,
        bus: Option<Arc<EventBus>>,
    ) -> Result<Arc<Self>, StorageError> {
        let backend: Arc<dyn StorageBackend> = match options.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            BackendKind::File => {
                let dir = options
                    .storage_dir
                    .as_deref()
                    .unwrap_or(DEFAULT_STORAGE_DIR);
                Arc::new(FileBackend::new(dir)?)
            }
            BackendKind::Custom => options
                .custom_backend
                .clone()
                .ok_or(StorageError::MissingCustomBackend)?,
        };

        let system = Arc::new(Self {
            backend,
            cache_ttl: options.cache_ttl,
            bus,
            in_transaction: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        });

        if let Some(ttl) = options.cache_ttl {
            let handle = Self::spawn_sweeper(Arc::downgrade(&system), ttl);
            *system.sweeper.lock().unwrap() = Some(handle);
        }

        Ok(system)
    }

    /// Serialize and store a value under `key`.
    pub async fn set<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        metadata: Option<Map<String, Value>>,
    ) -> Result<(), StorageError> {
        let value = serde_json::to_value(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.backend
            .set(key, StorageItem::new(key, value, metadata))
            .await?;
        self.notify("storage:set", json!({ "key": key }));
        Ok(())
    }

    /// Fetch and deserialize the value under `key`. An expired item is
    /// deleted and reported as absent.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        match self.get_item(key).await? {
            Some(item) => {
                let value =
                    serde_json::from_value(item.value).map_err(|source| StorageError::Decode {
                        key: key.to_string(),
                        source,
                    })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Fetch the raw item under `key`, including timestamp and metadata.
    pub async fn get_item(&self, key: &str) -> Result<Option<StorageItem>, StorageError> {
        let Some(item) = self.backend.get(key).await? else {
            return Ok(None);
        };
        if self.is_expired(&item) {
            debug!(key, "expiring stale item on read");
            self.backend.delete(key).await?;
            return Ok(None);
        }
        Ok(Some(item))
    }

    pub async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get_item(key).await?.is_some())
    }

    /// Returns whether the key existed.
    pub async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let existed = self.backend.delete(key).await?;
        if existed {
            self.notify("storage:delete", json!({ "key": key }));
        }
        Ok(existed)
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        self.backend.clear().await?;
        self.notify("storage:clear", json!({}));
        Ok(())
    }

    pub async fn keys(&self, options: &QueryOptions) -> Result<Vec<String>, StorageError> {
        self.backend.keys(options).await
    }

    /// Query items. Expired items are filtered out but not deleted here;
    /// the sweeper or a later `get` reclaims them.
    pub async fn query(&self, options: &QueryOptions) -> Result<Vec<StorageItem>, StorageError> {
        let items = self.backend.query(options).await?;
        Ok(items.into_iter().filter(|i| !self.is_expired(i)).collect())
    }

    pub async fn begin_transaction(&self) -> Result<(), StorageError> {
        self.backend.begin_transaction().await?;
        self.in_transaction.store(true, Ordering::SeqCst);
        self.notify("storage:transaction:begin", json!({}));
        Ok(())
    }

    pub async fn commit_transaction(&self) -> Result<(), StorageError> {
        self.backend.commit_transaction().await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        self.notify("storage:transaction:commit", json!({}));
        Ok(())
    }

    pub async fn rollback_transaction(&self) -> Result<(), StorageError> {
        self.backend.rollback_transaction().await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        self.notify("storage:transaction:rollback", json!({}));
        Ok(())
    }

    /// Stop the background sweeper. Further calls are no-ops.
    pub fn close(&self) {
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    fn is_expired(&self, item: &StorageItem) -> bool {
        let Some(ttl) = self.cache_ttl else {
            return false;
        };
        let age = Utc::now().signed_duration_since(item.timestamp);
        age.to_std().map(|age| age > ttl).unwrap_or(false)
    }

    /// Observability events are best effort; a bus failure never fails the
    /// storage operation itself.
    fn notify(&self, event_type: &str, payload: Value) {
        if let Some(bus) = &self.bus {
            if let Err(err) = bus.emit(event_type, payload, EmitOptions::default()) {
                warn!(event_type, %err, "storage event emission failed");
            }
        }
    }

    fn spawn_sweeper(system: std::sync::Weak<Self>, ttl: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ttl);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let Some(system) = system.upgrade() else {
                    return;
                };
                // Never sweep through an open transaction's shadow state.
                if system.in_transaction.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(err) = system.sweep_expired().await {
                    warn!(%err, "ttl sweep failed");
                }
            }
        })
    }

    async fn sweep_expired(&self) -> Result<(), StorageError> {
        let items = self.backend.query(&QueryOptions::default()).await?;
        for item in items {
            if self.is_expired(&item) {
                debug!(key = %item.key, "sweeping expired item");
                self.backend.delete(&item.key).await?;
            }
        }
        Ok(())
    }
}

impl Drop for StorageSystem {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        score: u32,
    }

    fn memory_system() -> Arc<StorageSystem> {
        StorageSystem::new(StorageOptions::default(), None).unwrap()
    }

    #[tokio::test]
    async fn typed_round_trip() {
        let storage = memory_system();
        let profile = Profile {
            name: "ada".into(),
            score: 7,
        };
        storage.set("profiles/ada", &profile, None).await.unwrap();

        let got: Profile = storage.get("profiles/ada").await.unwrap().unwrap();
        assert_eq!(got, profile);
        assert!(storage.has("profiles/ada").await.unwrap());
    }

    #[tokio::test]
    async fn decode_mismatch_is_an_error() {
        let storage = memory_system();
        storage.set("n", &"not a number", None).await.unwrap();

        let got: Result<Option<u64>, _> = storage.get("n").await;
        assert!(matches!(got, Err(StorageError::Decode { .. })));
    }

    #[tokio::test]
    async fn missing_custom_backend_is_rejected() {
        let result = StorageSystem::new(
            StorageOptions {
                backend: BackendKind::Custom,
                ..Default::default()
            },
            None,
        );
        assert!(matches!(result, Err(StorageError::MissingCustomBackend)));
    }

    #[tokio::test]
    async fn expired_item_reads_as_absent_and_is_deleted() {
        let storage = StorageSystem::new(
            StorageOptions {
                cache_ttl: Some(Duration::from_millis(20)),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        storage.set("ephemeral", &1, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let got: Option<i64> = storage.get("ephemeral").await.unwrap();
        assert!(got.is_none());
        // The lazy expiry also removed the key from the backend.
        assert!(storage
            .keys(&QueryOptions::default())
            .await
            .unwrap()
            .is_empty());
        storage.close();
    }

    #[tokio::test]
    async fn query_filters_expired_items() {
        let storage = StorageSystem::new(
            StorageOptions {
                cache_ttl: Some(Duration::from_millis(20)),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        storage.set("old", &1, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        storage.set("fresh", &2, None).await.unwrap();

        let items = storage.query(&QueryOptions::default()).await.unwrap();
        let keys: Vec<&str> = items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["fresh"]);
        storage.close();
    }

    #[tokio::test]
    async fn mutations_are_mirrored_on_the_bus() {
        let bus = EventBus::in_memory();
        let storage = StorageSystem::new(StorageOptions::default(), Some(bus.clone())).unwrap();

        storage.set("a", &1, None).await.unwrap();
        storage.delete("a").await.unwrap();
        storage.delete("a").await.unwrap(); // absent, no event
        storage.begin_transaction().await.unwrap();
        storage.rollback_transaction().await.unwrap();

        assert_eq!(bus.get_event_history("storage:set").len(), 1);
        assert_eq!(bus.get_event_history("storage:delete").len(), 1);
        assert_eq!(bus.get_event_history("storage:transaction:begin").len(), 1);
        assert_eq!(
            bus.get_event_history("storage:transaction:rollback").len(),
            1
        );
    }

    #[tokio::test]
    async fn transaction_round_trip_through_facade() {
        let storage = memory_system();
        storage.set("kept", &1, None).await.unwrap();

        storage.begin_transaction().await.unwrap();
        storage.set("staged", &2, None).await.unwrap();
        storage.commit_transaction().await.unwrap();

        let staged: Option<i64> = storage.get("staged").await.unwrap();
        assert_eq!(staged, Some(2));
    }

    #[tokio::test]
    async fn sweeper_reclaims_expired_items() {
        let storage = StorageSystem::new(
            StorageOptions {
                cache_ttl: Some(Duration::from_millis(30)),
                ..Default::default()
            },
            None,
        )
        .unwrap();
        storage.set("stale", &1, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        // Check the backend directly so lazy read expiry plays no part.
        let keys = storage.backend.keys(&QueryOptions::default()).await.unwrap();
        assert!(keys.is_empty());
        storage.close();
    }
}
