use serde::{Deserialize, Serialize};

use crate::state::ConflictResolutionStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_enabled")]
    pub enabled: bool,

    /// EnvFilter string, e.g. "info" or "agentmesh_core=debug".
    #[serde(default = "default_logging_level")]
    pub level: String,
}

fn default_logging_enabled() -> bool {
    true
}

fn default_logging_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_logging_enabled(),
            level: default_logging_level(),
        }
    }
}

/// Event bus settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusConfig {
    /// Mirror every event to disk as `<storage_dir>/<type>/<id>.json`.
    #[serde(default)]
    pub persistence_enabled: bool,

    /// Directory for persisted events. Required when persistence is enabled.
    #[serde(default)]
    pub storage_dir: Option<String>,

    /// Cap on retained events per type; oldest entries are trimmed first.
    #[serde(default)]
    pub max_events_per_type: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Memory,
    File,
    Custom,
}

/// Storage engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: BackendKind,

    /// Directory for the file backend. Defaults to `./.storage`.
    #[serde(default)]
    pub storage_dir: Option<String>,

    /// Item time-to-live in milliseconds. `None` disables expiry.
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: Option<u64>,
}

fn default_cache_ttl_ms() -> Option<u64> {
    // 1 hour
    Some(3_600_000)
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            storage_dir: None,
            cache_ttl_ms: default_cache_ttl_ms(),
        }
    }
}

/// State coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Identifier of this instance. Generated when unset.
    #[serde(default)]
    pub source_id: Option<String>,

    /// Snapshot `{state, version, operation_log}` through the storage engine
    /// after every mutation.
    #[serde(default)]
    pub persistence_enabled: bool,

    #[serde(default)]
    pub conflict_strategy: ConflictResolutionStrategy,

    /// Window within which a remote write to the same path counts as a
    /// conflict, in milliseconds.
    #[serde(default = "default_conflict_window_ms")]
    pub conflict_window_ms: u64,

    /// Delay before the initial `state:sync:request` is emitted. `None`
    /// disables the automatic request.
    #[serde(default = "default_sync_delay_ms")]
    pub sync_delay_ms: Option<u64>,

    /// Cap on retained operation-log entries.
    #[serde(default = "default_max_operation_log")]
    pub max_operation_log: usize,
}

fn default_conflict_window_ms() -> u64 {
    5_000
}

fn default_sync_delay_ms() -> Option<u64> {
    Some(1_000)
}

fn default_max_operation_log() -> usize {
    1_000
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            source_id: None,
            persistence_enabled: false,
            conflict_strategy: ConflictResolutionStrategy::default(),
            conflict_window_ms: default_conflict_window_ms(),
            sync_delay_ms: default_sync_delay_ms(),
            max_operation_log: default_max_operation_log(),
        }
    }
}
