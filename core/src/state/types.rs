use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateOperationType {
    Set,
    Delete,
    Clear,
}

/// One entry of the operation log. Operations are what replicate between
/// instances; the tree is derived by applying them in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub operation_type: StateOperationType,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Payload delivered to state subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdateEvent {
    pub id: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    pub source_id: String,
}

/// Per-call options for state mutations.
#[derive(Debug, Clone)]
pub struct StateUpdateOptions {
    /// Deep-merge an object value into the existing object instead of
    /// replacing it.
    pub merge: bool,
    /// Notify local subscribers.
    pub notify: bool,
    /// Replicate the operation over the bus.
    pub broadcast: bool,
    pub metadata: Option<Map<String, Value>>,
    /// Overrides the configured strategy for this one write.
    pub conflict_strategy: Option<ConflictResolutionStrategy>,
    pub updated_by: Option<String>,
}

impl Default for StateUpdateOptions {
    fn default() -> Self {
        Self {
            merge: false,
            notify: true,
            broadcast: true,
            metadata: None,
            conflict_strategy: None,
            updated_by: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionStrategy {
    #[default]
    LastWriteWins,
    HighestVersionWins,
    Merge,
    Custom,
}

impl FromStr for ConflictResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last_write_wins" => Ok(Self::LastWriteWins),
            "highest_version_wins" => Ok(Self::HighestVersionWins),
            "merge" => Ok(Self::Merge),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown conflict strategy: {other}")),
        }
    }
}

impl fmt::Display for ConflictResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::LastWriteWins => "last_write_wins",
            Self::HighestVersionWins => "highest_version_wins",
            Self::Merge => "merge",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// Verdict of conflict resolution for a local write racing a recent remote
/// write to the same path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Keep the value already in the tree; drop the incoming write.
    KeepCurrent,
    /// Apply the incoming write unchanged.
    UseIncoming,
    /// Apply this value instead (e.g. a merge of both).
    UseValue(Value),
}

/// Caller-supplied resolver for [`ConflictResolutionStrategy::Custom`].
/// Receives `(path, current_value, incoming_value)`.
pub type ConflictResolver =
    Arc<dyn Fn(&str, Option<&Value>, &Value) -> ConflictDecision + Send + Sync>;

/// Persisted snapshot of a coordinator: the tree plus enough history to
/// answer sync requests after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: Value,
    pub version: u64,
    pub operation_log: Vec<StateOperation>,
    pub timestamp: DateTime<Utc>,
}
