//! Stable re-exports for consumers.
//!
//! Prefer importing from `agentmesh_core::api` instead of reaching into
//! internal modules.

pub use crate::bus::{
    EmitOptions, Event, EventBus, EventFilter, EventHandler, ListenerId, SubscribeOptions,
    SubscriptionHandle, TypeFilter,
};
pub use crate::config::{
    load_default, load_from_path, AppConfig, BackendKind, BusConfig, LoggingConfig, StateConfig,
    StorageConfig,
};
pub use crate::error::{BusError, StateError, StorageError};
pub use crate::state::{
    ConflictDecision, ConflictResolutionStrategy, ConflictResolver, StateCoordinator,
    StateHandler, StateOperation, StateOperationType, StateSnapshot, StateSubscribeOptions,
    StateSubscription, StateUpdateEvent, StateUpdateOptions,
};
pub use crate::storage::{
    FileBackend, MemoryBackend, QueryOptions, SortBy, SortDirection, StorageBackend, StorageItem,
    StorageOptions, StorageSystem,
};
