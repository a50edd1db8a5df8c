//! Path-addressed shared state with versioning, conflict resolution, and
//! bus-based replication between instances.

mod coordinator;
mod subscription;
mod types;
mod value;

pub use coordinator::{
    StateCoordinator, StateSubscription, STATE_CHANGE_EVENT, STATE_STORAGE_KEY,
    STATE_SYNC_REQUEST_EVENT, STATE_SYNC_RESPONSE_EVENT,
};
pub use subscription::{StateHandler, StateSubscribeOptions};
pub use types::{
    ConflictDecision, ConflictResolutionStrategy, ConflictResolver, StateOperation,
    StateOperationType, StateSnapshot, StateUpdateEvent, StateUpdateOptions,
};
