use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::api::{EventBus, StateConfig, StateCoordinator};

/// Give spawned apply tasks a chance to drain their channels.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

pub fn coordinator(source_id: &str, bus: &Arc<EventBus>) -> StateCoordinator {
    StateCoordinator::new(
        StateConfig {
            source_id: Some(source_id.to_string()),
            sync_delay_ms: None,
            ..Default::default()
        },
        bus.clone(),
        None,
    )
}
