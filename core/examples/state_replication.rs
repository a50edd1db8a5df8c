//! Two coordinators sharing state over one bus.
//!
//! Run with `cargo run -p agentmesh-core --example state_replication`.

use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::api::{
    EventBus, StateConfig, StateCoordinator, StateSubscribeOptions, StateUpdateOptions,
};
use serde_json::json;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let bus = EventBus::in_memory();

    let planner = StateCoordinator::new(
        StateConfig {
            source_id: Some("planner".into()),
            sync_delay_ms: None,
            ..Default::default()
        },
        bus.clone(),
        None,
    );
    let worker = StateCoordinator::new(
        StateConfig {
            source_id: Some("worker".into()),
            sync_delay_ms: Some(50),
            ..Default::default()
        },
        bus.clone(),
        None,
    );

    let _watch = worker.subscribe(
        "tasks",
        StateSubscribeOptions {
            path_prefix: true,
            ..Default::default()
        },
        Arc::new(|event| {
            println!(
                "worker saw {} -> {} (v{})",
                event.path,
                event.value.clone().unwrap_or(json!(null)),
                event.version
            );
        }),
    );

    planner
        .set_state("tasks.t1", json!({"goal": "index repo", "status": "queued"}), Default::default())
        .await?;
    planner
        .set_state(
            "tasks.t1",
            json!({"status": "running"}),
            StateUpdateOptions {
                merge: true,
                ..Default::default()
            },
        )
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("planner tree: {}", planner.get_full_state());
    println!("worker tree:  {}", worker.get_full_state());
    assert_eq!(planner.get_full_state(), worker.get_full_state());

    planner.close();
    worker.close();
    Ok(())
}
