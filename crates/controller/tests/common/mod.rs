//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use controller::config::Config;
use controller::coordinator::{Coordinator, LocalCoordinator, StaticTableConfigs};
use controller::metadata::{ReplicationSpec, SegmentState, ServerInstance, TableConfig};
use controller::Controller;

pub const TAG: &str = "analytics";

pub fn tagged(id: &str) -> ServerInstance {
    ServerInstance::new(id).with_tag(TAG)
}

pub fn table(name: &str, replicas: usize) -> TableConfig {
    TableConfig::new(name, ReplicationSpec::new(replicas, TAG))
}

/// Config with short intervals for tests
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.controller.refresh_interval_ms = 5;
    config.controller.max_refresh_cycles = 200;
    config.publisher.initial_backoff_ms = 1;
    config.publisher.max_backoff_ms = 5;
    config.coordinator.request_timeout_ms = 1000;
    config
}

pub struct Harness {
    pub coordinator: Arc<LocalCoordinator>,
    pub controller: Arc<Controller>,
}

pub fn harness(
    instances: Vec<ServerInstance>,
    tables: Vec<TableConfig>,
    config: Config,
) -> Harness {
    let coordinator = Arc::new(LocalCoordinator::new());
    for instance in instances {
        coordinator.register_instance(instance);
    }
    let provider = Arc::new(StaticTableConfigs::new(tables));
    let controller = Arc::new(Controller::new(config, coordinator.clone(), provider));
    Harness {
        coordinator,
        controller,
    }
}

/// Simulated servers: bring every OFFLINE replica on a live instance ONLINE
pub fn spawn_servers(harness: &Harness, table: &'static str) -> tokio::task::JoinHandle<()> {
    let coordinator = harness.coordinator.clone();
    let controller = harness.controller.clone();
    tokio::spawn(async move {
        loop {
            if let Ok(versioned) = coordinator.read_table(table).await {
                for (segment, replicas) in versioned.record.assignment.iter() {
                    for (instance, state) in replicas {
                        let live = coordinator
                            .instance(instance)
                            .map(|i| i.live)
                            .unwrap_or(false);
                        if *state == SegmentState::Offline && live {
                            let _ = controller
                                .transition(table, segment, instance, SegmentState::Online)
                                .await;
                        }
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
}
