//! In-process coordinator
//!
//! Keeps the instance roster and table records in memory, with optional JSON
//! snapshots on disk. Suitable for a single controller process and tests; it
//! does not replicate anything.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use super::{CoordinationError, Coordinator, VersionedRecord};
use crate::metadata::{InstanceId, ServerInstance, TableName, TableRecord, Version};

const SNAPSHOT_FILE: &str = "coordinator_snapshot.json";

/// Registration result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterResult {
    /// First registration of the instance
    NewInstance,
    /// Instance was already known; its description was replaced
    Updated,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LocalState {
    instances: BTreeMap<InstanceId, ServerInstance>,
    tables: BTreeMap<TableName, VersionedRecord>,
}

/// In-process coordination backend
#[derive(Debug, Default)]
pub struct LocalCoordinator {
    state: RwLock<LocalState>,
    /// Snapshot file, when persistence is enabled
    snapshot_path: Option<PathBuf>,
}

impl LocalCoordinator {
    /// Memory-only coordinator
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a coordinator persisted under `data_dir`, loading the last snapshot
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, CoordinationError> {
        let data_dir = data_dir.as_ref();
        if !data_dir.exists() {
            fs::create_dir_all(data_dir).await?;
            info!("Created data directory: {:?}", data_dir);
        }

        let path = data_dir.join(SNAPSHOT_FILE);
        let state = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let state: LocalState = serde_json::from_str(&content)
                .map_err(|e| CoordinationError::Serialization(e.to_string()))?;
            info!(
                "Loaded coordinator snapshot: {} instances, {} tables",
                state.instances.len(),
                state.tables.len()
            );
            state
        } else {
            info!("No coordinator snapshot at {:?}, starting empty", path);
            LocalState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path),
        })
    }

    /// Write a snapshot, if persistence is enabled
    pub async fn save(&self) -> Result<(), CoordinationError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };

        let content = {
            let state = self.state.read();
            serde_json::to_string_pretty(&*state)
                .map_err(|e| CoordinationError::Serialization(e.to_string()))?
        };

        // Write to temp file first, then atomically rename
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, &content).await?;
        fs::rename(&temp_path, path).await?;
        debug!("Saved coordinator snapshot to {:?}", path);
        Ok(())
    }

    /// Register or update an instance
    pub fn register_instance(&self, instance: ServerInstance) -> RegisterResult {
        let id = instance.id.clone();
        let previous = self.state.write().instances.insert(id.clone(), instance);
        if previous.is_some() {
            info!("Instance re-registered: {}", id);
            RegisterResult::Updated
        } else {
            info!("New instance registered: {}", id);
            RegisterResult::NewInstance
        }
    }

    /// Flip the liveness of an instance
    pub fn set_live(&self, id: &str, live: bool) -> bool {
        match self.state.write().instances.get_mut(id) {
            Some(instance) => {
                if instance.live != live {
                    info!("Instance {} is now {}", id, if live { "live" } else { "down" });
                }
                instance.live = live;
                true
            }
            None => {
                warn!("Liveness update for unknown instance: {}", id);
                false
            }
        }
    }

    /// Remove an instance from the roster
    pub fn remove_instance(&self, id: &str) -> Option<ServerInstance> {
        let removed = self.state.write().instances.remove(id);
        if removed.is_some() {
            info!("Instance {} removed from cluster", id);
        }
        removed
    }

    pub fn instance(&self, id: &str) -> Option<ServerInstance> {
        self.state.read().instances.get(id).cloned()
    }

    pub fn list_instances(&self) -> Vec<ServerInstance> {
        self.state.read().instances.values().cloned().collect()
    }
}

#[async_trait]
impl Coordinator for LocalCoordinator {
    async fn instances(&self) -> Result<Vec<ServerInstance>, CoordinationError> {
        Ok(self.list_instances())
    }

    async fn read_table(&self, table: &str) -> Result<VersionedRecord, CoordinationError> {
        Ok(self
            .state
            .read()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_table(
        &self,
        table: &str,
        record: TableRecord,
        expected: Version,
    ) -> Result<Version, CoordinationError> {
        let mut state = self.state.write();
        let entry = state.tables.entry(table.to_string()).or_default();
        if entry.version != expected {
            return Err(CoordinationError::VersionMismatch {
                table: table.to_string(),
                expected,
                actual: entry.version,
            });
        }

        entry.record = record;
        entry.version += 1;
        debug!("Table {} written at version {}", table, entry.version);
        Ok(entry.version)
    }

    async fn tables(&self) -> Result<Vec<TableName>, CoordinationError> {
        Ok(self.state.read().tables.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::SegmentState;

    #[tokio::test]
    async fn test_conditional_write() {
        let coordinator = LocalCoordinator::new();
        let initial = coordinator.read_table("events").await.unwrap();
        assert_eq!(initial.version, 0);

        let mut record = TableRecord::default();
        record
            .assignment
            .set_state("seg_1", "server_a", SegmentState::Online);
        let version = coordinator
            .write_table("events", record.clone(), 0)
            .await
            .unwrap();
        assert_eq!(version, 1);

        let err = coordinator
            .write_table("events", record.clone(), 0)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinationError::VersionMismatch {
                table: "events".to_string(),
                expected: 0,
                actual: 1,
            }
        );

        let read = coordinator.read_table("events").await.unwrap();
        assert_eq!(read.version, 1);
        assert_eq!(read.record, record);
        assert_eq!(coordinator.tables().await.unwrap(), vec!["events".to_string()]);
    }

    #[tokio::test]
    async fn test_instance_admin() {
        let coordinator = LocalCoordinator::new();
        assert_eq!(
            coordinator.register_instance(ServerInstance::new("server_a")),
            RegisterResult::NewInstance
        );
        assert_eq!(
            coordinator.register_instance(ServerInstance::new("server_a").with_capacity(5)),
            RegisterResult::Updated
        );
        assert!(coordinator.set_live("server_a", false));
        assert!(!coordinator.set_live("server_z", false));
        assert!(!coordinator.instance("server_a").unwrap().live);

        assert!(coordinator.remove_instance("server_a").is_some());
        assert!(coordinator.instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = LocalCoordinator::open(dir.path()).await.unwrap();
        coordinator.register_instance(ServerInstance::new("server_a").with_tag("analytics"));
        coordinator
            .write_table("events", TableRecord::default(), 0)
            .await
            .unwrap();
        coordinator.save().await.unwrap();

        let reopened = LocalCoordinator::open(dir.path()).await.unwrap();
        assert_eq!(reopened.list_instances().len(), 1);
        assert!(reopened.instance("server_a").unwrap().has_tag("analytics"));
        assert_eq!(reopened.read_table("events").await.unwrap().version, 1);
    }
}
