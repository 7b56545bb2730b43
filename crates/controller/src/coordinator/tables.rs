//! Static table configuration

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::info;

use super::TableConfigProvider;
use crate::metadata::{TableConfig, TableName};

/// Table configs held in memory, seeded from the configuration file
#[derive(Debug, Default)]
pub struct StaticTableConfigs {
    tables: RwLock<BTreeMap<TableName, TableConfig>>,
}

impl StaticTableConfigs {
    pub fn new(tables: impl IntoIterator<Item = TableConfig>) -> Self {
        Self {
            tables: RwLock::new(tables.into_iter().map(|t| (t.name.clone(), t)).collect()),
        }
    }

    /// Add or replace a table config, returning the previous one
    pub fn upsert(&self, config: TableConfig) -> Option<TableConfig> {
        info!(
            "Table {} configured: {} replicas, tag {}, {} placement",
            config.name, config.replication.replicas, config.replication.tenant_tag, config.policy
        );
        self.tables.write().insert(config.name.clone(), config)
    }

    pub fn remove(&self, table: &str) -> Option<TableConfig> {
        self.tables.write().remove(table)
    }
}

#[async_trait]
impl TableConfigProvider for StaticTableConfigs {
    async fn table_config(&self, table: &str) -> Option<TableConfig> {
        self.tables.read().get(table).cloned()
    }

    async fn table_names(&self) -> Vec<TableName> {
        self.tables.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ReplicationSpec;

    #[tokio::test]
    async fn test_upsert_and_lookup() {
        let tables = StaticTableConfigs::new(vec![TableConfig::new(
            "events",
            ReplicationSpec::new(2, "analytics"),
        )]);
        assert!(tables.table_config("events").await.is_some());
        assert!(tables.table_config("clicks").await.is_none());

        let previous =
            tables.upsert(TableConfig::new("events", ReplicationSpec::new(3, "analytics")));
        assert_eq!(previous.map(|t| t.replication.replicas), Some(2));
        assert_eq!(tables.table_names().await, vec!["events".to_string()]);

        tables.remove("events");
        assert!(tables.table_names().await.is_empty());
    }
}
