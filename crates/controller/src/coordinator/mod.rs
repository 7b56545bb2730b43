//! Coordination service interfaces
//!
//! The controller reads the instance roster and per-table records from a
//! coordination service and writes records back with a conditional write on
//! the version token. Table configuration comes from a separate provider.

mod local;
mod tables;

pub use local::{LocalCoordinator, RegisterResult};
pub use tables::StaticTableConfigs;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AssignmentError;
use crate::metadata::{ServerInstance, TableConfig, TableName, TableRecord, Version};

/// Coordination error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("Version mismatch for table {table}: expected {expected}, found {actual}")]
    VersionMismatch {
        table: TableName,
        expected: Version,
        actual: Version,
    },
    #[error("Unavailable: {0}")]
    Unavailable(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CoordinationError {
    fn from(e: std::io::Error) -> Self {
        CoordinationError::Io(e.to_string())
    }
}

impl From<CoordinationError> for AssignmentError {
    fn from(e: CoordinationError) -> Self {
        match e {
            CoordinationError::VersionMismatch {
                table, expected, ..
            } => AssignmentError::Conflict { table, expected },
            other => AssignmentError::InstanceUnavailable(other.to_string()),
        }
    }
}

/// Table record with its version token
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub record: TableRecord,
    /// Zero for a table that was never written
    pub version: Version,
}

/// Cluster coordination service
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Current instance roster, including non-live instances
    async fn instances(&self) -> Result<Vec<ServerInstance>, CoordinationError>;

    /// Read a table record with its version token
    async fn read_table(&self, table: &str) -> Result<VersionedRecord, CoordinationError>;

    /// Write a table record if its version is still `expected`
    ///
    /// Returns the new version.
    async fn write_table(
        &self,
        table: &str,
        record: TableRecord,
        expected: Version,
    ) -> Result<Version, CoordinationError>;

    /// Tables with a persisted record
    async fn tables(&self) -> Result<Vec<TableName>, CoordinationError>;
}

/// Source of table configuration
#[async_trait]
pub trait TableConfigProvider: Send + Sync {
    /// Configuration of a table
    async fn table_config(&self, table: &str) -> Option<TableConfig>;

    /// All configured tables
    async fn table_names(&self) -> Vec<TableName>;
}
