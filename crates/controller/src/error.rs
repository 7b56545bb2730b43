//! Controller error taxonomy
//!
//! Transient errors (`Conflict`, `InstanceUnavailable`) are recovered by
//! re-running the whole planning cycle. Everything else is surfaced to the
//! caller as an explicit result.

use crate::metadata::{InstanceId, SegmentId, SegmentState, TableName, Version};

/// Controller error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error(
        "Insufficient capacity for table {table}: {available} eligible instances, {required} replicas required"
    )]
    InsufficientCapacity {
        table: TableName,
        required: usize,
        available: usize,
    },

    #[error("Illegal transition for segment {segment} on {instance}: {from} -> {to}")]
    IllegalTransition {
        segment: SegmentId,
        instance: InstanceId,
        from: SegmentState,
        to: SegmentState,
    },

    #[error("Assignment of table {table} changed since version {expected}")]
    Conflict { table: TableName, expected: Version },

    #[error("Stalled migration in table {table}: {segments:?}")]
    StalledMigration {
        table: TableName,
        segments: Vec<SegmentId>,
    },

    #[error("Coordination service unavailable: {0}")]
    InstanceUnavailable(String),

    #[error("Table {0} not found")]
    TableNotFound(TableName),

    #[error("Segment {segment} not found in table {table}")]
    SegmentNotFound { table: TableName, segment: SegmentId },

    #[error("No replica of segment {segment} on {instance} in table {table}")]
    ReplicaNotFound {
        table: TableName,
        segment: SegmentId,
        instance: InstanceId,
    },

    #[error("Segment {segment} generation {generation} is superseded by recorded generation {recorded}")]
    SupersededSegment {
        segment: SegmentId,
        generation: u64,
        recorded: u64,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AssignmentError {
    /// Whether retrying the whole cycle from a fresh cluster view may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AssignmentError::Conflict { .. } | AssignmentError::InstanceUnavailable(_)
        )
    }
}

/// Result alias used throughout the controller
pub type Result<T> = std::result::Result<T, AssignmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let conflict = AssignmentError::Conflict {
            table: "events".to_string(),
            expected: 3,
        };
        assert!(conflict.is_transient());
        assert!(AssignmentError::InstanceUnavailable("timeout".into()).is_transient());

        let illegal = AssignmentError::IllegalTransition {
            segment: "s1".to_string(),
            instance: "server_1".to_string(),
            from: SegmentState::Consuming,
            to: SegmentState::Offline,
        };
        assert!(!illegal.is_transient());
        assert_eq!(
            illegal.to_string(),
            "Illegal transition for segment s1 on server_1: CONSUMING -> OFFLINE"
        );
    }
}
