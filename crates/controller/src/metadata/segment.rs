//! Segment definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TableName;

/// Segment ID (unique within a table)
pub type SegmentId = String;

/// Lifecycle state of one (segment, instance) pair
///
/// Transition rules live in [`crate::lifecycle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    /// Assigned, no server serving yet
    Offline,
    /// Realtime segment actively ingesting on the server
    Consuming,
    /// Fully built and queryable
    Online,
    /// Server reported a failure
    Error,
    /// Retired (terminal)
    Dropped,
}

impl SegmentState {
    /// Every state, in declaration order
    pub const ALL: [SegmentState; 5] = [
        SegmentState::Offline,
        SegmentState::Consuming,
        SegmentState::Online,
        SegmentState::Error,
        SegmentState::Dropped,
    ];

    /// Whether the replica answers queries in this state
    pub fn is_serving(&self) -> bool {
        matches!(self, SegmentState::Online | SegmentState::Consuming)
    }

    /// Whether the state has no outgoing transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SegmentState::Dropped)
    }
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentState::Offline => write!(f, "OFFLINE"),
            SegmentState::Consuming => write!(f, "CONSUMING"),
            SegmentState::Online => write!(f, "ONLINE"),
            SegmentState::Error => write!(f, "ERROR"),
            SegmentState::Dropped => write!(f, "DROPPED"),
        }
    }
}

/// Segment metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Segment ID
    pub id: SegmentId,
    /// Owning table
    pub table: TableName,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Monotonic generation, bumped whenever the segment is re-uploaded
    #[serde(default)]
    pub generation: u64,
    /// Upstream stream partition, if the segment came from a partitioned stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
}

impl Segment {
    /// Create new segment at generation 0
    pub fn new(table: impl Into<TableName>, id: impl Into<SegmentId>) -> Self {
        Self {
            id: id.into(),
            table: table.into(),
            created_at: Utc::now(),
            generation: 0,
            partition: None,
        }
    }

    /// Set partition
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Set generation
    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        let serving: Vec<_> = SegmentState::ALL.iter().filter(|s| s.is_serving()).collect();
        assert_eq!(serving, vec![&SegmentState::Consuming, &SegmentState::Online]);
        assert!(SegmentState::Dropped.is_terminal());
        assert!(!SegmentState::Error.is_terminal());
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&SegmentState::Consuming).unwrap();
        assert_eq!(json, "\"CONSUMING\"");
        let state: SegmentState = serde_json::from_str("\"ONLINE\"").unwrap();
        assert_eq!(state, SegmentState::Online);
    }
}
