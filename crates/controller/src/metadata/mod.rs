//! Cluster metadata definitions
//!
//! Contains core data structures such as instances, segments, assignments and
//! the per-cycle cluster view

mod assignment;
mod cluster;
mod instance;
mod segment;
mod table;

pub use assignment::{Assignment, InstanceStateMap};
pub use cluster::{ClusterView, Version, ViewStats};
pub use instance::{InstanceId, ServerInstance};
pub use segment::{Segment, SegmentId, SegmentState};
pub use table::{
    PolicyKind, ReplicaGroupSpec, ReplicationSpec, TableConfig, TableName, TableRecord,
};
