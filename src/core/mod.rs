//! Domain atoms shared by every engine component.

pub mod identity;
pub mod tablet;

pub use identity::{ReplicaKey, ReplicationGroup, SegmentId, ServerId};
pub use tablet::{key_hash, LogPosition, Partitions, Tablet};
