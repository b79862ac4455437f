#![forbid(unsafe_code)]

//! Backup engine for a distributed in-memory log store.
//!
//! Masters replicate their log segments to backups; when a master dies,
//! backups carve their stored replicas into per-partition recovery segments
//! for the new owners. This crate is the backup-side core: the replica
//! lifecycle, the durable frame store with its integrity-sealed metadata
//! trailers, restart inventory behind a cluster-name fence, the recovery
//! segment builder, and garbage collection of replicas whose masters are
//! gone. RPC transport, membership discovery, and process bootstrap live
//! outside.

pub mod config;
pub mod core;
pub mod error;
pub mod gc;
pub mod index;
pub mod recovery;
pub mod replica;
pub mod segment;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use config::BackupConfig;
pub use error::{BackupError, BackupResult};
pub use service::{
    BackupService, LogDigestResult, StartReadingDataResult, WriteFlags, WriteRequest,
    WriteResponse,
};

// Re-export the domain atoms at the crate root for convenience.
pub use crate::core::{
    key_hash, LogPosition, Partitions, ReplicaKey, ReplicationGroup, SegmentId, ServerId, Tablet,
};
pub use crate::gc::{MasterClient, ProbeError, ProbeFn, ReplicaNeededProbe};
pub use crate::replica::{Replica, ReplicaStatus};
pub use crate::segment::{Certificate, EntryType, LogDigest, SegmentHeader, SegmentWriter};
pub use crate::storage::{FrameStore, ReplicaMetadata, StorageError, UNNAMED_CLUSTER};
