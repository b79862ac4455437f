//! RPC-boundary error taxonomy.
//!
//! Every failure a master or the coordinator can observe maps to one of
//! these kinds. Internal layers keep their own error enums and convert at
//! the service facade.

use thiserror::Error;

use crate::core::{SegmentId, ServerId};
use crate::storage::StorageError;

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Error)]
pub enum BackupError {
    /// The named replica is absent, or present but in the wrong state for
    /// the requested operation.
    #[error("replica <{master},{segment_id}> is not present or not in a state accepting this operation")]
    BadSegmentId {
        master: ServerId,
        segment_id: SegmentId,
    },

    /// An open was refused: storage exhausted, or the replica was revived
    /// from disk and is read-only until recovered or freed.
    #[error("cannot open replica <{master},{segment_id}>: {reason}")]
    OpenRejected {
        master: ServerId,
        segment_id: SegmentId,
        reason: String,
    },

    #[error(
        "write to <{master},{segment_id}> at offset {offset} of {length} bytes \
         exceeds segment size {segment_size}"
    )]
    SegmentOverflow {
        master: ServerId,
        segment_id: SegmentId,
        offset: u32,
        length: u32,
        segment_size: u32,
    },

    /// The recovery builder found malformed log-entry framing in the stored
    /// replica. The coordinator is expected to retry on another backup.
    #[error("recovery segments could not be built for <{master},{segment_id}>: {reason}")]
    SegmentRecoveryFailed {
        master: ServerId,
        segment_id: SegmentId,
        reason: String,
    },

    /// Unrecoverable storage-layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl BackupError {
    pub fn bad_segment_id(master: ServerId, segment_id: SegmentId) -> Self {
        BackupError::BadSegmentId { master, segment_id }
    }
}
