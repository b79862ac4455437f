//! Log segment entry model.
//!
//! A segment payload is a run of typed entries, each framed as a one-byte
//! type and a little-endian length. Masters seal what they have written so
//! far with a [`Certificate`]; backups verify the certificate before
//! trusting the framing during recovery.

use thiserror::Error;

pub mod certificate;
pub mod digest;
pub mod entry;
pub mod header;
pub mod object;
pub mod writer;

pub use certificate::Certificate;
pub use digest::{scan_for_digest, LogDigest};
pub use entry::{entries, scan_entries, Entry, EntryType};
pub use header::{SegmentHeader, INVALID_SEGMENT_ID};
pub use object::{ObjectRecord, TombstoneRecord};
pub use writer::SegmentWriter;

pub type SegmentResult<T> = Result<T, SegmentError>;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("certificate covers {segment_length} bytes but payload holds {payload_len}")]
    CertificateBounds {
        segment_length: u32,
        payload_len: usize,
    },
    #[error("certificate crc32c mismatch: expected {expected:#x}, got {got:#x}")]
    CertificateMismatch { expected: u32, got: u32 },
    #[error("entry header truncated at offset {offset}")]
    EntryHeaderTruncated { offset: u32 },
    #[error("entry at offset {offset} overruns certified region ({len} bytes past {limit})")]
    EntryOverrun { offset: u32, len: u32, limit: u32 },
    #[error("segment header payload invalid: {reason}")]
    HeaderInvalid { reason: String },
    #[error("log digest payload invalid: {reason}")]
    DigestInvalid { reason: String },
    #[error("entry of {needed} bytes does not fit in segment of {capacity} bytes")]
    EntryTooLarge { needed: usize, capacity: u32 },
}
