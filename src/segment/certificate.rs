//! Segment certificates (8 bytes, packed, crc32c).

use crc32c::crc32c;

use super::{SegmentError, SegmentResult};

/// Seals the entry framing of a segment prefix.
///
/// Masters compute a fresh certificate after every append and ship it with
/// the replicated bytes; the backup stores the latest one in the frame
/// metadata trailer. `verify` is the only way recovery code gets at the
/// certified bytes, so unverified framing never reaches the entry iterator.
///
/// The default certificate covers an empty segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Certificate {
    pub segment_length: u32,
    pub checksum: u32,
}

impl Certificate {
    pub const LEN: usize = 8;

    /// Certificate for `payload[..len]` as currently written.
    pub fn compute(payload: &[u8]) -> Self {
        Self {
            segment_length: payload.len() as u32,
            checksum: crc32c(payload),
        }
    }

    /// Check this certificate against a replica payload and return the
    /// certified prefix.
    pub fn verify<'a>(&self, payload: &'a [u8]) -> SegmentResult<&'a [u8]> {
        let len = self.segment_length as usize;
        if len > payload.len() {
            return Err(SegmentError::CertificateBounds {
                segment_length: self.segment_length,
                payload_len: payload.len(),
            });
        }
        let covered = &payload[..len];
        let got = crc32c(covered);
        if got != self.checksum {
            return Err(SegmentError::CertificateMismatch {
                expected: self.checksum,
                got,
            });
        }
        Ok(covered)
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..4].copy_from_slice(&self.segment_length.to_le_bytes());
        buf[4..].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8; Self::LEN]) -> Self {
        Self {
            segment_length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            checksum: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
