//! The replica metadata trailer stored after each frame's payload.

use crc32c::crc32c;

use crate::segment::Certificate;

/// Everything restart needs to take inventory of a replica, sealed with a
/// crc32c so a torn or scrambled trailer write reads as "no replica here".
///
/// Field order is the wire order. The checksum covers every preceding byte
/// and must stay last.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplicaMetadata {
    /// Certificate for the replica payload sharing this frame; bounds and
    /// verifies the entry framing during recovery.
    pub certificate: Certificate,
    /// Log (master) the replica belongs to, packed `ServerId` form.
    pub log_id: u64,
    pub segment_id: u64,
    /// Size the replica was written against. A replica found on disk with a
    /// different capacity than the running configuration is unusable.
    pub segment_capacity: u32,
    /// Whether the master closed this replica.
    pub closed: bool,
}

impl ReplicaMetadata {
    /// Packed length: certificate (8) + log id (8) + segment id (8)
    /// + capacity (4) + closed (1) + crc32c (4).
    pub const LEN: usize = 33;

    pub fn new(
        certificate: Certificate,
        log_id: u64,
        segment_id: u64,
        segment_capacity: u32,
        closed: bool,
    ) -> Self {
        Self {
            certificate,
            log_id,
            segment_id,
            segment_capacity,
            closed,
        }
    }

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..8].copy_from_slice(&self.certificate.encode());
        buf[8..16].copy_from_slice(&self.log_id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[24..28].copy_from_slice(&self.segment_capacity.to_le_bytes());
        buf[28] = u8::from(self.closed);
        let crc = crc32c(&buf[..29]);
        buf[29..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decode a trailer, returning None unless the checksum verifies.
    ///
    /// A zeroed trailer, a torn write, and bit rot all land here as None;
    /// restart treats such frames as free.
    pub fn decode(bytes: &[u8; Self::LEN]) -> Option<Self> {
        let expected = u32::from_le_bytes([bytes[29], bytes[30], bytes[31], bytes[32]]);
        if crc32c(&bytes[..29]) != expected {
            return None;
        }
        let mut certificate = [0u8; Certificate::LEN];
        certificate.copy_from_slice(&bytes[..8]);
        Some(Self {
            certificate: Certificate::decode(&certificate),
            log_id: u64::from_le_bytes([
                bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13], bytes[14],
                bytes[15],
            ]),
            segment_id: u64::from_le_bytes([
                bytes[16], bytes[17], bytes[18], bytes[19], bytes[20], bytes[21], bytes[22],
                bytes[23],
            ]),
            segment_capacity: u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]),
            closed: bytes[28] != 0,
        })
    }
}
