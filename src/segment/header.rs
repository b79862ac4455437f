//! The segment header entry: first entry of every well-formed segment.

use super::{SegmentError, SegmentResult};

/// Sentinel for "no segment id" on the wire.
pub const INVALID_SEGMENT_ID: u64 = u64::MAX;

const HEADER_PAYLOAD_LEN: usize = 28;

/// Identifies which log a segment belongs to and where it sits in it.
///
/// `head_segment_id_during_cleaning` is set on segments synthesized by the
/// master's log cleaner: their entries logically date from the head of the
/// log at cleaning time, not from this segment's own position, and tablet
/// liveness checks must use that position instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentHeader {
    pub log_id: u64,
    pub segment_id: u64,
    pub capacity: u32,
    pub head_segment_id_during_cleaning: Option<u64>,
}

impl SegmentHeader {
    pub fn new(log_id: u64, segment_id: u64, capacity: u32) -> Self {
        Self {
            log_id,
            segment_id,
            capacity,
            head_segment_id_during_cleaning: None,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_PAYLOAD_LEN] {
        let mut buf = [0u8; HEADER_PAYLOAD_LEN];
        buf[..8].copy_from_slice(&self.log_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[16..20].copy_from_slice(&self.capacity.to_le_bytes());
        let cleaning = self
            .head_segment_id_during_cleaning
            .unwrap_or(INVALID_SEGMENT_ID);
        buf[20..28].copy_from_slice(&cleaning.to_le_bytes());
        buf
    }

    pub fn decode(payload: &[u8]) -> SegmentResult<Self> {
        if payload.len() < HEADER_PAYLOAD_LEN {
            return Err(SegmentError::HeaderInvalid {
                reason: format!("{} bytes, need {HEADER_PAYLOAD_LEN}", payload.len()),
            });
        }
        let read_u64 = |at: usize| {
            u64::from_le_bytes([
                payload[at],
                payload[at + 1],
                payload[at + 2],
                payload[at + 3],
                payload[at + 4],
                payload[at + 5],
                payload[at + 6],
                payload[at + 7],
            ])
        };
        let cleaning = read_u64(20);
        Ok(Self {
            log_id: read_u64(0),
            segment_id: read_u64(8),
            capacity: u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]),
            head_segment_id_during_cleaning: if cleaning == INVALID_SEGMENT_ID {
                None
            } else {
                Some(cleaning)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = SegmentHeader::new(0x1_0000_0063, 88, 65536);
        assert_eq!(SegmentHeader::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn cleaning_id_roundtrips_when_set() {
        let mut header = SegmentHeader::new(9, 10, 128);
        header.head_segment_id_during_cleaning = Some(7);
        assert_eq!(
            SegmentHeader::decode(&header.encode())
                .unwrap()
                .head_segment_id_during_cleaning,
            Some(7)
        );
    }

    #[test]
    fn truncated_payload_rejected() {
        let err = SegmentHeader::decode(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, SegmentError::HeaderInvalid { .. }));
    }
}
