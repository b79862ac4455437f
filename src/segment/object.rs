//! Object and tombstone entry payloads.
//!
//! The backup only ever needs the key fields; values ride along opaquely.

use super::{SegmentError, SegmentResult};

/// A stored object: `table_id`, length-prefixed key, then the value bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord<'a> {
    pub table_id: u64,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> ObjectRecord<'a> {
    pub fn encode(table_id: u64, key: &[u8], value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(10 + key.len() + value.len());
        buf.extend_from_slice(&table_id.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    pub fn decode(payload: &'a [u8]) -> SegmentResult<Self> {
        let (table_id, key, value) = split_keyed(payload, "object")?;
        Ok(Self {
            table_id,
            key,
            value,
        })
    }
}

/// A tombstone for a deleted object; records which segment held the object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TombstoneRecord<'a> {
    pub table_id: u64,
    pub object_segment_id: u64,
    pub key: &'a [u8],
}

impl<'a> TombstoneRecord<'a> {
    pub fn encode(table_id: u64, object_segment_id: u64, key: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(18 + key.len());
        buf.extend_from_slice(&table_id.to_le_bytes());
        buf.extend_from_slice(&object_segment_id.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u16).to_le_bytes());
        buf.extend_from_slice(key);
        buf
    }

    pub fn decode(payload: &'a [u8]) -> SegmentResult<Self> {
        if payload.len() < 18 {
            return Err(SegmentError::HeaderInvalid {
                reason: "tombstone payload truncated".to_string(),
            });
        }
        let table_id = u64::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
            payload[7],
        ]);
        let object_segment_id = u64::from_le_bytes([
            payload[8], payload[9], payload[10], payload[11], payload[12], payload[13],
            payload[14], payload[15],
        ]);
        let key_len = u16::from_le_bytes([payload[16], payload[17]]) as usize;
        let rest = &payload[18..];
        if key_len > rest.len() {
            return Err(SegmentError::HeaderInvalid {
                reason: format!("tombstone key length {key_len} exceeds payload"),
            });
        }
        Ok(Self {
            table_id,
            object_segment_id,
            key: &rest[..key_len],
        })
    }
}

fn split_keyed<'a>(payload: &'a [u8], what: &str) -> SegmentResult<(u64, &'a [u8], &'a [u8])> {
    if payload.len() < 10 {
        return Err(SegmentError::HeaderInvalid {
            reason: format!("{what} payload truncated"),
        });
    }
    let table_id = u64::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3], payload[4], payload[5], payload[6],
        payload[7],
    ]);
    let key_len = u16::from_le_bytes([payload[8], payload[9]]) as usize;
    let rest = &payload[10..];
    if key_len > rest.len() {
        return Err(SegmentError::HeaderInvalid {
            reason: format!("{what} key length {key_len} exceeds payload"),
        });
    }
    Ok((table_id, &rest[..key_len], &rest[key_len..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_roundtrip() {
        let bytes = ObjectRecord::encode(123, b"29", b"test1");
        let record = ObjectRecord::decode(&bytes).unwrap();
        assert_eq!(record.table_id, 123);
        assert_eq!(record.key, b"29");
        assert_eq!(record.value, b"test1");
    }

    #[test]
    fn tombstone_roundtrip() {
        let bytes = TombstoneRecord::encode(124, 88, b"20");
        let record = TombstoneRecord::decode(&bytes).unwrap();
        assert_eq!(record.table_id, 124);
        assert_eq!(record.object_segment_id, 88);
        assert_eq!(record.key, b"20");
    }

    #[test]
    fn oversized_key_length_rejected() {
        let mut bytes = ObjectRecord::encode(1, b"k", b"");
        bytes[8] = 0xff;
        assert!(ObjectRecord::decode(&bytes).is_err());
    }
}
