//! Log digests: the set of segment ids making up a master's live log.

use bytes::Bytes;

use super::entry::{scan_entries, EntryType};
use super::{SegmentError, SegmentResult};

/// Ordered list of segment ids a master declared live when it wrote the
/// digest. Recovery uses the newest digest it can find on any backup to
/// learn the shape of the lost log.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogDigest {
    segment_ids: Vec<u64>,
}

impl LogDigest {
    pub fn new(segment_ids: Vec<u64>) -> Self {
        Self { segment_ids }
    }

    pub fn segment_ids(&self) -> &[u64] {
        &self.segment_ids
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.segment_ids.len() * 8);
        buf.extend_from_slice(&(self.segment_ids.len() as u32).to_le_bytes());
        for id in &self.segment_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> SegmentResult<Self> {
        if payload.len() < 4 {
            return Err(SegmentError::DigestInvalid {
                reason: "digest payload truncated".to_string(),
            });
        }
        let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
        let rest = &payload[4..];
        if rest.len() != count * 8 {
            return Err(SegmentError::DigestInvalid {
                reason: format!("{count} ids declared, {} payload bytes", rest.len()),
            });
        }
        let segment_ids = rest
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        Ok(Self { segment_ids })
    }
}

/// Best-effort scan of an open replica payload for its digest entry.
///
/// Returns the payload bytes of the last digest found within the written
/// prefix, or None. Framing problems end the scan rather than failing it:
/// an open segment carries no certificate yet.
pub fn scan_for_digest(payload: &[u8], written_len: u32) -> Option<Bytes> {
    let mut found = None;
    for entry in scan_entries(payload, written_len) {
        let Ok(entry) = entry else { break };
        if entry.kind() == Some(EntryType::LogDigest) {
            found = Some(Bytes::copy_from_slice(entry.payload));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::super::SegmentWriter;
    use super::*;

    #[test]
    fn digest_roundtrip() {
        let digest = LogDigest::new(vec![0x3f17c2451f0caf, 88, 89]);
        assert_eq!(LogDigest::decode(&digest.encode()).unwrap(), digest);
    }

    #[test]
    fn decode_rejects_count_mismatch() {
        let mut bytes = LogDigest::new(vec![1, 2]).encode();
        bytes.truncate(bytes.len() - 8);
        assert!(LogDigest::decode(&bytes).is_err());
    }

    #[test]
    fn scan_finds_digest_among_other_entries() {
        let digest = LogDigest::new(vec![42]);
        let mut writer = SegmentWriter::new(1024);
        writer.append(EntryType::Object, b"payload").unwrap();
        writer.append(EntryType::LogDigest, &digest.encode()).unwrap();
        let (bytes, certificate) = writer.finish();

        let mut frame = bytes.to_vec();
        frame.resize(1024, 0);
        let found = scan_for_digest(&frame, certificate.segment_length).unwrap();
        assert_eq!(LogDigest::decode(&found).unwrap(), digest);
    }

    #[test]
    fn scan_returns_none_without_digest() {
        let mut writer = SegmentWriter::new(256);
        writer.append(EntryType::Object, b"x").unwrap();
        let (bytes, certificate) = writer.finish();
        assert!(scan_for_digest(&bytes, certificate.segment_length).is_none());
    }
}
