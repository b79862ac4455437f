//! In-memory segment composition.

use bytes::Bytes;

use super::entry::ENTRY_HEADER_LEN;
use super::{Certificate, EntryType, SegmentError, SegmentResult};

/// Appends typed entries into a bounded buffer and seals the result.
///
/// Two users: the recovery builder composing per-partition sub-segments,
/// and tests standing in for a master's log writer.
pub struct SegmentWriter {
    buf: Vec<u8>,
    capacity: u32,
}

impl SegmentWriter {
    pub fn new(capacity: u32) -> Self {
        Self {
            buf: Vec::new(),
            capacity,
        }
    }

    pub fn append(&mut self, kind: EntryType, payload: &[u8]) -> SegmentResult<()> {
        self.append_raw(kind as u8, payload)
    }

    /// Append preserving an unknown type byte (recovery copies entries it
    /// does not interpret).
    pub fn append_raw(&mut self, type_raw: u8, payload: &[u8]) -> SegmentResult<()> {
        let needed = ENTRY_HEADER_LEN + payload.len();
        if self.buf.len() + needed > self.capacity as usize {
            return Err(SegmentError::EntryTooLarge {
                needed,
                capacity: self.capacity,
            });
        }
        self.buf.push(type_raw);
        self.buf
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(payload);
        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.buf.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Certificate over everything appended so far.
    pub fn certificate(&self) -> Certificate {
        Certificate::compute(&self.buf)
    }

    pub fn finish(self) -> (Bytes, Certificate) {
        let certificate = Certificate::compute(&self.buf);
        (Bytes::from(self.buf), certificate)
    }
}

#[cfg(test)]
mod tests {
    use super::super::entries;
    use super::*;

    #[test]
    fn sealed_segment_verifies() {
        let mut writer = SegmentWriter::new(128);
        writer.append(EntryType::SegHeader, b"hdr").unwrap();
        let (payload, certificate) = writer.finish();
        let got: Vec<_> = entries(&payload, &certificate)
            .unwrap()
            .collect::<SegmentResult<_>>()
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn append_respects_capacity() {
        let mut writer = SegmentWriter::new(8);
        let err = writer.append(EntryType::Object, b"too big").unwrap_err();
        assert!(matches!(err, SegmentError::EntryTooLarge { .. }));
        assert!(writer.is_empty());
    }

    #[test]
    fn incremental_certificates_cover_prefixes() {
        let mut writer = SegmentWriter::new(128);
        writer.append(EntryType::Object, b"a").unwrap();
        let first = writer.certificate();
        writer.append(EntryType::Object, b"b").unwrap();
        let second = writer.certificate();
        assert!(first.segment_length < second.segment_length);
        first.verify(writer.as_bytes()).unwrap();
        second.verify(writer.as_bytes()).unwrap();
    }
}
