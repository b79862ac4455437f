//! Entry framing and iteration.

use super::{Certificate, SegmentError, SegmentResult};

pub(crate) const ENTRY_HEADER_LEN: usize = 5;

/// Entry kinds understood by the backup.
///
/// The recovery filter only interprets `Object` and `ObjectTombstone`;
/// everything else is carried opaquely by iteration and dropped from
/// partition outputs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    SegHeader = 1,
    Object = 2,
    ObjectTombstone = 3,
    LogDigest = 4,
}

impl EntryType {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EntryType::SegHeader),
            2 => Some(EntryType::Object),
            3 => Some(EntryType::ObjectTombstone),
            4 => Some(EntryType::LogDigest),
            _ => None,
        }
    }
}

/// One entry as laid out in a segment payload.
#[derive(Clone, Copy, Debug)]
pub struct Entry<'a> {
    /// Raw type byte; `kind()` is None for types this backup predates.
    pub type_raw: u8,
    /// Offset of the entry header within the segment, i.e. its log position.
    pub offset: u32,
    pub payload: &'a [u8],
}

impl<'a> Entry<'a> {
    pub fn kind(&self) -> Option<EntryType> {
        EntryType::from_u8(self.type_raw)
    }
}

/// Iterate the certified prefix of a replica payload.
///
/// The certificate is verified up front; after that any truncated header or
/// overrunning length is a framing error, not an end-of-iteration.
pub fn entries<'a>(payload: &'a [u8], certificate: &Certificate) -> SegmentResult<EntryIter<'a>> {
    let covered = certificate.verify(payload)?;
    Ok(EntryIter {
        bytes: covered,
        offset: 0,
        lenient: false,
    })
}

/// Iterate an open, as-yet-uncertified segment prefix.
///
/// Stops silently at the first invalid header or zero type byte (the
/// unwritten remainder of the frame buffer). Used only for best-effort
/// scans such as the log-digest lookup; recovery always goes through
/// [`entries`].
pub fn scan_entries(payload: &[u8], written_len: u32) -> EntryIter<'_> {
    let end = (written_len as usize).min(payload.len());
    EntryIter {
        bytes: &payload[..end],
        offset: 0,
        lenient: true,
    }
}

pub struct EntryIter<'a> {
    bytes: &'a [u8],
    offset: usize,
    lenient: bool,
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = SegmentResult<Entry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let remaining = &self.bytes[self.offset..];
        if remaining.len() < ENTRY_HEADER_LEN {
            let offset = self.offset as u32;
            self.offset = self.bytes.len();
            if self.lenient {
                return None;
            }
            return Some(Err(SegmentError::EntryHeaderTruncated { offset }));
        }
        let type_raw = remaining[0];
        if type_raw == 0 && self.lenient {
            self.offset = self.bytes.len();
            return None;
        }
        let len = u32::from_le_bytes([remaining[1], remaining[2], remaining[3], remaining[4]]);
        let body_end = ENTRY_HEADER_LEN + len as usize;
        if body_end > remaining.len() {
            let offset = self.offset as u32;
            self.offset = self.bytes.len();
            if self.lenient {
                return None;
            }
            return Some(Err(SegmentError::EntryOverrun {
                offset,
                len,
                limit: self.bytes.len() as u32,
            }));
        }
        let entry = Entry {
            type_raw,
            offset: self.offset as u32,
            payload: &remaining[ENTRY_HEADER_LEN..body_end],
        };
        self.offset += body_end;
        Some(Ok(entry))
    }
}

#[cfg(test)]
mod tests {
    use super::super::SegmentWriter;
    use super::*;

    fn two_entry_segment() -> (bytes::Bytes, Certificate) {
        let mut writer = SegmentWriter::new(1024);
        writer.append(EntryType::Object, b"first").unwrap();
        writer.append(EntryType::LogDigest, b"second!").unwrap();
        writer.finish()
    }

    #[test]
    fn iterates_certified_entries_in_order() {
        let (payload, certificate) = two_entry_segment();
        let got: Vec<_> = entries(&payload, &certificate)
            .unwrap()
            .collect::<SegmentResult<_>>()
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind(), Some(EntryType::Object));
        assert_eq!(got[0].payload, b"first");
        assert_eq!(got[0].offset, 0);
        assert_eq!(got[1].kind(), Some(EntryType::LogDigest));
        assert_eq!(got[1].offset, ENTRY_HEADER_LEN as u32 + 5);
    }

    #[test]
    fn verified_iteration_fails_on_overrun() {
        let mut payload = vec![2u8, 200, 0, 0, 0];
        payload.extend_from_slice(b"short");
        let certificate = Certificate::compute(&payload);
        let mut iter = entries(&payload, &certificate).unwrap();
        let err = iter.next().unwrap().unwrap_err();
        assert!(matches!(err, SegmentError::EntryOverrun { .. }));
    }

    #[test]
    fn lenient_scan_stops_at_zero_fill() {
        let (payload, certificate) = two_entry_segment();
        let mut frame = payload.to_vec();
        frame.resize(frame.len() + 64, 0);
        let got: Vec<_> = scan_entries(&frame, frame.len() as u32)
            .collect::<SegmentResult<_>>()
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(certificate.segment_length, payload.len() as u32);
    }

    #[test]
    fn lenient_scan_stops_at_garbage_instead_of_failing() {
        let mut frame = vec![2u8, 200, 0, 0, 0];
        frame.extend_from_slice(b"short");
        let got: Vec<_> = scan_entries(&frame, frame.len() as u32)
            .collect::<SegmentResult<_>>()
            .unwrap();
        assert!(got.is_empty());
    }
}
