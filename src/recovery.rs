//! Recovery segment building: split stored segments by tablet partition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::{key_hash, LogPosition, Partitions, SegmentId, Tablet};
use crate::replica::Replica;
use crate::segment::{
    entries, Certificate, EntryType, ObjectRecord, SegmentError, SegmentHeader, SegmentWriter,
    TombstoneRecord,
};

/// One sealed per-partition sub-segment of a source replica.
#[derive(Clone, Debug)]
pub struct RecoverySegment {
    data: Bytes,
    certificate: Certificate,
}

impl RecoverySegment {
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn certificate(&self) -> Certificate {
        self.certificate
    }
}

#[derive(Debug, Error)]
pub enum RecoveryBuildError {
    #[error("segment framing invalid: {0}")]
    Framing(#[from] SegmentError),
    #[error("segment has no leading header entry")]
    MissingHeader,
    #[error("partition {partition_id} sub-segment overflowed {segment_size} bytes")]
    PartitionOverflow {
        partition_id: u64,
        segment_size: u32,
    },
}

/// Entries written before a tablet existed belong to a previous tablet at
/// the same place in the key space and must not be recovered into it.
/// Segments synthesized by the log cleaner logically date from the log head
/// position recorded in their header, not from their own entry offsets.
pub fn is_entry_alive(position: LogPosition, tablet: &Tablet, header: &SegmentHeader) -> bool {
    let effective = match header.head_segment_id_during_cleaning {
        Some(id) => LogPosition::new(SegmentId::new(id), 0),
        None => position,
    };
    effective >= tablet.ctime()
}

/// Split one verified replica payload into per-partition sub-segments.
///
/// Output `i` holds, in source order, every object and tombstone entry whose
/// key the partitioning assigns to partition `i` and which is live with
/// respect to its tablet's creation time. Header and digest entries never
/// appear in outputs.
pub fn build_recovery_segments(
    payload: &[u8],
    certificate: &Certificate,
    partitions: &Partitions,
    segment_size: u32,
) -> Result<Vec<RecoverySegment>, RecoveryBuildError> {
    let mut iter = entries(payload, certificate)?;
    let header = match iter.next() {
        Some(first) => {
            let first = first?;
            if first.kind() != Some(EntryType::SegHeader) {
                return Err(RecoveryBuildError::MissingHeader);
            }
            SegmentHeader::decode(first.payload)?
        }
        None => return Err(RecoveryBuildError::MissingHeader),
    };

    let mut writers: Vec<SegmentWriter> = (0..partitions.partition_count())
        .map(|_| SegmentWriter::new(segment_size))
        .collect();

    for entry in iter {
        let entry = entry?;
        let (table_id, key) = match entry.kind() {
            Some(EntryType::Object) => {
                let object = ObjectRecord::decode(entry.payload)?;
                (object.table_id, object.key)
            }
            Some(EntryType::ObjectTombstone) => {
                let tombstone = TombstoneRecord::decode(entry.payload)?;
                (tombstone.table_id, tombstone.key)
            }
            // Headers, digests, and entry kinds this backup does not
            // interpret never land in partition outputs.
            _ => continue,
        };

        let hash = key_hash(table_id, key);
        let Some(tablet) = partitions.which_partition(table_id, hash) else {
            continue;
        };
        let position = LogPosition::new(SegmentId::new(header.segment_id), entry.offset);
        if !is_entry_alive(position, tablet, &header) {
            debug!(
                table_id,
                partition_id = tablet.partition_id,
                offset = entry.offset,
                "dropping entry older than tablet creation point"
            );
            continue;
        }
        writers[tablet.partition_id as usize]
            .append_raw(entry.type_raw, entry.payload)
            .map_err(|_| RecoveryBuildError::PartitionOverflow {
                partition_id: tablet.partition_id,
                segment_size,
            })?;
    }

    Ok(writers
        .into_iter()
        .map(|writer| {
            let (data, certificate) = writer.finish();
            RecoverySegment { data, certificate }
        })
        .collect())
}

/// Builds recovery segments for a batch of RECOVERING replicas on a worker
/// thread. The shared gauge counts builders running across the process.
pub struct RecoverySegmentBuilder {
    replicas: Vec<Arc<Replica>>,
    partitions: Partitions,
    recovery_thread_count: Arc<AtomicUsize>,
    segment_size: u32,
}

impl RecoverySegmentBuilder {
    pub fn new(
        replicas: Vec<Arc<Replica>>,
        partitions: Partitions,
        recovery_thread_count: Arc<AtomicUsize>,
        segment_size: u32,
    ) -> Self {
        recovery_thread_count.fetch_add(1, Ordering::SeqCst);
        Self {
            replicas,
            partitions,
            recovery_thread_count,
            segment_size,
        }
    }

    pub fn run(self) {
        for replica in &self.replicas {
            self.build_one(replica);
        }
    }

    fn build_one(&self, replica: &Replica) {
        let loaded = match replica.load_for_build() {
            Ok(loaded) => loaded,
            Err(err) => {
                // Freed mid-recovery, or storage gave out; nothing to build.
                debug!(
                    master = %replica.master,
                    segment_id = %replica.segment_id,
                    %err,
                    "abandoning recovery build"
                );
                return;
            }
        };
        let (payload, certificate) = loaded;
        let result = build_recovery_segments(
            &payload,
            &certificate,
            &self.partitions,
            self.segment_size,
        );
        match &result {
            Ok(segments) => debug!(
                master = %replica.master,
                segment_id = %replica.segment_id,
                partitions = segments.len(),
                "recovery segments built"
            ),
            Err(err) => warn!(
                master = %replica.master,
                segment_id = %replica.segment_id,
                %err,
                "recovery segment build failed"
            ),
        }
        let published = replica.publish_build(result.map_err(|e| e.to_string()));
        if !published {
            debug!(
                master = %replica.master,
                segment_id = %replica.segment_id,
                "replica left recovery while building; results dropped"
            );
        }
    }
}

impl Drop for RecoverySegmentBuilder {
    fn drop(&mut self) {
        self.recovery_thread_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ServerId;
    use crate::replica::ReplicaStatus;
    use crate::segment::LogDigest;
    use crate::storage::FrameStore;

    const SEGMENT_SIZE: u32 = 4096;

    fn tablet(partition_id: u64, table_id: u64, hash: u64) -> Tablet {
        Tablet {
            table_id,
            start_key_hash: hash,
            end_key_hash: hash,
            partition_id,
            ctime_head_segment_id: 0,
            ctime_head_offset: 0,
        }
    }

    /// Mirrors the canonical recovery partitioning: partition 0 holds table
    /// 123 keys "9", "10", "29" and table 124 key "20"; partition 1 holds
    /// table 123 key "30" and all of table 125.
    fn tablet_list() -> Partitions {
        Partitions::new(vec![
            tablet(0, 123, key_hash(123, b"9")),
            tablet(0, 123, key_hash(123, b"10")),
            tablet(0, 123, key_hash(123, b"29")),
            tablet(0, 124, key_hash(124, b"20")),
            tablet(1, 123, key_hash(123, b"30")),
            Tablet {
                table_id: 125,
                start_key_hash: 0,
                end_key_hash: u64::MAX,
                partition_id: 1,
                ctime_head_segment_id: 0,
                ctime_head_offset: 0,
            },
        ])
    }

    fn segment_with(
        segment_id: u64,
        objects: &[(u64, &[u8], &[u8])],
    ) -> (Bytes, Certificate) {
        let mut writer = SegmentWriter::new(SEGMENT_SIZE);
        writer
            .append(
                EntryType::SegHeader,
                &SegmentHeader::new(99, segment_id, SEGMENT_SIZE).encode(),
            )
            .unwrap();
        for (table_id, key, value) in objects {
            writer
                .append(EntryType::Object, &ObjectRecord::encode(*table_id, key, value))
                .unwrap();
        }
        writer.finish()
    }

    fn partition_keys(segment: &RecoverySegment) -> Vec<Vec<u8>> {
        entries(segment.bytes(), &segment.certificate())
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                ObjectRecord::decode(entry.payload).unwrap().key.to_vec()
            })
            .collect()
    }

    #[test]
    fn entries_route_to_their_single_partition() {
        let (payload, certificate) = segment_with(
            88,
            &[
                (123, b"9", b"a"),
                (123, b"10", b"b"),
                (123, b"29", b"c"),
                (123, b"30", b"d"),
                (125, b"20", b"e"),
                // Not covered by any tablet: dropped.
                (7, b"20", b"f"),
            ],
        );
        let segments =
            build_recovery_segments(&payload, &certificate, &tablet_list(), SEGMENT_SIZE).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(
            partition_keys(&segments[0]),
            vec![b"9".to_vec(), b"10".to_vec(), b"29".to_vec()]
        );
        assert_eq!(
            partition_keys(&segments[1]),
            vec![b"30".to_vec(), b"20".to_vec()]
        );
    }

    #[test]
    fn tombstones_are_partitioned_like_objects() {
        let mut writer = SegmentWriter::new(SEGMENT_SIZE);
        writer
            .append(
                EntryType::SegHeader,
                &SegmentHeader::new(99, 88, SEGMENT_SIZE).encode(),
            )
            .unwrap();
        writer
            .append(
                EntryType::ObjectTombstone,
                &TombstoneRecord::encode(123, 70, b"29"),
            )
            .unwrap();
        writer
            .append(
                EntryType::LogDigest,
                &LogDigest::new(vec![88]).encode(),
            )
            .unwrap();
        let (payload, certificate) = writer.finish();

        let segments =
            build_recovery_segments(&payload, &certificate, &tablet_list(), SEGMENT_SIZE).unwrap();
        let kept: Vec<_> = entries(segments[0].bytes(), &segments[0].certificate())
            .unwrap()
            .map(|e| e.unwrap().kind())
            .collect();
        // The digest entry never reaches a partition output.
        assert_eq!(kept, vec![Some(EntryType::ObjectTombstone)]);
        assert!(entries(segments[1].bytes(), &segments[1].certificate())
            .unwrap()
            .next()
            .is_none());
    }

    #[test]
    fn entries_before_tablet_ctime_are_dropped() {
        let hash = key_hash(123, b"9");
        let late_tablet = Tablet {
            table_id: 123,
            start_key_hash: hash,
            end_key_hash: hash,
            partition_id: 0,
            ctime_head_segment_id: 90,
            ctime_head_offset: 0,
        };
        let (payload, certificate) = segment_with(88, &[(123, b"9", b"old")]);
        let segments = build_recovery_segments(
            &payload,
            &certificate,
            &Partitions::new(vec![late_tablet]),
            SEGMENT_SIZE,
        )
        .unwrap();
        assert!(partition_keys(&segments[0]).is_empty());
    }

    #[test]
    fn cleaned_segments_use_the_cleaning_position() {
        let hash = key_hash(123, b"9");
        let tablet = Tablet {
            table_id: 123,
            start_key_hash: hash,
            end_key_hash: hash,
            partition_id: 0,
            ctime_head_segment_id: 90,
            ctime_head_offset: 16,
        };
        let mut header = SegmentHeader::new(99, 88, SEGMENT_SIZE);
        header.head_segment_id_during_cleaning = Some(91);
        let mut writer = SegmentWriter::new(SEGMENT_SIZE);
        writer
            .append(EntryType::SegHeader, &header.encode())
            .unwrap();
        writer
            .append(EntryType::Object, &ObjectRecord::encode(123, b"9", b"kept"))
            .unwrap();
        let (payload, certificate) = writer.finish();
        let segments = build_recovery_segments(
            &payload,
            &certificate,
            &Partitions::new(vec![tablet]),
            SEGMENT_SIZE,
        )
        .unwrap();
        // Segment 88 predates the cutoff, but it was written by the cleaner
        // at head segment 91, so its entries survive.
        assert_eq!(partition_keys(&segments[0]), vec![b"9".to_vec()]);
    }

    #[test]
    fn missing_header_is_a_build_error() {
        let (payload, certificate) = SegmentWriter::new(SEGMENT_SIZE).finish();
        let err = build_recovery_segments(&payload, &certificate, &tablet_list(), SEGMENT_SIZE)
            .unwrap_err();
        assert!(matches!(err, RecoveryBuildError::MissingHeader));
    }

    #[test]
    fn corrupt_certificate_is_a_build_error() {
        let (payload, _) = segment_with(88, &[(123, b"9", b"a")]);
        let bogus = Certificate {
            segment_length: payload.len() as u32,
            checksum: 0,
        };
        let err =
            build_recovery_segments(&payload, &bogus, &tablet_list(), SEGMENT_SIZE).unwrap_err();
        assert!(matches!(err, RecoveryBuildError::Framing(_)));
    }

    #[test]
    fn builder_publishes_per_replica_and_releases_gauge() {
        let store = FrameStore::in_memory(SEGMENT_SIZE, 2);
        let gauge = Arc::new(AtomicUsize::new(0));
        let mut replicas = Vec::new();
        for (segment_id, key) in [(87u64, b"9" as &[u8]), (88, b"30")] {
            let replica = Arc::new(Replica::new(
                ServerId::new(99, 0),
                SegmentId::new(segment_id),
                SEGMENT_SIZE,
                true,
            ));
            replica.open(store.open(false).unwrap());
            let (payload, certificate) = segment_with(segment_id, &[(123, key, b"val")]);
            replica
                .write(&payload, 0, Some(&certificate), true)
                .unwrap();
            replica.set_recovering(None);
            replicas.push(replica);
        }

        let builder = RecoverySegmentBuilder::new(
            replicas.clone(),
            tablet_list(),
            Arc::clone(&gauge),
            SEGMENT_SIZE,
        );
        assert_eq!(gauge.load(Ordering::SeqCst), 1);
        builder.run();
        assert_eq!(gauge.load(Ordering::SeqCst), 0);

        assert_eq!(replicas[0].status(), ReplicaStatus::Recovering);
        let (bytes, certificate) = replicas[0].append_recovery_segment(0).unwrap();
        let segment = RecoverySegment {
            data: bytes,
            certificate,
        };
        assert_eq!(partition_keys(&segment), vec![b"9".to_vec()]);
        let (bytes, certificate) = replicas[1].append_recovery_segment(1).unwrap();
        let segment = RecoverySegment {
            data: bytes,
            certificate,
        };
        assert_eq!(partition_keys(&segment), vec![b"30".to_vec()]);
    }
}
