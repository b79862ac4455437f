//! The backup service facade: RPC verbs over replicas, storage, recovery,
//! and GC.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::{info, warn};

use crate::config::BackupConfig;
use crate::core::{Partitions, ReplicationGroup, SegmentId, ServerId};
use crate::error::{BackupError, BackupResult};
use crate::gc::{
    DownServerGcTask, FoundOnStorageGcTask, MasterClient, ServerTracker, TaskQueue, TrackerEvent,
};
use crate::index::ReplicaIndex;
use crate::recovery::RecoverySegmentBuilder;
use crate::replica::{Replica, ReplicaStatus};
use crate::segment::Certificate;
use crate::storage::{FrameStore, StorageError, StorageStartup};

/// Flags carried by a write RPC.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteFlags {
    pub open: bool,
    pub primary: bool,
    pub close: bool,
}

impl WriteFlags {
    pub const NONE: Self = Self {
        open: false,
        primary: false,
        close: false,
    };
    pub const OPEN: Self = Self {
        open: true,
        primary: false,
        close: false,
    };
    pub const OPEN_PRIMARY: Self = Self {
        open: true,
        primary: true,
        close: false,
    };
    pub const CLOSE: Self = Self {
        open: false,
        primary: false,
        close: true,
    };
}

#[derive(Debug)]
pub struct WriteRequest<'a> {
    pub master: ServerId,
    pub segment_id: SegmentId,
    pub offset: u32,
    pub data: &'a [u8],
    pub certificate: Option<Certificate>,
    pub flags: WriteFlags,
}

#[derive(Debug, Default)]
pub struct WriteResponse {
    /// The current replication group, returned on opens only.
    pub group: Option<ReplicationGroup>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogDigestResult {
    pub digest: Bytes,
    pub segment_id: SegmentId,
    pub segment_len: u32,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct StartReadingDataResult {
    /// `(segment id, length)` per replica of the master, ascending by id.
    /// Length is the written length for still-open replicas, 0 otherwise.
    pub segments: Vec<(SegmentId, u32)>,
    /// Digest from the open replica with the largest segment id holding one.
    pub log_digest: Option<LogDigestResult>,
}

pub struct BackupService {
    config: BackupConfig,
    storage: FrameStore,
    replicas: ReplicaIndex,
    replication_group: Mutex<ReplicationGroup>,
    gc_queue: Arc<TaskQueue>,
    gc_enabled: Arc<AtomicBool>,
    tracker: ServerTracker,
    master_client: Arc<dyn MasterClient>,
    recovery_thread_count: Arc<AtomicUsize>,
    former_server_id: Mutex<Option<ServerId>>,
}

impl BackupService {
    pub fn new(config: BackupConfig, master_client: Arc<dyn MasterClient>) -> BackupResult<Self> {
        config
            .validate()
            .map_err(|err| StorageError::HeaderInvalid {
                reason: err.to_string(),
            })?;

        let (storage, startup) = if config.in_memory {
            (
                FrameStore::in_memory(config.segment_size, config.num_segment_frames),
                None,
            )
        } else {
            let path = config.storage_path();
            let (storage, startup) = FrameStore::open_file(
                &path,
                &config.cluster_name,
                config.segment_size,
                config.num_segment_frames,
            )?;
            (storage, Some(startup))
        };

        match &startup {
            Some(StorageStartup::NoPersistence) => info!(
                cluster = %config.cluster_name,
                "unnamed cluster; ignoring existing backup storage, stored replicas will not \
                 be reusable by future backups"
            ),
            Some(StorageStartup::Fresh) => info!(
                cluster = %config.cluster_name,
                "storing replicas; future backups must restart with the same cluster name for \
                 them to be reused"
            ),
            Some(StorageStartup::Reusable) => info!(
                cluster = %config.cluster_name,
                "replicas stored on disk have a matching cluster name; scanning storage to \
                 make them available to recoveries"
            ),
            Some(StorageStartup::Scribbled { previous_cluster }) => warn!(
                cluster = %config.cluster_name,
                previous_cluster = %previous_cluster,
                "replicas stored on disk have a different cluster name; scribbling storage so \
                 stale replicas cannot be used by future backups"
            ),
            None => {}
        }

        let service = Self {
            gc_enabled: Arc::new(AtomicBool::new(config.gc)),
            config,
            storage,
            replicas: ReplicaIndex::new(),
            replication_group: Mutex::new(ReplicationGroup::default()),
            gc_queue: Arc::new(TaskQueue::new()),
            tracker: ServerTracker::new(),
            master_client,
            recovery_thread_count: Arc::new(AtomicUsize::new(0)),
            former_server_id: Mutex::new(None),
        };

        if matches!(startup, Some(StorageStartup::Reusable)) {
            service.restart_from_storage()?;
        }
        Ok(service)
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn storage(&self) -> &FrameStore {
        &self.storage
    }

    /// Identity of the crashed server this backup should enlist as a
    /// replacement for, if restart inventory found its closed replicas.
    pub fn former_server_id(&self) -> Option<ServerId> {
        *self.lock_mutex(&self.former_server_id)
    }

    pub fn find_replica(&self, master: ServerId, segment_id: SegmentId) -> Option<Arc<Replica>> {
        self.replicas.get(master, segment_id)
    }

    /// Builders currently running across the process.
    pub fn recovery_builders_active(&self) -> usize {
        self.recovery_thread_count.load(Ordering::SeqCst)
    }

    /// Store bytes for (and/or open, and/or close) one replica.
    pub fn write_segment(&self, request: WriteRequest<'_>) -> BackupResult<WriteResponse> {
        let WriteRequest {
            master,
            segment_id,
            offset,
            data,
            certificate,
            flags,
        } = request;

        let mut group = None;
        let replica = match self.replicas.get(master, segment_id) {
            Some(replica) => {
                if flags.open {
                    if !replica.created_by_current_process() {
                        return Err(BackupError::OpenRejected {
                            master,
                            segment_id,
                            reason: "replica was recovered from storage and cannot be reopened"
                                .to_string(),
                        });
                    }
                    // Replayed open: answer with the group, change nothing.
                    group = Some(self.lock_mutex(&self.replication_group).clone());
                }
                replica
            }
            None => {
                if !flags.open {
                    return Err(BackupError::bad_segment_id(master, segment_id));
                }
                let frame = self
                    .storage
                    .open(self.config.sync_writes)
                    .map_err(|err| match err {
                        StorageError::OutOfStorage { .. } => BackupError::OpenRejected {
                            master,
                            segment_id,
                            reason: err.to_string(),
                        },
                        other => BackupError::Storage(other),
                    })?;
                let replica = Arc::new(Replica::new(
                    master,
                    segment_id,
                    self.config.segment_size,
                    flags.primary,
                ));
                replica.open(frame);
                info!(
                    %master,
                    %segment_id,
                    primary = flags.primary,
                    "opened replica"
                );
                self.replicas.insert(Arc::clone(&replica));
                group = Some(self.lock_mutex(&self.replication_group).clone());
                replica
            }
        };

        replica.write(data, offset, certificate.as_ref(), flags.close)?;
        Ok(WriteResponse { group })
    }

    /// Drop a replica and reclaim its frame. Idempotent.
    pub fn free_segment(&self, master: ServerId, segment_id: SegmentId) -> BackupResult<()> {
        if let Some(replica) = self.replicas.remove(master, segment_id) {
            info!(%master, %segment_id, "freeing replica");
            replica.free();
        }
        Ok(())
    }

    /// Replace the replication group returned from open responses.
    pub fn assign_group(&self, group_id: u64, members: Vec<ServerId>) -> BackupResult<()> {
        let mut group = self.lock_mutex(&self.replication_group);
        *group = ReplicationGroup {
            id: group_id,
            members,
        };
        Ok(())
    }

    /// Flip every replica of `master` into recovery and report what this
    /// backup holds. Primary closed replicas start building eagerly on a
    /// worker; everything else stashes the partitioning for a deferred
    /// build. Idempotent: repeated calls return the same listing.
    pub fn start_reading_data(
        &self,
        master: ServerId,
        partitions: &Partitions,
    ) -> BackupResult<StartReadingDataResult> {
        let replicas = self.replicas.replicas_of(master);
        let mut eager = Vec::new();
        let mut result = StartReadingDataResult::default();

        for replica in &replicas {
            if replica.primary && replica.status() == ReplicaStatus::Closed {
                if replica.set_recovering(None) {
                    eager.push(Arc::clone(replica));
                }
            } else {
                replica.set_recovering(Some(partitions.clone()));
            }

            let reported = replica.open_written_len().unwrap_or(0);
            result.segments.push((replica.segment_id, reported));

            if let Some((digest, segment_len)) = replica.log_digest()? {
                let newer = result
                    .log_digest
                    .as_ref()
                    .is_none_or(|best| replica.segment_id > best.segment_id);
                if newer {
                    result.log_digest = Some(LogDigestResult {
                        digest,
                        segment_id: replica.segment_id,
                        segment_len,
                    });
                }
            }
        }

        info!(
            %master,
            segments = result.segments.len(),
            eager_builds = eager.len(),
            "start reading data"
        );

        if !eager.is_empty() {
            let builder = RecoverySegmentBuilder::new(
                eager,
                partitions.clone(),
                Arc::clone(&self.recovery_thread_count),
                self.config.segment_size,
            );
            let _ = std::thread::Builder::new()
                .name("recovery-builder".to_string())
                .spawn(move || builder.run())
                .map_err(|source| StorageError::Io { path: None, source })?;
        }
        Ok(result)
    }

    /// Fetch one partition's filtered sub-segment of one recovering replica.
    pub fn get_recovery_data(
        &self,
        master: ServerId,
        segment_id: SegmentId,
        partition_id: u64,
    ) -> BackupResult<(Bytes, Certificate)> {
        let replica = self
            .replicas
            .get(master, segment_id)
            .ok_or_else(|| BackupError::bad_segment_id(master, segment_id))?;
        replica.append_recovery_segment(partition_id as usize)
    }

    /// Walk the storage frames and revive every replica with an intact
    /// metadata trailer and the right capacity. Only called when the
    /// cluster-name fence allowed reuse.
    fn restart_from_storage(&self) -> BackupResult<()> {
        let mut per_master: BTreeMap<ServerId, Vec<SegmentId>> = BTreeMap::new();
        let mut former: Option<u64> = None;

        for index in 0..self.storage.frame_count() {
            let Some(metadata) = self.storage.load_metadata(index)? else {
                continue;
            };
            if metadata.segment_capacity != self.config.segment_size {
                warn!(
                    frame = index,
                    capacity = metadata.segment_capacity,
                    configured = self.config.segment_size,
                    "stored replica has a different segment size; leaving frame free"
                );
                continue;
            }
            let master = ServerId::from_u64(metadata.log_id);
            let segment_id = SegmentId::new(metadata.segment_id);
            let frame = self.storage.claim(index)?;
            info!(
                %master,
                %segment_id,
                frame = index,
                closed = metadata.closed,
                "found stored replica on backup storage"
            );
            let replica = Arc::new(Replica::from_storage(
                master,
                segment_id,
                self.config.segment_size,
                frame,
                metadata.closed,
            ));
            if let Some(previous) = self.replicas.insert(replica) {
                warn!(
                    %master,
                    %segment_id,
                    "duplicate stored replica; dropping the earlier frame"
                );
                previous.free();
            }
            if metadata.closed {
                former = Some(former.map_or(metadata.log_id, |f| f.max(metadata.log_id)));
            }
            per_master.entry(master).or_default().push(segment_id);
        }

        if let Some(log_id) = former {
            let former_id = ServerId::from_u64(log_id);
            info!(
                former = %former_id,
                "will enlist as a replacement for formerly crashed server which left \
                 replicas behind on disk"
            );
            *self.lock_mutex(&self.former_server_id) = Some(former_id);
        }

        for (master, segment_ids) in per_master {
            self.gc_queue.schedule(Box::new(FoundOnStorageGcTask::new(
                Arc::clone(&self.gc_enabled),
                self.replicas.clone(),
                self.tracker.clone(),
                Arc::clone(&self.master_client),
                master,
                segment_ids,
            )));
        }
        Ok(())
    }

    pub fn gc_queue(&self) -> &TaskQueue {
        &self.gc_queue
    }

    pub fn tracker(&self) -> &ServerTracker {
        &self.tracker
    }

    /// Drain pending tracker changes; a removed server gets a down-server
    /// GC task. Adds and crashes are observed but not acted on here.
    pub fn process_tracker_changes(&self) {
        for (server, event) in self.tracker.drain_changes() {
            if event == TrackerEvent::Removed {
                info!(%server, "server removed; scheduling replica garbage collection");
                self.gc_queue.schedule(Box::new(DownServerGcTask::new(
                    Arc::clone(&self.gc_enabled),
                    self.replicas.clone(),
                    server,
                )));
            }
        }
    }

    /// Spawn the dedicated GC drain thread. Tests step the queue manually
    /// instead.
    pub fn start_gc_thread(&self) -> std::io::Result<std::thread::JoinHandle<()>> {
        let queue = Arc::clone(&self.gc_queue);
        std::thread::Builder::new()
            .name("backup-gc".to_string())
            .spawn(move || queue.run_until_stopped())
    }

    fn lock_mutex<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for BackupService {
    fn drop(&mut self) {
        self.gc_queue.stop();
    }
}
