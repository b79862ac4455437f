//! Replica lifecycle and per-replica concurrency envelope.
//!
//! A replica moves through open → closed → recovering → freed; every public
//! method serializes on the replica's own mutex, never on the index lock.
//! Storage calls (`append`, `load`) may block while that mutex is held.

use std::sync::{Condvar, Mutex, MutexGuard};

use bytes::Bytes;

use crate::core::{Partitions, SegmentId, ServerId};
use crate::error::{BackupError, BackupResult};
use crate::recovery::{build_recovery_segments, RecoverySegment};
use crate::segment::{scan_for_digest, Certificate};
use crate::storage::{Frame, ReplicaMetadata};

/// Lifecycle snapshot, for logging and assertions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaStatus {
    Uninit,
    Open,
    Closed,
    Recovering,
    Freed,
}

struct OpenState {
    rightmost_written_offset: u32,
    /// False for replicas revived from storage at restart: they are
    /// readable for recovery but reject opens, appends, and closes.
    writable: bool,
}

struct RecoveringState {
    /// Length observed when a still-open replica entered recovery; None for
    /// replicas sealed by a close (or revived with unknown length). This is
    /// what recovery listings and digest scans report, so repeated
    /// start-reading calls stay stable.
    open_len: Option<u32>,
    /// Partitioning stashed for a deferred build.
    partitions: Option<Partitions>,
    segments: Option<Vec<RecoverySegment>>,
    failed: Option<String>,
}

enum State {
    Uninit,
    Open(OpenState),
    Closed,
    Recovering(RecoveringState),
    Freed,
}

struct Inner {
    state: State,
    frame: Option<Frame>,
}

pub struct Replica {
    pub master: ServerId,
    pub segment_id: SegmentId,
    /// True for the master's primary copy: recovery segments are built
    /// eagerly at recovery start instead of on first demand.
    pub primary: bool,
    segment_size: u32,
    created_by_current_process: bool,
    inner: Mutex<Inner>,
    build_done: Condvar,
}

impl Replica {
    /// A replica a master is about to populate. No frame yet.
    pub fn new(master: ServerId, segment_id: SegmentId, segment_size: u32, primary: bool) -> Self {
        Self {
            master,
            segment_id,
            primary,
            segment_size,
            created_by_current_process: true,
            inner: Mutex::new(Inner {
                state: State::Uninit,
                frame: None,
            }),
            build_done: Condvar::new(),
        }
    }

    /// A replica revived from a storage frame during restart inventory.
    /// Read-only until recovered or freed.
    pub fn from_storage(
        master: ServerId,
        segment_id: SegmentId,
        segment_size: u32,
        frame: Frame,
        closed: bool,
    ) -> Self {
        let state = if closed {
            State::Closed
        } else {
            State::Open(OpenState {
                rightmost_written_offset: 0,
                writable: false,
            })
        };
        Self {
            master,
            segment_id,
            primary: false,
            segment_size,
            created_by_current_process: false,
            inner: Mutex::new(Inner {
                state,
                frame: Some(frame),
            }),
            build_done: Condvar::new(),
        }
    }

    pub fn created_by_current_process(&self) -> bool {
        self.created_by_current_process
    }

    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    /// Bind a freshly allocated frame and become writable.
    pub fn open(&self, frame: Frame) {
        let mut inner = self.lock();
        debug_assert!(matches!(inner.state, State::Uninit));
        inner.frame = Some(frame);
        inner.state = State::Open(OpenState {
            rightmost_written_offset: 0,
            writable: true,
        });
    }

    /// Apply one write RPC: optional data at `offset`, optional certificate,
    /// optional close. Legality per state; see the service facade for the
    /// open/replay handling that precedes this.
    pub fn write(
        &self,
        data: &[u8],
        offset: u32,
        certificate: Option<&Certificate>,
        close: bool,
    ) -> BackupResult<()> {
        let mut inner = self.lock();
        let writable = matches!(&inner.state, State::Open(open) if open.writable);
        if !writable {
            // A replayed closing write with no data is accepted silently.
            if matches!(inner.state, State::Closed) && close && data.is_empty() {
                return Ok(());
            }
            return Err(BackupError::bad_segment_id(self.master, self.segment_id));
        }

        let end = u64::from(offset) + data.len() as u64;
        if end > u64::from(self.segment_size) {
            return Err(BackupError::SegmentOverflow {
                master: self.master,
                segment_id: self.segment_id,
                offset,
                length: data.len() as u32,
                segment_size: self.segment_size,
            });
        }
        if !data.is_empty() || certificate.is_some() {
            let metadata = self.metadata_for(&inner, certificate, false)?;
            let frame = inner
                .frame
                .as_ref()
                .ok_or_else(|| BackupError::bad_segment_id(self.master, self.segment_id))?;
            frame.append(data, offset, &metadata.encode())?;
            if let State::Open(open) = &mut inner.state {
                open.rightmost_written_offset = open.rightmost_written_offset.max(end as u32);
            }
        }
        if close {
            self.do_close(&mut inner)?;
        }
        Ok(())
    }

    fn do_close(&self, inner: &mut MutexGuard<'_, Inner>) -> BackupResult<()> {
        let metadata = self.metadata_for(inner, None, true)?;
        let frame = inner
            .frame
            .as_ref()
            .ok_or_else(|| BackupError::bad_segment_id(self.master, self.segment_id))?;
        frame.append(&[], 0, &metadata.encode())?;
        frame.release_buffer();
        inner.state = State::Closed;
        Ok(())
    }

    fn metadata_for(
        &self,
        inner: &Inner,
        certificate: Option<&Certificate>,
        closed: bool,
    ) -> BackupResult<ReplicaMetadata> {
        let certificate = match certificate {
            Some(c) => *c,
            None => self.stored_certificate(inner)?,
        };
        Ok(ReplicaMetadata::new(
            certificate,
            self.master.as_u64(),
            self.segment_id.get(),
            self.segment_size,
            closed,
        ))
    }

    fn stored_certificate(&self, inner: &Inner) -> BackupResult<Certificate> {
        let Some(frame) = inner.frame.as_ref() else {
            return Ok(Certificate::default());
        };
        Ok(frame
            .metadata()?
            .map(|m| m.certificate)
            .unwrap_or_default())
    }

    /// Move into RECOVERING. `partitions` is stashed for a deferred build;
    /// eager (primary) builds pass None and are scheduled by the caller.
    /// Returns false without effect if the replica is already recovering or
    /// in a state recovery cannot start from.
    pub fn set_recovering(&self, partitions: Option<Partitions>) -> bool {
        let mut inner = self.lock();
        let open_len = match &inner.state {
            State::Open(open) => open.writable.then_some(open.rightmost_written_offset),
            State::Closed => None,
            _ => return false,
        };
        inner.state = State::Recovering(RecoveringState {
            open_len,
            partitions,
            segments: None,
            failed: None,
        });
        true
    }

    /// Free in any state; discards buffered content and built segments and
    /// wakes anything blocked on an in-flight build.
    pub fn free(&self) {
        let mut inner = self.lock();
        if let Some(frame) = inner.frame.take() {
            frame.free();
        }
        inner.state = State::Freed;
        drop(inner);
        self.build_done.notify_all();
    }

    /// Written length if the replica still counts as open for recovery
    /// reporting: open-and-writable, or recovering after being caught open.
    pub fn open_written_len(&self) -> Option<u32> {
        let inner = self.lock();
        match &inner.state {
            State::Open(open) if open.writable => Some(open.rightmost_written_offset),
            State::Recovering(rec) => rec.open_len,
            _ => None,
        }
    }

    pub fn status(&self) -> ReplicaStatus {
        match self.lock().state {
            State::Uninit => ReplicaStatus::Uninit,
            State::Open(_) => ReplicaStatus::Open,
            State::Closed => ReplicaStatus::Closed,
            State::Recovering(_) => ReplicaStatus::Recovering,
            State::Freed => ReplicaStatus::Freed,
        }
    }

    /// Whether a deferred build is still pending its first demand.
    pub fn has_deferred_build(&self) -> bool {
        matches!(
            &self.lock().state,
            State::Recovering(rec) if rec.partitions.is_some()
        )
    }

    pub fn frame_index(&self) -> Option<usize> {
        self.lock().frame.as_ref().map(|f| f.index())
    }

    /// Full frame payload. Test and digest-scan access path.
    pub fn payload(&self) -> BackupResult<Bytes> {
        let inner = self.lock();
        let frame = inner
            .frame
            .as_ref()
            .ok_or_else(|| BackupError::bad_segment_id(self.master, self.segment_id))?;
        Ok(frame.load()?)
    }

    /// Scan an open replica for its log digest. None for sealed replicas,
    /// empty replicas, and replicas without a digest entry.
    pub fn log_digest(&self) -> BackupResult<Option<(Bytes, u32)>> {
        let inner = self.lock();
        let len = match &inner.state {
            State::Open(open) if open.writable => open.rightmost_written_offset,
            State::Recovering(rec) => match rec.open_len {
                Some(len) => len,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        if len == 0 {
            return Ok(None);
        }
        let frame = inner
            .frame
            .as_ref()
            .ok_or_else(|| BackupError::bad_segment_id(self.master, self.segment_id))?;
        let payload = frame.load()?;
        Ok(scan_for_digest(&payload, len).map(|digest| (digest, len)))
    }

    /// Snapshot the payload and stored certificate for a recovery build.
    /// Fails unless the replica is still RECOVERING.
    pub fn load_for_build(&self) -> BackupResult<(Bytes, Certificate)> {
        let inner = self.lock();
        if !matches!(inner.state, State::Recovering(_)) {
            return Err(BackupError::bad_segment_id(self.master, self.segment_id));
        }
        let frame = inner
            .frame
            .as_ref()
            .ok_or_else(|| BackupError::bad_segment_id(self.master, self.segment_id))?;
        let payload = frame.load()?;
        let certificate = frame
            .metadata()?
            .map(|m| m.certificate)
            .unwrap_or_default();
        Ok((payload, certificate))
    }

    /// Publish a completed build. Dropped (returns false) if the replica
    /// left RECOVERING, or a result was already published, while the build
    /// was in flight.
    pub fn publish_build(&self, result: Result<Vec<RecoverySegment>, String>) -> bool {
        let mut inner = self.lock();
        let published = match &mut inner.state {
            State::Recovering(rec) if rec.segments.is_none() && rec.failed.is_none() => {
                match result {
                    Ok(segments) => rec.segments = Some(segments),
                    Err(reason) => rec.failed = Some(reason),
                }
                true
            }
            _ => false,
        };
        drop(inner);
        self.build_done.notify_all();
        published
    }

    /// Copy out one built sub-segment and its certificate.
    ///
    /// Runs a stashed deferred build on first demand; waits out an eager
    /// build still in flight.
    pub fn append_recovery_segment(
        &self,
        partition_id: usize,
    ) -> BackupResult<(Bytes, Certificate)> {
        let mut inner = self.lock();
        loop {
            let Inner { state, frame } = &mut *inner;
            let State::Recovering(rec) = state else {
                return Err(BackupError::bad_segment_id(self.master, self.segment_id));
            };
            if let Some(reason) = &rec.failed {
                return Err(BackupError::SegmentRecoveryFailed {
                    master: self.master,
                    segment_id: self.segment_id,
                    reason: reason.clone(),
                });
            }
            if let Some(segments) = &rec.segments {
                let segment = segments.get(partition_id).ok_or_else(|| {
                    BackupError::bad_segment_id(self.master, self.segment_id)
                })?;
                return Ok((segment.bytes().clone(), segment.certificate()));
            }
            if let Some(partitions) = rec.partitions.take() {
                let loaded = frame
                    .as_ref()
                    .ok_or_else(|| BackupError::bad_segment_id(self.master, self.segment_id))
                    .and_then(|frame| {
                        let payload = frame.load()?;
                        let certificate = frame
                            .metadata()?
                            .map(|m| m.certificate)
                            .unwrap_or_default();
                        Ok((payload, certificate))
                    });
                let (payload, certificate) = match loaded {
                    Ok(loaded) => loaded,
                    Err(err) => {
                        // Storage hiccup, not malformed framing: keep the
                        // stashed partitioning so a retry can build.
                        rec.partitions = Some(partitions);
                        return Err(err);
                    }
                };
                match build_recovery_segments(
                    &payload,
                    &certificate,
                    &partitions,
                    self.segment_size,
                ) {
                    Ok(segments) => rec.segments = Some(segments),
                    Err(err) => rec.failed = Some(err.to_string()),
                }
                continue;
            }
            // Eager build in flight on a worker; wait for it to publish.
            inner = self
                .build_done
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("master", &self.master)
            .field("segment_id", &self.segment_id)
            .field("primary", &self.primary)
            .field("status", &self.status())
            .finish()
    }
}
