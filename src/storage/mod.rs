//! Storage frame layer: a fixed pool of replica-sized frames.
//!
//! One frame holds one replica payload plus a [`ReplicaMetadata`] trailer.
//! The pool lives in a single file, or in anonymous memory for tests and
//! for backups run without persistence. The free map is never persisted:
//! on-disk trailer integrity is the single source of truth at restart.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use crc32c::crc32c;
use thiserror::Error;

pub mod metadata;

pub use metadata::ReplicaMetadata;

/// Cluster name sentinel meaning "no persistence": existing storage is
/// ignored and nothing stored will be reusable after a restart.
pub const UNNAMED_CLUSTER: &str = "__unnamed__";

const STORE_MAGIC: u32 = 0x4c56_424b; // "LVBK"
const STORE_VERSION: u32 = 1;
const HEADER_BLOCK_LEN: u64 = 4096;
const MAX_CLUSTER_NAME_LEN: usize = 1024;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("out of storage: all {frame_count} frames in use")]
    OutOfStorage { frame_count: usize },
    #[error("append of {len} bytes at offset {offset} exceeds frame payload of {segment_size}")]
    AppendBounds {
        offset: u32,
        len: usize,
        segment_size: u32,
    },
    #[error("frame {index} is not allocated")]
    FrameNotAllocated { index: usize },
    #[error("frame {index} is already allocated")]
    FrameAlreadyAllocated { index: usize },
    #[error("no frame {index} in a pool of {frame_count}")]
    NoSuchFrame { index: usize, frame_count: usize },
    #[error("store header invalid: {reason}")]
    HeaderInvalid { reason: String },
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },
}

/// What the cluster-name fence decided when a file-backed store opened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageStartup {
    /// No usable prior content; storage initialized fresh.
    Fresh,
    /// Configured cluster is the unnamed sentinel: existing content ignored,
    /// nothing stored will survive a restart usefully.
    NoPersistence,
    /// On-disk cluster name matches; frames may be scanned into inventory.
    Reusable,
    /// On-disk cluster name (or geometry) differed; trailers were scribbled
    /// so stale replicas cannot poison this or any future run.
    Scribbled { previous_cluster: String },
}

struct Slot {
    used: bool,
    sync: bool,
    /// Staging buffer while the replica is open (authoritative for the
    /// memory backing). Released when the frame is closed for appends.
    payload: Option<Vec<u8>>,
    /// Cache of the current trailer bytes.
    metadata: Option<[u8; ReplicaMetadata::LEN]>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            used: false,
            sync: false,
            payload: None,
            metadata: None,
        }
    }
}

enum Backing {
    Memory,
    File { file: File, path: PathBuf },
}

struct StoreInner {
    segment_size: u32,
    frame_count: usize,
    backing: Backing,
    state: Mutex<Vec<Slot>>,
}

/// Handle to the frame pool. Cheap to clone; all clones share the pool.
#[derive(Clone)]
pub struct FrameStore {
    inner: Arc<StoreInner>,
}

impl FrameStore {
    /// Pool in anonymous memory. No restart inventory is ever possible.
    pub fn in_memory(segment_size: u32, frame_count: usize) -> Self {
        let slots = (0..frame_count).map(|_| Slot::empty()).collect();
        Self {
            inner: Arc::new(StoreInner {
                segment_size,
                frame_count,
                backing: Backing::Memory,
                state: Mutex::new(slots),
            }),
        }
    }

    /// Open or create the single backing file, applying the cluster-name
    /// fence to whatever is already there.
    pub fn open_file(
        path: &Path,
        cluster_name: &str,
        segment_size: u32,
        frame_count: usize,
    ) -> StorageResult<(Self, StorageStartup)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| StorageError::Io {
                path: Some(path.to_path_buf()),
                source,
            })?;

        let existing = read_store_header(&file, path)?;
        let startup = if cluster_name == UNNAMED_CLUSTER {
            StorageStartup::NoPersistence
        } else {
            match existing {
                None => StorageStartup::Fresh,
                Some(header)
                    if header.cluster_name == cluster_name
                        && header.segment_size == segment_size
                        && header.frame_count as usize == frame_count =>
                {
                    StorageStartup::Reusable
                }
                Some(header) => StorageStartup::Scribbled {
                    previous_cluster: header.cluster_name,
                },
            }
        };

        let total_len =
            HEADER_BLOCK_LEN + (frame_count as u64) * frame_len(segment_size);
        file.set_len(total_len).map_err(|source| StorageError::Io {
            path: Some(path.to_path_buf()),
            source,
        })?;
        write_store_header(&file, path, cluster_name, segment_size, frame_count)?;

        let store = Self {
            inner: Arc::new(StoreInner {
                segment_size,
                frame_count,
                backing: Backing::File {
                    file,
                    path: path.to_path_buf(),
                },
                state: Mutex::new((0..frame_count).map(|_| Slot::empty()).collect()),
            }),
        };

        if !matches!(startup, StorageStartup::Reusable) {
            store.scribble_trailers()?;
        }
        Ok((store, startup))
    }

    pub fn segment_size(&self) -> u32 {
        self.inner.segment_size
    }

    pub fn frame_count(&self) -> usize {
        self.inner.frame_count
    }

    /// Allocate the lowest-numbered free frame.
    pub fn open(&self, sync: bool) -> StorageResult<Frame> {
        let mut slots = self.lock();
        let index = slots.iter().position(|s| !s.used).ok_or(
            StorageError::OutOfStorage {
                frame_count: self.inner.frame_count,
            },
        )?;
        let slot = &mut slots[index];
        slot.used = true;
        slot.sync = sync;
        slot.payload = Some(vec![0u8; self.inner.segment_size as usize]);
        slot.metadata = None;
        // Scrub any stale trailer left by a previous tenant before the new
        // replica's first append can land.
        self.inner
            .write_trailer(index, &[0u8; ReplicaMetadata::LEN], sync)?;
        drop(slots);
        Ok(Frame {
            store: Arc::clone(&self.inner),
            index,
        })
    }

    /// Revive a frame holding a replica found on storage at restart.
    pub fn claim(&self, index: usize) -> StorageResult<Frame> {
        self.check_index(index)?;
        let mut slots = self.lock();
        let slot = &mut slots[index];
        if slot.used {
            return Err(StorageError::FrameAlreadyAllocated { index });
        }
        slot.used = true;
        slot.sync = false;
        slot.payload = None;
        slot.metadata = Some(self.inner.read_trailer(index)?);
        Ok(Frame {
            store: Arc::clone(&self.inner),
            index,
        })
    }

    /// Decode frame `index`'s trailer; None when no valid replica is there.
    pub fn load_metadata(&self, index: usize) -> StorageResult<Option<ReplicaMetadata>> {
        self.check_index(index)?;
        let bytes = {
            let slots = self.lock();
            match slots[index].metadata {
                Some(cached) => cached,
                None => self.inner.read_trailer(index)?,
            }
        };
        Ok(ReplicaMetadata::decode(&bytes))
    }

    pub fn is_free(&self, index: usize) -> bool {
        self.lock().get(index).map(|s| !s.used).unwrap_or(false)
    }

    pub fn free_count(&self) -> usize {
        self.lock().iter().filter(|s| !s.used).count()
    }

    fn check_index(&self, index: usize) -> StorageResult<()> {
        if index >= self.inner.frame_count {
            return Err(StorageError::NoSuchFrame {
                index,
                frame_count: self.inner.frame_count,
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn scribble_trailers(&self) -> StorageResult<()> {
        for index in 0..self.inner.frame_count {
            self.inner
                .write_trailer(index, &[0u8; ReplicaMetadata::LEN], false)?;
        }
        self.inner.sync_backing()
    }
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn payload_offset(&self, index: usize) -> u64 {
        HEADER_BLOCK_LEN + (index as u64) * frame_len(self.segment_size)
    }

    fn trailer_offset(&self, index: usize) -> u64 {
        self.payload_offset(index) + u64::from(self.segment_size)
    }

    fn read_trailer(&self, index: usize) -> StorageResult<[u8; ReplicaMetadata::LEN]> {
        let mut bytes = [0u8; ReplicaMetadata::LEN];
        if let Backing::File { file, path } = &self.backing {
            file.read_exact_at(&mut bytes, self.trailer_offset(index))
                .map_err(|source| StorageError::Io {
                    path: Some(path.clone()),
                    source,
                })?;
        }
        Ok(bytes)
    }

    fn write_trailer(
        &self,
        index: usize,
        bytes: &[u8; ReplicaMetadata::LEN],
        sync: bool,
    ) -> StorageResult<()> {
        if let Backing::File { file, path } = &self.backing {
            file.write_all_at(bytes, self.trailer_offset(index))
                .map_err(|source| StorageError::Io {
                    path: Some(path.clone()),
                    source,
                })?;
            if sync {
                file.sync_data().map_err(|source| StorageError::Io {
                    path: Some(path.clone()),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn sync_backing(&self) -> StorageResult<()> {
        if let Backing::File { file, path } = &self.backing {
            file.sync_data().map_err(|source| StorageError::Io {
                path: Some(path.clone()),
                source,
            })?;
        }
        Ok(())
    }
}

/// One allocated frame. Exclusively owned by a single replica; dropping the
/// handle does not release the frame, only [`Frame::free`] does.
pub struct Frame {
    store: Arc<StoreInner>,
    index: usize,
}

impl Frame {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Write `src` at `dst_off` within the payload region and atomically
    /// update the metadata trailer. With the frame's sync flag set, both are
    /// on stable storage when this returns.
    pub fn append(
        &self,
        src: &[u8],
        dst_off: u32,
        metadata: &[u8; ReplicaMetadata::LEN],
    ) -> StorageResult<()> {
        let segment_size = self.store.segment_size;
        let end = u64::from(dst_off) + src.len() as u64;
        if end > u64::from(segment_size) {
            return Err(StorageError::AppendBounds {
                offset: dst_off,
                len: src.len(),
                segment_size,
            });
        }

        let mut slots = self.store.lock();
        let slot = &mut slots[self.index];
        if !slot.used {
            return Err(StorageError::FrameNotAllocated { index: self.index });
        }
        if let Some(buffer) = slot.payload.as_mut() {
            buffer[dst_off as usize..end as usize].copy_from_slice(src);
        }
        slot.metadata = Some(*metadata);
        let sync = slot.sync;
        drop(slots);

        if let Backing::File { file, path } = &self.store.backing {
            if !src.is_empty() {
                file.write_all_at(src, self.store.payload_offset(self.index) + u64::from(dst_off))
                    .map_err(|source| StorageError::Io {
                        path: Some(path.clone()),
                        source,
                    })?;
            }
        }
        self.store.write_trailer(self.index, metadata, sync)
    }

    /// Readable view of the whole payload region.
    pub fn load(&self) -> StorageResult<Bytes> {
        let slots = self.store.lock();
        let slot = &slots[self.index];
        if !slot.used {
            return Err(StorageError::FrameNotAllocated { index: self.index });
        }
        if let Some(buffer) = slot.payload.as_ref() {
            return Ok(Bytes::copy_from_slice(buffer));
        }
        drop(slots);

        match &self.store.backing {
            Backing::Memory => Err(StorageError::FrameNotAllocated { index: self.index }),
            Backing::File { file, path } => {
                let mut buffer = vec![0u8; self.store.segment_size as usize];
                file.read_exact_at(&mut buffer, self.store.payload_offset(self.index))
                    .map_err(|source| StorageError::Io {
                        path: Some(path.clone()),
                        source,
                    })?;
                Ok(Bytes::from(buffer))
            }
        }
    }

    /// Current trailer contents, if a valid one has been written.
    pub fn metadata(&self) -> StorageResult<Option<ReplicaMetadata>> {
        let slots = self.store.lock();
        let slot = &slots[self.index];
        if !slot.used {
            return Err(StorageError::FrameNotAllocated { index: self.index });
        }
        match slot.metadata {
            Some(bytes) => Ok(ReplicaMetadata::decode(&bytes)),
            None => {
                drop(slots);
                let bytes = self.store.read_trailer(self.index)?;
                Ok(ReplicaMetadata::decode(&bytes))
            }
        }
    }

    /// Release the staging buffer once a replica is closed; reads fall back
    /// to the backing file. No-op for the memory backing, which has nothing
    /// to fall back to.
    pub fn release_buffer(&self) {
        if matches!(self.store.backing, Backing::Memory) {
            return;
        }
        let mut slots = self.store.lock();
        slots[self.index].payload = None;
    }

    /// Mark the frame free. The payload becomes indeterminate.
    pub fn free(self) {
        let mut slots = self.store.lock();
        let slot = &mut slots[self.index];
        slot.used = false;
        slot.payload = None;
        slot.metadata = None;
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame({})", self.index)
    }
}

fn frame_len(segment_size: u32) -> u64 {
    u64::from(segment_size) + ReplicaMetadata::LEN as u64
}

struct StoreHeader {
    cluster_name: String,
    segment_size: u32,
    frame_count: u32,
}

fn read_store_header(file: &File, path: &Path) -> StorageResult<Option<StoreHeader>> {
    let len = file
        .metadata()
        .map_err(|source| StorageError::Io {
            path: Some(path.to_path_buf()),
            source,
        })?
        .len();
    if len < HEADER_BLOCK_LEN {
        return Ok(None);
    }
    let mut block = vec![0u8; HEADER_BLOCK_LEN as usize];
    file.read_exact_at(&mut block, 0)
        .map_err(|source| StorageError::Io {
            path: Some(path.to_path_buf()),
            source,
        })?;

    let magic = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
    if magic != STORE_MAGIC {
        return Ok(None);
    }
    let version = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    if version != STORE_VERSION {
        return Ok(None);
    }
    let frame_count = u32::from_le_bytes([block[8], block[9], block[10], block[11]]);
    let segment_size = u32::from_le_bytes([block[12], block[13], block[14], block[15]]);
    let name_len = u32::from_le_bytes([block[16], block[17], block[18], block[19]]) as usize;
    if name_len > MAX_CLUSTER_NAME_LEN || 20 + name_len + 4 > block.len() {
        return Ok(None);
    }
    let crc_at = 20 + name_len;
    let expected = u32::from_le_bytes([
        block[crc_at],
        block[crc_at + 1],
        block[crc_at + 2],
        block[crc_at + 3],
    ]);
    if crc32c(&block[..crc_at]) != expected {
        return Ok(None);
    }
    let cluster_name = match std::str::from_utf8(&block[20..20 + name_len]) {
        Ok(name) => name.to_string(),
        Err(_) => return Ok(None),
    };
    Ok(Some(StoreHeader {
        cluster_name,
        segment_size,
        frame_count,
    }))
}

fn write_store_header(
    file: &File,
    path: &Path,
    cluster_name: &str,
    segment_size: u32,
    frame_count: usize,
) -> StorageResult<()> {
    let name = cluster_name.as_bytes();
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(StorageError::HeaderInvalid {
            reason: format!("cluster name of {} bytes too long", name.len()),
        });
    }
    let mut block = vec![0u8; HEADER_BLOCK_LEN as usize];
    block[0..4].copy_from_slice(&STORE_MAGIC.to_le_bytes());
    block[4..8].copy_from_slice(&STORE_VERSION.to_le_bytes());
    block[8..12].copy_from_slice(&(frame_count as u32).to_le_bytes());
    block[12..16].copy_from_slice(&segment_size.to_le_bytes());
    block[16..20].copy_from_slice(&(name.len() as u32).to_le_bytes());
    block[20..20 + name.len()].copy_from_slice(name);
    let crc = crc32c(&block[..20 + name.len()]);
    block[20 + name.len()..24 + name.len()].copy_from_slice(&crc.to_le_bytes());

    file.write_all_at(&block, 0)
        .map_err(|source| StorageError::Io {
            path: Some(path.to_path_buf()),
            source,
        })?;
    file.sync_data().map_err(|source| StorageError::Io {
        path: Some(path.to_path_buf()),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Certificate;
    use tempfile::TempDir;

    fn sample_metadata(log_id: u64, segment_id: u64, capacity: u32, closed: bool) -> [u8; 33] {
        ReplicaMetadata::new(Certificate::default(), log_id, segment_id, capacity, closed).encode()
    }

    #[test]
    fn open_allocates_ascending_and_exhausts() {
        let store = FrameStore::in_memory(64, 2);
        let a = store.open(false).unwrap();
        let b = store.open(false).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        assert!(matches!(
            store.open(false),
            Err(StorageError::OutOfStorage { .. })
        ));
        a.free();
        assert_eq!(store.open(false).unwrap().index(), 0);
    }

    #[test]
    fn append_and_load_memory_backing() {
        let store = FrameStore::in_memory(64, 1);
        let frame = store.open(false).unwrap();
        frame
            .append(b"test", 10, &sample_metadata(99, 88, 64, false))
            .unwrap();
        let payload = frame.load().unwrap();
        assert_eq!(&payload[10..14], b"test");
        assert_eq!(frame.metadata().unwrap().unwrap().segment_id, 88);
    }

    #[test]
    fn append_bounds_checked() {
        let store = FrameStore::in_memory(64, 1);
        let frame = store.open(false).unwrap();
        let metadata = sample_metadata(1, 1, 64, false);
        assert!(frame.append(&[], 64, &metadata).is_ok());
        assert!(matches!(
            frame.append(b"x", 64, &metadata),
            Err(StorageError::AppendBounds { .. })
        ));
    }

    #[test]
    fn file_backing_survives_reopen_with_same_cluster() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frames");
        {
            let (store, startup) = FrameStore::open_file(&path, "testing", 64, 3).unwrap();
            assert_eq!(startup, StorageStartup::Fresh);
            let frame = store.open(true).unwrap();
            frame
                .append(b"persisted", 0, &sample_metadata(70, 88, 64, true))
                .unwrap();
        }
        let (store, startup) = FrameStore::open_file(&path, "testing", 64, 3).unwrap();
        assert_eq!(startup, StorageStartup::Reusable);
        let found = store.load_metadata(0).unwrap().unwrap();
        assert_eq!((found.log_id, found.segment_id), (70, 88));
        assert!(found.closed);
        let frame = store.claim(0).unwrap();
        assert_eq!(&frame.load().unwrap()[..9], b"persisted");
        assert!(store.load_metadata(1).unwrap().is_none());
    }

    #[test]
    fn mismatched_cluster_scribbles_trailers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frames");
        {
            let (store, _) = FrameStore::open_file(&path, "old-cluster", 64, 2).unwrap();
            let frame = store.open(true).unwrap();
            frame
                .append(&[], 0, &sample_metadata(70, 88, 64, true))
                .unwrap();
        }
        let (store, startup) = FrameStore::open_file(&path, "new-cluster", 64, 2).unwrap();
        assert_eq!(
            startup,
            StorageStartup::Scribbled {
                previous_cluster: "old-cluster".to_string()
            }
        );
        assert!(store.load_metadata(0).unwrap().is_none());
    }

    #[test]
    fn unnamed_cluster_ignores_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frames");
        {
            let (store, _) = FrameStore::open_file(&path, "testing", 64, 2).unwrap();
            let frame = store.open(true).unwrap();
            frame
                .append(&[], 0, &sample_metadata(70, 88, 64, true))
                .unwrap();
        }
        let (store, startup) = FrameStore::open_file(&path, UNNAMED_CLUSTER, 64, 2).unwrap();
        assert_eq!(startup, StorageStartup::NoPersistence);
        assert!(store.load_metadata(0).unwrap().is_none());
    }

    #[test]
    fn reopening_a_frame_scrubs_the_stale_trailer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("frames");
        let (store, _) = FrameStore::open_file(&path, "testing", 64, 1).unwrap();
        let frame = store.open(true).unwrap();
        frame
            .append(&[], 0, &sample_metadata(70, 88, 64, true))
            .unwrap();
        frame.free();
        let _second = store.open(true).unwrap();
        assert!(store.load_metadata(0).unwrap().is_none());
    }
}
