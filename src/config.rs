//! Backup engine configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::UNNAMED_CLUSTER;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("num_segment_frames must be at least 1")]
    NoFrames,
    #[error("segment_size must be nonzero")]
    ZeroSegmentSize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Cluster this backup stores replicas for. Replicas are only reusable
    /// across restarts when the same name is configured again;
    /// `"__unnamed__"` disables persistence entirely.
    pub cluster_name: String,
    /// Fixed number of replica frames in the storage pool.
    pub num_segment_frames: usize,
    /// Replica payload size in bytes. Must match the masters' segment size.
    pub segment_size: u32,
    /// Keep frames in anonymous memory; no file, no restart inventory.
    pub in_memory: bool,
    /// Backing file path; None picks an auto-named file under the system
    /// temp directory (test storage).
    pub file: Option<PathBuf>,
    /// Flush payload and metadata on every append.
    pub sync_writes: bool,
    /// Run garbage collection. When false, GC tasks self-terminate on their
    /// first execution.
    pub gc: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            cluster_name: UNNAMED_CLUSTER.to_string(),
            num_segment_frames: 512,
            segment_size: 8 * 1024 * 1024,
            in_memory: false,
            file: None,
            sync_writes: true,
            gc: true,
        }
    }
}

impl BackupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_segment_frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.segment_size == 0 {
            return Err(ConfigError::ZeroSegmentSize);
        }
        Ok(())
    }

    /// Resolve the backing file path, auto-naming one when unset.
    pub fn storage_path(&self) -> PathBuf {
        match &self.file {
            Some(path) => path.clone(),
            None => std::env::temp_dir().join(format!(
                "logvault-backup-{:016x}.store",
                rand::random::<u64>()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_and_unnamed() {
        let config = BackupConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cluster_name, UNNAMED_CLUSTER);
    }

    #[test]
    fn zero_frames_rejected() {
        let config = BackupConfig {
            num_segment_frames: 0,
            ..BackupConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoFrames)));
    }

    #[test]
    fn auto_named_paths_differ_per_call() {
        let config = BackupConfig::default();
        assert_ne!(config.storage_path(), config.storage_path());
        let pinned = BackupConfig {
            file: Some(PathBuf::from("/var/lib/logvault/frames")),
            ..BackupConfig::default()
        };
        assert_eq!(
            pinned.storage_path(),
            PathBuf::from("/var/lib/logvault/frames")
        );
    }
}
