//! Snapshot manager for the replicated state machine.
//!
//! The canonical key-value data lives in the local store, which is durable on
//! its own. What must round-trip through the replication substrate's
//! snapshot mechanism is a compact version marker: the format version and the
//! log position the store had folded in when the snapshot was taken. Bulk
//! data transfer is deliberately decoupled from snapshotting.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

const PAYLOAD_FILE: &str = "payload";
const PAYLOAD_TMP_FILE: &str = "payload.tmp";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u32),
}

/// The reproducible subset of state-machine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub format_version: u32,
    pub applied_index: u64,
    pub applied_term: u64,
}

impl SnapshotPayload {
    pub fn new(applied_index: u64, applied_term: u64) -> SnapshotPayload {
        SnapshotPayload {
            format_version: SNAPSHOT_FORMAT_VERSION,
            applied_index,
            applied_term,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<SnapshotPayload, SnapshotError> {
        let payload: SnapshotPayload = bincode::deserialize(data)?;
        if payload.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedVersion(payload.format_version));
        }
        Ok(payload)
    }
}

/// Writes and reads the snapshot payload file inside the snapshot directory.
#[derive(Clone)]
pub struct SnapshotManager {
    dir: PathBuf,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<SnapshotManager> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotManager { dir })
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.join(PAYLOAD_FILE)
    }

    /// Durable save off the apply path. The write runs on a blocking task so
    /// the apply loop never waits on snapshot I/O; failures are logged and
    /// reported to the metrics side, never propagated into apply.
    pub fn save_async(&self, payload: SnapshotPayload) {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = manager.save(&payload) {
                log::error!(
                    "failed to save snapshot payload at index {}: {}",
                    payload.applied_index,
                    e
                );
                crate::metrics::SNAPSHOT_FAILURE_COUNTER.inc();
            } else {
                log::info!("saved snapshot payload at index {}", payload.applied_index);
            }
        });
    }

    /// Write to a temporary file first, then rename over the old payload.
    pub fn save(&self, payload: &SnapshotPayload) -> Result<(), SnapshotError> {
        let tmp_path = self.dir.join(PAYLOAD_TMP_FILE);
        fs::write(&tmp_path, payload.encode()?)?;
        fs::rename(&tmp_path, self.payload_path())?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<SnapshotPayload>, SnapshotError> {
        let path = self.payload_path();
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(SnapshotPayload::decode(&data)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_payload_round_trip() {
        let payload = SnapshotPayload::new(17, 3);
        let decoded = SnapshotPayload::decode(&payload.encode().unwrap()).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut payload = SnapshotPayload::new(1, 1);
        payload.format_version = 99;
        let data = bincode::serialize(&payload).unwrap();
        assert!(matches!(
            SnapshotPayload::decode(&data),
            Err(SnapshotError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let manager = SnapshotManager::new(dir.path().join("snapshot")).unwrap();

        assert!(manager.load().unwrap().is_none());

        let payload = SnapshotPayload::new(5, 2);
        manager.save(&payload).unwrap();
        assert_eq!(manager.load().unwrap(), Some(payload.clone()));

        // A newer save replaces the old payload in place.
        let newer = SnapshotPayload::new(9, 2);
        manager.save(&newer).unwrap();
        assert_eq!(manager.load().unwrap(), Some(newer));
    }
}
