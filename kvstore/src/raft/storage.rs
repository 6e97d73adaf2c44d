//! Raft log and state persistence.
//!
//! `FileStorage` layers durable segment files and a snapshot blob under a
//! `MemStorage` working set: every append goes to both, and on startup the
//! snapshot plus segment tail is reloaded into memory. Paths under
//! `base_path` are substrate-owned; the state machine's payload rides inside
//! the snapshot blob.

use crate::raft::segment::Segment;
use prost::bytes::Bytes;
use protobuf::Message;
use raft::eraftpb::Entry;
use raft::eraftpb::HardState;
use raft::eraftpb::Snapshot;
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage};
use raft_proto::eraftpb::ConfState;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

// Entries per segment file.
const SEGMENT_CAPACITY: u64 = 100_000;

fn store_err<E: std::error::Error + Send + Sync + 'static>(e: E) -> raft::Error {
    raft::Error::Store(raft::StorageError::Other(Box::new(e)))
}

pub struct FileStorage {
    mem_storage: MemStorage,
    segments: BTreeMap<u64, Segment>,
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P, bootstrap: bool) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path).map_err(store_err)?;

        let mem_storage = MemStorage::new();

        // Reload the previous snapshot if one exists; otherwise an initial
        // single-voter snapshot bootstraps a brand-new group.
        let snapshot_path = base_path.join("snapshot");
        if snapshot_path.exists() {
            let snapshot_data = fs::read(&snapshot_path).map_err(store_err)?;
            let mut snapshot = Snapshot::default();
            snapshot.merge_from_bytes(&snapshot_data).map_err(store_err)?;
            mem_storage.wl().apply_snapshot(snapshot)?;
        } else if bootstrap {
            let mut snapshot = Snapshot::default();
            snapshot.mut_metadata().index = 1;
            snapshot.mut_metadata().term = 1;
            snapshot.mut_metadata().mut_conf_state().voters = vec![1];
            mem_storage.wl().apply_snapshot(snapshot)?;
        }

        // Collect segment files sorted by start index.
        let mut segment_files: Vec<(u64, PathBuf)> = fs::read_dir(&base_path)
            .map_err(store_err)?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                let name = path.file_name()?.to_string_lossy().to_string();
                if !path.is_file() || !name.starts_with("segment_") {
                    return None;
                }
                let start_index = name
                    .trim_start_matches("segment_")
                    .trim_end_matches(".log")
                    .parse::<u64>()
                    .ok()?;
                Some((start_index, path))
            })
            .collect();
        segment_files.sort_by_key(|(start_index, _)| *start_index);

        let last_index = mem_storage.last_index().unwrap_or(0);

        // Replay the tail of each segment that the snapshot does not cover.
        let mut segments = BTreeMap::new();
        let mut entries = Vec::new();
        for (start_index, segment_path) in segment_files {
            let mut segment = Segment::new(&segment_path, start_index).map_err(store_err)?;

            let mut current_index = start_index;
            while let Ok(entry_data) = segment.read_entry(current_index) {
                let mut entry = Entry::default();
                entry.merge_from_bytes(&entry_data).map_err(store_err)?;
                if entry.index > last_index {
                    entries.push(entry);
                }
                current_index += 1;
            }

            segments.insert(start_index, segment);
        }

        if !entries.is_empty() {
            mem_storage.wl().append(&entries)?;
        }

        Ok(FileStorage {
            mem_storage,
            segments,
            base_path,
        })
    }

    fn segment_path(&self, start_index: u64) -> PathBuf {
        self.base_path.join(format!("segment_{}.log", start_index))
    }

    // Segment boundaries are aligned so that index 1 opens segment_1.
    fn segment_start(index: u64) -> u64 {
        ((index - 1) / SEGMENT_CAPACITY) * SEGMENT_CAPACITY + 1
    }

    fn get_or_create_segment(&mut self, start_index: u64) -> Result<&mut Segment> {
        if !self.segments.contains_key(&start_index) {
            let path = self.segment_path(start_index);
            let segment = Segment::new(path, start_index).map_err(store_err)?;
            self.segments.insert(start_index, segment);
        }
        Ok(self.segments.get_mut(&start_index).unwrap())
    }

    /// Commit index recorded in the persisted hard state; the applied floor
    /// for a restarting node.
    pub fn commit(&self) -> u64 {
        self.mem_storage
            .initial_state()
            .map(|state| state.hard_state.commit)
            .unwrap_or(0)
    }

    pub fn append_entries(&mut self, entries: &[Entry]) -> Result<()> {
        // First append to the working set
        self.mem_storage.wl().append(entries)?;

        // Group entries by their segment
        let mut entries_by_segment: BTreeMap<u64, Vec<Vec<u8>>> = BTreeMap::new();
        for entry in entries {
            let data = entry.write_to_bytes().map_err(store_err)?;
            entries_by_segment
                .entry(Self::segment_start(entry.index))
                .or_default()
                .push(data);
        }

        for (segment_start, segment_entries) in entries_by_segment {
            let segment = self.get_or_create_segment(segment_start)?;
            segment.append(&segment_entries).map_err(store_err)?;
        }

        Ok(())
    }

    pub fn set_conf_state(&mut self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state)
    }

    pub fn set_hardstate(&mut self, hs: HardState) {
        self.mem_storage.wl().set_hardstate(hs);
    }

    pub fn set_commit(&mut self, commit: u64) {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
    }

    /// Install a snapshot received from the leader.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        let snapshot_path = self.base_path.join("snapshot");
        let snapshot_data = snapshot.write_to_bytes().map_err(store_err)?;
        fs::write(&snapshot_path, &snapshot_data).map_err(store_err)?;
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        Ok(())
    }

    /// Persist a snapshot taken at `applied` carrying the state machine's
    /// payload, then compact the log and drop fully-covered segments.
    pub fn save_snapshot(&mut self, payload: Vec<u8>, applied: u64) -> Result<()> {
        let mut snapshot = self.snapshot(applied, 0)?;
        snapshot.set_data(Bytes::from(payload));
        let snapshot_path = self.base_path.join("snapshot");
        let temp_path = self.base_path.join("snapshot.tmp");

        // Write to a temporary file first, then swap it in.
        let snapshot_data = snapshot.write_to_bytes().map_err(store_err)?;
        fs::write(&temp_path, &snapshot_data).map_err(store_err)?;
        fs::rename(&temp_path, &snapshot_path).map_err(store_err)?;

        self.mem_storage
            .wl()
            .compact(snapshot.get_metadata().index)?;

        let covered: Vec<u64> = self
            .segments
            .iter()
            .filter(|(_, segment)| segment.get_end_index() <= snapshot.get_metadata().index)
            .map(|(start_index, _)| *start_index)
            .collect();
        for start_index in covered {
            if let Some(segment) = self.segments.remove(&start_index) {
                if let Err(e) = fs::remove_file(segment.path()) {
                    log::warn!("failed to remove covered segment {}: {}", segment.path(), e);
                }
            }
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    /// Implements the Storage trait.
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    /// Implements the Storage trait.
    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    /// Implements the Storage trait.
    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    /// Implements the Storage trait.
    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    /// Implements the Storage trait.
    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Implements the Storage trait.
    fn snapshot(&self, request_index: u64, to: u64) -> Result<Snapshot> {
        self.mem_storage.snapshot(request_index, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_entry(index: u64, term: u64, data: &[u8]) -> Entry {
        let mut entry = Entry::default();
        entry.index = index;
        entry.term = term;
        entry.data = Bytes::copy_from_slice(data);
        entry
    }

    #[test]
    fn test_bootstrap_and_append() {
        let dir = TempDir::new().unwrap();
        let mut storage = FileStorage::new(dir.path(), true).unwrap();

        assert_eq!(storage.last_index().unwrap(), 1);

        let entries = vec![make_entry(2, 1, b"two"), make_entry(3, 1, b"three")];
        storage.append_entries(&entries).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
    }

    #[test]
    fn test_reload_replays_segment_tail() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FileStorage::new(dir.path(), true).unwrap();
            storage
                .append_entries(&[make_entry(2, 1, b"two"), make_entry(3, 1, b"three")])
                .unwrap();
        }

        let storage = FileStorage::new(dir.path(), false).unwrap();
        assert_eq!(storage.last_index().unwrap(), 3);
        let ctx = GetEntriesContext::empty(false);
        let entries = storage.entries(2, 4, None, ctx).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].data.as_ref(), b"three");
    }

    #[test]
    fn test_segment_alignment() {
        assert_eq!(FileStorage::segment_start(1), 1);
        assert_eq!(FileStorage::segment_start(SEGMENT_CAPACITY), 1);
        assert_eq!(
            FileStorage::segment_start(SEGMENT_CAPACITY + 1),
            SEGMENT_CAPACITY + 1
        );
    }
}
