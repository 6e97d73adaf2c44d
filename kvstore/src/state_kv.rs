//! Replicated state machine for the key-value service.
//!
//! Applies committed commands deterministically against the local store and
//! tracks leadership state for the command-serving paths. The store is
//! mutated only from the substrate's sequential apply loop; `leader_term` is
//! the one field read concurrently by request-serving tasks, published with
//! release stores and read with acquire loads.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use crate::command::{Command, OpCode};
use crate::config;
use crate::raft::StateMachine;
use crate::snapshot::{SnapshotManager, SnapshotPayload};
use crate::store::{KvStore, StoreError};

#[derive(Clone)]
pub struct StateKv {
    store: KvStore,
    snapshots: SnapshotManager,
    /// -1 while not leader, the current term while leader.
    leader_term: Arc<AtomicI64>,
    /// Last observed leader id, 0 when unknown. Feeds best-effort redirects.
    leader_id: Arc<AtomicU64>,
}

impl StateKv {
    pub fn new(store: KvStore, snapshots: SnapshotManager) -> StateKv {
        StateKv {
            store,
            snapshots,
            leader_term: Arc::new(AtomicI64::new(-1)),
            leader_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leader_term.load(Ordering::Acquire) > 0
    }

    pub fn leader_term(&self) -> i64 {
        self.leader_term.load(Ordering::Acquire)
    }

    /// Best-effort address of the current leader, usable as a redirect.
    pub fn known_leader_addr(&self) -> Option<String> {
        let id = self.leader_id.load(Ordering::Acquire);
        if id == 0 {
            return None;
        }
        config::instance().lock().unwrap().peer_addr(id)
    }

    /// Leader-confirmed local read. Callers must check `is_leader` first; a
    /// replica not confirmed as leader must redirect instead of answering
    /// from a possibly stale local copy.
    pub fn read_local(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.store.get(key)
    }

    pub fn store(&self) -> &KvStore {
        &self.store
    }

    fn apply_command(&self, index: u64, cmd: &Command) -> bool {
        match OpCode::from_u32(cmd.op) {
            Some(OpCode::Write) | Some(OpCode::Modify) => {
                match self.store.put(&cmd.key, &cmd.value) {
                    Ok(()) => true,
                    Err(e) => {
                        log::error!("put failed at index {}: {}", index, e);
                        false
                    }
                }
            }
            Some(OpCode::Delete) => match self.store.delete(&cmd.key) {
                Ok(existed) => {
                    if !existed {
                        log::warn!("delete at index {}: key absent", index);
                    }
                    true
                }
                Err(e) => {
                    log::error!("delete failed at index {}: {}", index, e);
                    false
                }
            },
            // READ never enters the log; anything else is outside the
            // vocabulary. Either way: no mutation, failed outcome.
            Some(OpCode::Read) | None => {
                log::error!("unsupported op code {} at index {}", cmd.op, index);
                false
            }
        }
    }
}

impl StateMachine for StateKv {
    fn apply(&mut self, index: u64, data: &[u8]) -> bool {
        // The store remembers the last index folded into it; entries at or
        // below that mark were applied before a restart and are skipped on
        // replay.
        let applied = self.store.applied_index().unwrap_or_else(|e| {
            log::error!("failed to read applied-index marker: {}", e);
            0
        });
        if index <= applied {
            return true;
        }

        let outcome = match Command::decode(data) {
            Ok(cmd) => self.apply_command(index, &cmd),
            Err(e) => {
                log::error!("failed to decode command at index {}: {}", index, e);
                false
            }
        };

        if let Err(e) = self.store.set_applied_index(index) {
            log::error!("failed to advance applied-index marker to {}: {}", index, e);
        }
        outcome
    }

    fn snapshot(&self) -> Vec<u8> {
        let applied = self.store.applied_index().unwrap_or(0);
        let payload = SnapshotPayload::new(applied, 0);
        // Durable write happens on a blocking task; the caller's loop only
        // pays for the encode.
        self.snapshots.save_async(payload.clone());
        payload.encode().unwrap_or_default()
    }

    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]) {
        if self.is_leader() {
            log::error!("refusing snapshot load on an active leader");
            return;
        }
        if data.is_empty() {
            return;
        }
        let payload = match SnapshotPayload::decode(data) {
            Ok(p) => p,
            Err(e) => {
                log::error!("failed to decode snapshot payload: {}", e);
                return;
            }
        };

        // Reconcile the store with the snapshot position. A store already at
        // or past the snapshot index keeps its contents and replays from its
        // own mark; a lagging store adopts the snapshot index as its replay
        // floor.
        let store_applied = self.store.applied_index().unwrap_or(0);
        if store_applied < payload.applied_index {
            log::warn!(
                "local store at index {} is behind snapshot index {}; adopting snapshot floor",
                store_applied,
                payload.applied_index
            );
            if let Err(e) = self.store.set_applied_index(payload.applied_index) {
                log::error!("failed to adopt snapshot index: {}", e);
                return;
            }
        }
        self.snapshots
            .save_async(SnapshotPayload::new(payload.applied_index, last_term));
        log::info!(
            "installed snapshot at index {} (log index {})",
            payload.applied_index,
            last_index
        );
    }

    fn on_leader_start(&mut self, term: u64) {
        let my_id = config::instance().lock().unwrap().id;
        self.leader_id.store(my_id, Ordering::Release);
        self.leader_term.store(term as i64, Ordering::Release);
        log::info!("node becomes leader at term {}", term);
    }

    fn on_leader_stop(&mut self) {
        self.leader_term.store(-1, Ordering::Release);
        log::info!("node stepped down");
    }

    fn on_start_following(&mut self, leader_id: u64, term: u64) {
        self.leader_id.store(leader_id, Ordering::Release);
        log::info!("node starts following {} at term {}", leader_id, term);
    }

    fn on_stop_following(&mut self) {
        self.leader_id.store(0, Ordering::Release);
        log::info!("node stops following");
    }

    fn on_configuration_committed(&mut self, voters: &[u64]) {
        log::info!("configuration of this group is {:?}", voters);
    }

    fn on_error(&mut self, desc: &str) {
        log::error!("met raft error: {}", desc);
    }

    fn on_shutdown(&mut self) {
        if let Err(e) = self.store.flush() {
            log::error!("failed to flush store on shutdown: {}", e);
        }
        log::info!("this node is down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use tempfile::TempDir;

    fn state_at(dir: &TempDir) -> StateKv {
        let store = KvStore::open(dir.path().join("db")).unwrap();
        let snapshots = SnapshotManager::new(dir.path().join("snapshot")).unwrap();
        StateKv::new(store, snapshots)
    }

    fn write_cmd(key: &[u8], value: &[u8]) -> Vec<u8> {
        Command::new(OpCode::Write.as_u32(), key.to_vec(), value.to_vec())
            .encode()
            .unwrap()
    }

    fn delete_cmd(key: &[u8]) -> Vec<u8> {
        Command::new(OpCode::Delete.as_u32(), key.to_vec(), Vec::new())
            .encode()
            .unwrap()
    }

    #[test]
    fn test_read_after_write() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);

        assert!(state.apply(1, &write_cmd(b"a", b"1")));
        assert_eq!(state.read_local(b"a").unwrap(), Some(b"1".to_vec()));

        assert!(state.apply(2, &write_cmd(b"a", b"2")));
        assert_eq!(state.read_local(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_delete_missing_key_is_handled() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);

        // Deleting a key that was never written resolves as a handled
        // outcome and leaves the store empty.
        assert!(state.apply(1, &delete_cmd(b"ghost")));
        assert_eq!(state.read_local(b"ghost").unwrap(), None);

        assert!(state.apply(2, &write_cmd(b"a", b"1")));
        assert!(state.apply(3, &delete_cmd(b"a")));
        assert_eq!(state.read_local(b"a").unwrap(), None);
    }

    #[test]
    fn test_unknown_op_rejected_without_mutation() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);

        let bad = Command::new(7, b"a".to_vec(), b"x".to_vec()).encode().unwrap();
        assert!(!state.apply(1, &bad));
        assert_eq!(state.read_local(b"a").unwrap(), None);

        // The entry still advances the applied mark so replicas stay in
        // lockstep.
        assert_eq!(state.store().applied_index().unwrap(), 1);
    }

    #[test]
    fn test_undecodable_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);
        assert!(!state.apply(1, b"\xff\xff not a command"));
        assert_eq!(state.store().applied_index().unwrap(), 1);
    }

    #[test]
    fn test_deterministic_replay() {
        let entries: Vec<Vec<u8>> = vec![
            write_cmd(b"a", b"1"),
            write_cmd(b"b", b"2"),
            delete_cmd(b"a"),
            write_cmd(b"c", b"3"),
            write_cmd(b"b", b"4"),
        ];

        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut a = state_at(&dir_a);
        let mut b = state_at(&dir_b);

        for (i, data) in entries.iter().enumerate() {
            a.apply(i as u64 + 1, data);
        }
        for (i, data) in entries.iter().enumerate() {
            b.apply(i as u64 + 1, data);
        }

        assert_eq!(a.store().dump().unwrap(), b.store().dump().unwrap());
    }

    #[test]
    fn test_replay_skips_applied_entries() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);

        assert!(state.apply(1, &write_cmd(b"a", b"1")));
        assert!(state.apply(2, &delete_cmd(b"a")));

        // Replaying an already-applied prefix must not resurrect old values.
        assert!(state.apply(1, &write_cmd(b"a", b"1")));
        assert_eq!(state.read_local(b"a").unwrap(), None);
        assert_eq!(state.store().applied_index().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let entries: Vec<Vec<u8>> = (0..10u8)
            .map(|i| write_cmd(&[b'k', i], &[b'v', i]))
            .collect();

        // Replica A applies a prefix, snapshots, restarts, then replays the
        // full log from the beginning.
        let dir_a = TempDir::new().unwrap();
        {
            let mut a = state_at(&dir_a);
            for (i, data) in entries.iter().take(5).enumerate() {
                a.apply(i as u64 + 1, data);
            }
            let blob = StateMachine::snapshot(&a);
            let payload = SnapshotPayload::decode(&blob).unwrap();
            assert_eq!(payload.applied_index, 5);
            a.store().flush().unwrap();
        }

        let mut a = state_at(&dir_a);
        {
            let blob = SnapshotPayload::new(5, 1).encode().unwrap();
            a.on_snapshot(5, 1, &blob);
        }
        for (i, data) in entries.iter().enumerate() {
            a.apply(i as u64 + 1, data);
        }

        // Replica B replays everything from scratch.
        let dir_b = TempDir::new().unwrap();
        let mut b = state_at(&dir_b);
        for (i, data) in entries.iter().enumerate() {
            b.apply(i as u64 + 1, data);
        }

        assert_eq!(a.store().dump().unwrap(), b.store().dump().unwrap());
    }

    #[test]
    fn test_leadership_transitions() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);

        assert!(!state.is_leader());
        assert_eq!(state.leader_term(), -1);

        state.on_leader_start(3);
        assert!(state.is_leader());
        assert_eq!(state.leader_term(), 3);

        state.on_leader_stop();
        assert!(!state.is_leader());
        assert_eq!(state.leader_term(), -1);
    }

    #[tokio::test]
    async fn test_snapshot_load_refused_on_leader() {
        let dir = TempDir::new().unwrap();
        let mut state = state_at(&dir);
        state.on_leader_start(2);

        let blob = SnapshotPayload::new(9, 2).encode().unwrap();
        state.on_snapshot(9, 2, &blob);

        // The marker must not move while leading.
        assert_eq!(state.store().applied_index().unwrap(), 0);
    }
}
