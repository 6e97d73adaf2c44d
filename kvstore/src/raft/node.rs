//! Raft node driver.
//!
//! Owns the RawNode event loop: stepping peer messages, submitting
//! proposals, applying committed entries to the state machine, detecting
//! leadership transitions, and triggering periodic snapshots. Entries are
//! applied one at a time, in log order; no two apply invocations for the
//! same group overlap. That sequential order is what keeps every replica's
//! store byte-identical after the same log prefix.

#![allow(clippy::field_reassign_with_default)]

use std::collections::VecDeque;

use slog::Drain;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::time::{self, Duration, Instant};

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};

use crate::command::Outcome;
use crate::config;
use crate::raft::proposal::Proposal;
use crate::raft::StateMachine;
use slog::o;

use super::storage::FileStorage;

const TICK_INTERVAL: Duration = Duration::from_millis(100);
const LOGGER_CHANNEL_SIZE: usize = 4096;

fn default_config(id: u64, applied: u64) -> Config {
    Config {
        id,
        election_tick: 10,
        heartbeat_tick: 3,
        applied,
        ..Default::default()
    }
}

/// Add all followers to the cluster through configuration changes, one at a
/// time. Used when bootstrapping a group from the initial leader.
pub async fn add_all_followers(ids: Vec<u64>, proposals: &Sender<Proposal>) {
    for id in ids {
        let mut conf_change = ConfChange::default();
        conf_change.node_id = id;
        conf_change.set_change_type(ConfChangeType::AddNode);
        let (proposal, rx) = Proposal::conf_change(&conf_change);
        let _ = proposals.send(proposal).await;
        match rx.await {
            Ok(outcome) => {
                log::info!("add follower {}, success: {}", id, outcome.success);
            }
            Err(e) => {
                log::error!("failed to add follower {}: {:?}", id, e);
            }
        }
    }
}

pub struct Node<S: StateMachine> {
    raft_group: RawNode<FileStorage>,
    out_mailbox: Sender<Message>,  // -> peer transport
    my_mailbox: Receiver<Message>, // <- peer transport
    state_machine: S,
    proposals: Receiver<Proposal>,
    /// Pending commands in submission (= log) order, resolved exactly once.
    proposed: VecDeque<Proposal>,
    shutdown: watch::Receiver<bool>,
    last_role: StateRole,
    last_leader: u64,
}

impl<S: StateMachine + Send + Clone + 'static> Node<S> {
    fn create(
        id: u64,
        bootstrap: bool,
        out_mailbox: Sender<Message>,
        my_mailbox: Receiver<Message>,
        proposals: Receiver<Proposal>,
        shutdown: watch::Receiver<bool>,
        logger: &slog::Logger,
        state_machine: S,
        base_path: &str,
    ) -> anyhow::Result<Self> {
        let logger = logger.new(o!("tag" => format!("peer_{}", id)));
        let storage = FileStorage::new(base_path, bootstrap)?;
        let cfg = default_config(id, storage.commit());
        let raft_group = RawNode::new(&cfg, storage, &logger)?;

        Ok(Node {
            raft_group,
            out_mailbox,
            my_mailbox,
            proposals,
            state_machine,
            proposed: VecDeque::new(),
            shutdown,
            last_role: StateRole::Follower,
            last_leader: 0,
        })
    }

    /// Address of the believed leader, usable as a redirect target.
    fn leader_hint(raft_group: &RawNode<FileStorage>) -> Option<String> {
        let leader_id = raft_group.raft.leader_id;
        if leader_id == 0 {
            return None;
        }
        config::instance().lock().unwrap().peer_addr(leader_id)
    }

    /// Submit a proposal to the raft group.
    ///
    /// Leadership and the expected-term fence are re-checked here, at
    /// submission time: leadership may have changed since the RPC layer
    /// accepted the request, and a command fenced to a stale term must be
    /// rejected rather than applied under a newer term's authority.
    fn propose(
        raft_group: &mut RawNode<FileStorage>,
        mut proposal: Proposal,
        proposed: &mut VecDeque<Proposal>,
    ) {
        let term_ok = proposal.expected_term == 0 || proposal.expected_term == raft_group.raft.term;
        if raft_group.raft.state != StateRole::Leader || !term_ok {
            proposal.resolve(Outcome::rejected(Self::leader_hint(raft_group)));
            return;
        }

        let last_index = raft_group.raft.raft_log.last_index() + 1;

        if let Some(ref data) = proposal.data {
            let _ = raft_group.propose(vec![], data.clone());
        } else if let Some(ref cc) = proposal.conf_change {
            let _ = raft_group.propose_conf_change(vec![], cc.clone());
        }

        let new_last_index = raft_group.raft.raft_log.last_index() + 1;
        if new_last_index == last_index {
            // The substrate refused the proposal; report it like any other
            // not-leader rejection.
            proposal.resolve(Outcome::rejected(Self::leader_hint(raft_group)));
        } else {
            proposal.proposed = last_index;
            proposed.push_back(proposal);
        }
    }

    /// Resolve the pending command at `index` with its apply outcome.
    fn resolve_applied(index: u64, success: bool, proposed: &mut VecDeque<Proposal>) {
        while let Some(front) = proposed.front() {
            if front.proposed > index {
                break;
            }
            let mut proposal = proposed.pop_front().unwrap();
            if proposal.proposed == index {
                proposal.resolve(Outcome::applied(success));
            } else {
                // A pending index below the applied one means its entry was
                // superseded; reject rather than leave the caller hanging.
                log::warn!("pending command at stale index {}", proposal.proposed);
                proposal.resolve(Outcome::rejected(None));
            }
        }
    }

    /// Resolve every still-pending command with a failure. Invoked on loss
    /// of leadership and on shutdown so no RPC response ever leaks.
    fn fail_pending(proposed: &mut VecDeque<Proposal>, hint: Option<String>) {
        while let Some(mut proposal) = proposed.pop_front() {
            proposal.resolve(Outcome::rejected(hint.clone()));
        }
    }

    /// Apply committed entries to the state machine, strictly in log order.
    /// A failed command never stalls the loop; its outcome is attached to
    /// the pending proposal and the next entry proceeds.
    fn handle_committed_entries(
        raft_group: &mut RawNode<FileStorage>,
        entries: Vec<Entry>,
        state_machine: &mut S,
        proposed: &mut VecDeque<Proposal>,
    ) {
        for entry in entries {
            if entry.data.is_empty() {
                // Leader no-op entry on term change.
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    if let Err(e) = cc.merge_from_bytes(&entry.data) {
                        log::error!("failed to decode conf change at {}: {}", entry.index, e);
                        continue;
                    }
                    match raft_group.apply_conf_change(&cc) {
                        Ok(cs) => {
                            state_machine.on_configuration_committed(&cs.voters);
                            raft_group.raft.raft_log.store.set_conf_state(cs);
                            Self::resolve_applied(entry.index, true, proposed);
                        }
                        Err(e) => {
                            log::error!("failed to apply conf change at {}: {}", entry.index, e);
                            Self::resolve_applied(entry.index, false, proposed);
                        }
                    }
                }
                _ => {
                    let success = state_machine.apply(entry.index, entry.data.as_ref());
                    Self::resolve_applied(entry.index, success, proposed);
                }
            }
        }
    }

    /// Process the raft ready state: outgoing messages, installed snapshots,
    /// committed entries, persistence, advance.
    fn on_ready(&mut self) {
        let raft_group = &mut self.raft_group;

        if !raft_group.has_ready() {
            return;
        }

        let mut ready = raft_group.ready();

        // Step 1: Handle messages
        if !ready.messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_messages());
        }

        // Step 2: Handle snapshot if any
        if *ready.snapshot() != Snapshot::default() {
            Self::handle_snapshot(raft_group, &ready, &mut self.state_machine);
        }

        // Step 3: Handle committed entries
        Self::handle_committed_entries(
            raft_group,
            ready.take_committed_entries(),
            &mut self.state_machine,
            &mut self.proposed,
        );

        // Step 4: Persist raft state
        Self::persist_raft_state(raft_group, &ready, &mut self.state_machine);
        if !ready.persisted_messages().is_empty() {
            Self::handle_out_messages(&self.out_mailbox, &ready.take_persisted_messages());
        }

        // Step 5: Advance raft state
        let mut light_rd = raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            Self::update_commit(raft_group, commit);
        }
        Self::handle_out_messages(&self.out_mailbox, light_rd.messages());
        Self::handle_committed_entries(
            raft_group,
            light_rd.take_committed_entries(),
            &mut self.state_machine,
            &mut self.proposed,
        );

        raft_group.advance_apply();
    }

    /// Detect leadership transitions and drive the state machine callbacks.
    /// The transitions themselves are owned by the substrate; this only
    /// observes them.
    fn observe_transitions(&mut self) {
        let role = self.raft_group.raft.state;
        let term = self.raft_group.raft.term;
        let leader = self.raft_group.raft.leader_id;

        if role != self.last_role {
            if role == StateRole::Leader {
                self.state_machine.on_leader_start(term);
            } else if self.last_role == StateRole::Leader {
                self.state_machine.on_leader_stop();
                // Commands fenced to the old term can no longer commit under
                // this node's authority.
                let hint = Self::leader_hint(&self.raft_group);
                Self::fail_pending(&mut self.proposed, hint);
            }
            self.last_role = role;
        }

        if leader != self.last_leader {
            if leader == 0 {
                self.state_machine.on_stop_following();
            } else if role != StateRole::Leader {
                self.state_machine.on_start_following(leader, term);
            }
            self.last_leader = leader;
        }
    }

    /// Forward raft messages to the peer transport. Losing one is fine; raft
    /// retries.
    fn handle_out_messages(sender: &Sender<Message>, messages: &[Message]) {
        for msg in messages {
            if let Err(e) = sender.try_send(msg.clone()) {
                log::error!("failed to queue raft message {:?}, raft will retry", e);
            }
        }
    }

    /// Install a snapshot received from the substrate into the storage and
    /// the state machine.
    fn handle_snapshot(
        raft_group: &mut RawNode<FileStorage>,
        ready: &Ready,
        state_machine: &mut S,
    ) {
        let snapshot = ready.snapshot().clone();
        let metadata = snapshot.get_metadata().clone();

        {
            let store = &mut raft_group.raft.raft_log.store;
            if let Err(e) = store.apply_snapshot(&snapshot) {
                log::error!("failed to apply snapshot: {:?}, need to retry or panic", e);
                return;
            }
        }

        state_machine.on_snapshot(metadata.index, metadata.term, ready.snapshot().get_data());
    }

    /// Produce the state-machine snapshot payload and compact the log up to
    /// the applied index. The payload's durable write happens off this loop.
    fn handle_save_snapshot(raft_group: &mut RawNode<FileStorage>, state_machine: &mut S) {
        let payload = state_machine.snapshot();
        let applied = raft_group.raft.raft_log.applied;
        let store = &mut raft_group.raft.raft_log.store;
        match store.save_snapshot(payload, applied) {
            Ok(()) => log::info!("saved snapshot at index {}", applied),
            Err(e) => {
                log::error!("failed to save snapshot at index {}: {:?}", applied, e);
                state_machine.on_error("snapshot save failed");
            }
        }
    }

    fn persist_raft_state(raft_group: &mut RawNode<FileStorage>, ready: &Ready, state_machine: &mut S) {
        let store = &mut raft_group.raft.raft_log.store;

        if let Err(e) = store.append_entries(ready.entries()) {
            log::error!("failed to persist raft log: {:?}, need to retry or panic", e);
            state_machine.on_error("raft log persistence failed");
            return;
        }

        if let Some(hs) = ready.hs() {
            store.set_hardstate(hs.clone());
        }
    }

    fn update_commit(raft_group: &mut RawNode<FileStorage>, commit: u64) {
        let store = &mut raft_group.raft.raft_log.store;
        store.set_commit(commit);
    }

    /// Main event loop: messages, proposals, tick, snapshot, ready, until
    /// shutdown is requested.
    async fn run_background_tasks(&mut self) {
        let snapshot_interval = Duration::from_secs(
            config::instance().lock().unwrap().snapshot_interval_secs,
        );
        let mut last_tick = Instant::now();
        let mut last_save_snapshot = Instant::now();
        let mut last_index_snapshot = 0u64;

        loop {
            let raft_group = &mut self.raft_group;
            tokio::select! {
                Some(outmsg) = self.my_mailbox.recv() => {
                    let _ = raft_group.step(outmsg);
                    while let Ok(msg) = self.my_mailbox.try_recv() {
                        let _ = raft_group.step(msg);
                    }
                }
                Some(proposal) = self.proposals.recv() => {
                    Self::propose(raft_group, proposal, &mut self.proposed);
                    while let Ok(proposal) = self.proposals.try_recv() {
                        Self::propose(raft_group, proposal, &mut self.proposed);
                    }
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(time::Duration::from_millis(1)) => {
                }
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.raft_group.tick();
                last_tick = Instant::now();
            }

            if last_save_snapshot.elapsed() >= snapshot_interval
                && last_index_snapshot < self.raft_group.raft.raft_log.applied
            {
                Self::handle_save_snapshot(&mut self.raft_group, &mut self.state_machine);
                last_save_snapshot = Instant::now();
                last_index_snapshot = self.raft_group.raft.raft_log.applied;
            }

            self.on_ready();
            self.observe_transitions();
        }

        // Nothing in flight may outlive the node: resolve every pending
        // command before the RPC layer loses its responses.
        let hint = Self::leader_hint(&self.raft_group);
        Self::fail_pending(&mut self.proposed, hint);
        self.state_machine.on_shutdown();
    }

    /// Start the raft node and its event loop. Returns the mailbox of
    /// outgoing messages for the peer transport to drain.
    #[allow(clippy::too_many_arguments)]
    pub fn start_raft(
        bootstrap_leader: bool,
        id: u64,
        rx: Receiver<Message>,
        rx_proposals: Receiver<Proposal>,
        shutdown: watch::Receiver<bool>,
        stopped: oneshot::Sender<()>,
        state_machine: S,
        base_path: &str,
    ) -> anyhow::Result<Receiver<Message>> {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger = slog::Logger::root(drain, o!());

        let (sx, out_mailbox) = mpsc::channel(1000);

        let mut node = Node::create(
            id,
            bootstrap_leader,
            sx,
            rx,
            rx_proposals,
            shutdown,
            &logger,
            state_machine,
            base_path,
        )?;

        tokio::spawn(async move {
            node.run_background_tasks().await;
            let _ = stopped.send(());
        });

        Ok(out_mailbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Records applied entries and leadership, nothing else.
    #[derive(Clone, Default)]
    struct TestMachine {
        applied: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
        leading: Arc<AtomicBool>,
    }

    impl StateMachine for TestMachine {
        fn apply(&mut self, index: u64, data: &[u8]) -> bool {
            self.applied.lock().unwrap().push((index, data.to_vec()));
            true
        }
        fn snapshot(&self) -> Vec<u8> {
            Vec::new()
        }
        fn on_snapshot(&mut self, _last_index: u64, _last_term: u64, _data: &[u8]) {}
        fn on_leader_start(&mut self, _term: u64) {
            self.leading.store(true, Ordering::Release);
        }
        fn on_leader_stop(&mut self) {
            self.leading.store(false, Ordering::Release);
        }
        fn on_start_following(&mut self, _leader_id: u64, _term: u64) {}
        fn on_stop_following(&mut self) {}
        fn on_configuration_committed(&mut self, _voters: &[u64]) {}
        fn on_error(&mut self, _desc: &str) {}
        fn on_shutdown(&mut self) {}
    }

    fn discard_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn single_voter_group(dir: &TempDir) -> RawNode<FileStorage> {
        let storage = FileStorage::new(dir.path(), true).unwrap();
        let cfg = default_config(1, storage.commit());
        RawNode::new(&cfg, storage, &discard_logger()).unwrap()
    }

    #[tokio::test]
    async fn test_propose_rejects_stale_term_fence() {
        let dir = TempDir::new().unwrap();
        let mut raft_group = single_voter_group(&dir);
        raft_group.campaign().unwrap();
        assert_eq!(raft_group.raft.state, StateRole::Leader);

        let current_term = raft_group.raft.term;
        let mut proposed = VecDeque::new();

        // A fence captured under an older term must be rejected, never
        // submitted under the new term's authority.
        let (proposal, rx) = Proposal::command(b"stale".to_vec(), current_term - 1);
        Node::<TestMachine>::propose(&mut raft_group, proposal, &mut proposed);
        assert!(proposed.is_empty());
        let outcome = rx.await.unwrap();
        assert!(!outcome.success);

        // The current term passes the fence and is queued for apply.
        let (proposal, mut rx) = Proposal::command(b"fresh".to_vec(), current_term);
        Node::<TestMachine>::propose(&mut raft_group, proposal, &mut proposed);
        assert_eq!(proposed.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_propose_rejects_when_not_leader() {
        let dir = TempDir::new().unwrap();
        let mut raft_group = single_voter_group(&dir);
        assert_ne!(raft_group.raft.state, StateRole::Leader);

        let mut proposed = VecDeque::new();
        let (proposal, rx) = Proposal::command(b"data".to_vec(), 0);
        Node::<TestMachine>::propose(&mut raft_group, proposal, &mut proposed);

        assert!(proposed.is_empty());
        let outcome = rx.await.unwrap();
        assert!(!outcome.success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_node_commit_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let machine = TestMachine::default();
        let applied = machine.applied.clone();
        let leading = machine.leading.clone();

        let (_msg_tx, msg_rx) = mpsc::channel(16);
        let (proposal_tx, proposal_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        let _out_mailbox = Node::start_raft(
            true,
            1,
            msg_rx,
            proposal_rx,
            shutdown_rx,
            stopped_tx,
            machine,
            dir.path().to_str().unwrap(),
        )
        .unwrap();

        // A single-voter group elects itself once the election timeout
        // elapses.
        let deadline = Instant::now() + Duration::from_secs(10);
        while !leading.load(Ordering::Acquire) {
            assert!(Instant::now() < deadline, "node never became leader");
            time::sleep(Duration::from_millis(50)).await;
        }

        let (proposal, rx) = Proposal::command(b"hello".to_vec(), 0);
        proposal_tx.send(proposal).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("proposal not resolved")
            .unwrap();
        assert!(outcome.success);
        assert!(applied
            .lock()
            .unwrap()
            .iter()
            .any(|(_, data)| data == b"hello"));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), stopped_rx)
            .await
            .expect("node did not stop")
            .unwrap();
    }
}
