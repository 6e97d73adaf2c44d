pub mod node;
pub mod proposal;
mod segment;
mod storage;

/// Callback surface the replication substrate drives.
///
/// The substrate owns every transition: the state machine never promotes or
/// demotes itself. `apply` is invoked strictly sequentially, in log order,
/// from the substrate's event loop; the remaining hooks are delivered from
/// the same loop, so implementations need interior synchronization only for
/// state that request-serving tasks read concurrently.
pub trait StateMachine {
    /// Applies one committed entry. Returns whether the command succeeded;
    /// the result is attached to the pending command when this node proposed
    /// the entry. Must not fail the loop: storage errors surface as a false
    /// outcome.
    fn apply(&mut self, index: u64, data: &[u8]) -> bool;

    /// Produces the snapshot payload for log compaction. Durable payload
    /// I/O must happen off the caller's loop.
    fn snapshot(&self) -> Vec<u8>;

    /// Installs a snapshot received from the substrate. Never invoked on an
    /// active leader.
    fn on_snapshot(&mut self, last_index: u64, last_term: u64, data: &[u8]);

    fn on_leader_start(&mut self, term: u64);
    fn on_leader_stop(&mut self);
    fn on_start_following(&mut self, leader_id: u64, term: u64);
    fn on_stop_following(&mut self);
    fn on_configuration_committed(&mut self, voters: &[u64]);
    fn on_error(&mut self, desc: &str);
    fn on_shutdown(&mut self);
}
