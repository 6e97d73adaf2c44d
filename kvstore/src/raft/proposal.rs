#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot;
use tokio::sync::oneshot::Receiver;
use tokio::sync::oneshot::Sender;

use raft::prelude::*;

use crate::command::Outcome;

/// An in-flight command awaiting its deterministic apply.
///
/// Owned exclusively by the raft driver until resolved exactly once: by the
/// apply path on commit, or by a rejection path (not leader, stale term
/// fence, shutdown). The reply sender hands the outcome back to the RPC
/// layer.
pub struct Proposal {
    /// Encoded command payload for the replicated log.
    pub data: Option<Vec<u8>>,
    /// Membership change instead of a command.
    pub conf_change: Option<ConfChange>,
    /// Term observed when the request was accepted; 0 disables the fence.
    pub expected_term: u64,
    /// Log index assigned at submission time.
    pub proposed: u64,
    reply: Option<Sender<Outcome>>,
}

impl Proposal {
    pub fn command(data: Vec<u8>, expected_term: u64) -> (Self, Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            data: Some(data),
            conf_change: None,
            expected_term,
            proposed: 0,
            reply: Some(tx),
        };
        (proposal, rx)
    }

    pub fn conf_change(cc: &ConfChange) -> (Self, Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            data: None,
            conf_change: Some(cc.clone()),
            expected_term: 0,
            proposed: 0,
            reply: Some(tx),
        };
        (proposal, rx)
    }

    /// Resolves the pending command. Safe to call more than once; only the
    /// first resolution reaches the RPC layer.
    pub fn resolve(&mut self, outcome: Outcome) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_proposal_resolves_once() {
        let (mut proposal, rx) = Proposal::command(b"payload".to_vec(), 3);
        assert_eq!(proposal.expected_term, 3);

        proposal.resolve(Outcome::applied(true));
        // Second resolution is a no-op, not a panic.
        proposal.resolve(Outcome::applied(false));

        let outcome = rx.await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn test_dropped_proposal_closes_channel() {
        let (proposal, rx) = Proposal::command(Vec::new(), 1);
        drop(proposal);
        assert!(rx.await.is_err());
    }
}
