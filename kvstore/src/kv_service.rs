//! Key-value gRPC service: the client-facing wire contract.
//!
//! `Insert` carries WRITE/DELETE/MODIFY mutations into the replicated log
//! and answers once the command has been applied (or rejected). `Get` is
//! answered from local storage by the confirmed leader only. Both redirect
//! to the believed leader when this node cannot serve.

use pb::key_value_service_server::KeyValueService;
use pb::{
    GetRequest, GetResponse, InsertRequest, InsertResponse, LeaderRequest, LeaderResponse,
};

use crate::command::Command;
use crate::config;
use crate::metrics;
use crate::raft::proposal::Proposal;
use crate::server;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("keyvalue");
}

#[derive(Debug, Default)]
pub struct KeyValueSVC {}

#[tonic::async_trait]
impl KeyValueService for KeyValueSVC {
    /// Proposes a mutation to the replication group.
    ///
    /// Leadership is checked at receipt to fail fast, and the observed term
    /// is attached as a fence; the proposal path re-checks both at
    /// submission time, since leadership may change in between.
    async fn insert(
        &self,
        request: tonic::Request<InsertRequest>,
    ) -> Result<tonic::Response<InsertResponse>, tonic::Status> {
        metrics::record_metrics("insert", || async {
            let req = request.into_inner();
            log::debug!("insert op {} key len {}", req.op, req.key.len());

            let state = server::instance().lock().await.state();
            let term = state.leader_term();
            if term <= 0 {
                return Ok(tonic::Response::new(InsertResponse {
                    success: false,
                    redirect: state.known_leader_addr(),
                }));
            }

            let cmd = Command::new(req.op, req.key, req.value);
            let data = cmd
                .encode()
                .map_err(|_| tonic::Status::internal("serialize error"))?;

            let check_term = config::instance().lock().unwrap().check_term;
            let expected_term = if check_term { term as u64 } else { 0 };
            let (proposal, rx) = Proposal::command(data, expected_term);
            server::instance().lock().await.add_proposal(proposal).await;

            let outcome = rx
                .await
                .map_err(|_| tonic::Status::internal("replication error"))?;
            Ok(tonic::Response::new(InsertResponse {
                success: outcome.success,
                redirect: outcome.redirect,
            }))
        })
        .await
    }

    /// Leader-confirmed read. A replica not confirmed as leader redirects
    /// rather than answering from its possibly stale local copy. A missing
    /// key maps to an empty value with success.
    async fn get(
        &self,
        request: tonic::Request<GetRequest>,
    ) -> Result<tonic::Response<GetResponse>, tonic::Status> {
        metrics::record_metrics("get", || async {
            let req = request.into_inner();
            let state = server::instance().lock().await.state();

            if !state.is_leader() {
                return Ok(tonic::Response::new(GetResponse {
                    success: false,
                    value: Vec::new(),
                    redirect: state.known_leader_addr(),
                }));
            }

            match state.read_local(&req.key) {
                Ok(value) => Ok(tonic::Response::new(GetResponse {
                    success: true,
                    value: value.unwrap_or_default(),
                    redirect: None,
                })),
                Err(e) => {
                    log::error!("read failed: {}", e);
                    Err(tonic::Status::internal("storage error"))
                }
            }
        })
        .await
    }

    /// Leader-refresh primitive for client routers: answers with the
    /// currently believed leader of this group.
    async fn get_leader(
        &self,
        request: tonic::Request<LeaderRequest>,
    ) -> Result<tonic::Response<LeaderResponse>, tonic::Status> {
        let req = request.into_inner();
        log::debug!("leader query for group {}", req.group);

        let state = server::instance().lock().await.state();
        let response = match state.known_leader_addr() {
            Some(leader) => LeaderResponse {
                success: true,
                leader,
            },
            None => LeaderResponse {
                success: false,
                leader: String::new(),
            },
        };
        Ok(tonic::Response::new(response))
    }
}
