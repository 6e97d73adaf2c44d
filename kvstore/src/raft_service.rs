//! Raft transport service.
//!
//! Receives streamed raft messages from peer nodes and forwards them into
//! the local node's mailbox.

use crate::server;
use pb::raft_service_server::RaftService;
use pb::{PostDataRequest, PostDataResponse, ResultCode};
use protobuf::Message;
use raft::prelude::Message as RaftMessage;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

#[derive(Debug, Default)]
pub struct RaftServiceSVC {}

#[tonic::async_trait]
impl RaftService for RaftServiceSVC {
    async fn post_data(
        &self,
        request: tonic::Request<tonic::Streaming<PostDataRequest>>,
    ) -> Result<tonic::Response<PostDataResponse>, tonic::Status> {
        let mut stream = request.into_inner();
        let mut response = PostDataResponse::default();
        while let Some(frame) = stream.message().await? {
            match RaftMessage::parse_from_bytes(frame.data.as_slice()) {
                Ok(message) => {
                    let mailbox = server::instance().lock().await.in_mailbox.clone();
                    match mailbox.try_send(message) {
                        Ok(_) => {
                            response.push_ret(ResultCode::Ok);
                        }
                        Err(e) => {
                            // Dropped messages are retried by raft itself.
                            log::warn!("raft mailbox send error: {}", e);
                            response.push_ret(ResultCode::Fail);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("raft message parse error: {}", e);
                    response.push_ret(ResultCode::Fail);
                }
            }
        }
        Ok(tonic::Response::new(response))
    }
}
