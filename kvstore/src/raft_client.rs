//! Raft transport client.
//!
//! Maintains one streaming connection per peer node and forwards outgoing
//! raft messages onto it. A broken stream marks the peer client invalid so
//! the next message reconnects.

use crate::config;
use pb::raft_service_client::RaftServiceClient;
use pb::PostDataRequest;
use protobuf::Message;
use raft::prelude::Message as RaftMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::Mutex;

#[allow(clippy::module_inception)]
pub mod pb {
    tonic::include_proto!("raft");
}

/// Client for a single peer node.
struct PeerClient {
    sender: Sender<PostDataRequest>,
    /// Set when the stream breaks; the peer entry is discarded and rebuilt.
    invalid: Arc<AtomicBool>,
}

impl PeerClient {
    async fn new(addr: String) -> Result<Self, tonic::transport::Error> {
        let client = RaftServiceClient::connect(addr).await?;
        let (sender, receiver) = mpsc::channel(1000);

        let mut client_clone = client.clone();
        let invalid = Arc::new(AtomicBool::new(false));
        let invalid_clone = invalid.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::stream_messages(&mut client_clone, receiver).await {
                log::error!("streaming raft messages failed: {}", e);
                invalid_clone.store(true, Ordering::SeqCst);
            }
        });

        Ok(Self { sender, invalid })
    }

    async fn stream_messages(
        client: &mut RaftServiceClient<tonic::transport::Channel>,
        receiver: Receiver<PostDataRequest>,
    ) -> Result<(), tonic::Status> {
        let stream = tokio_stream::wrappers::ReceiverStream::new(receiver);
        let _ = client.post_data(stream).await?;
        Ok(())
    }
}

/// Client managing connections to all peer nodes.
#[derive(Clone)]
pub struct RaftClient {
    peers: Arc<Mutex<std::collections::HashMap<u64, PeerClient>>>,
}

impl RaftClient {
    pub fn builder() -> RaftClient {
        RaftClient {
            peers: Arc::new(Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Send a raft message to the peer it is addressed to, connecting on
    /// first use. Losing a message here is fine; raft will retry.
    pub async fn post_data(&self, data: RaftMessage) {
        let peers = self.peers.clone();
        let mut peers = peers.lock().await;

        let peer_client = if let Some(client) = peers.get_mut(&data.to) {
            client
        } else {
            let addr = match config::instance().lock().unwrap().peer_addr(data.to) {
                Some(addr) => addr,
                None => {
                    log::error!("no configured address for peer {}", data.to);
                    return;
                }
            };
            match PeerClient::new(addr).await {
                Ok(client) => {
                    peers.insert(data.to, client);
                    peers.get_mut(&data.to).unwrap()
                }
                Err(e) => {
                    log::error!("failed to create peer client for {}: {}", data.to, e);
                    return;
                }
            }
        };

        if peer_client.invalid.load(Ordering::SeqCst) {
            peers.remove(&data.to);
            return;
        }

        let request = match data.write_to_bytes() {
            Ok(bytes) => PostDataRequest { data: bytes },
            Err(e) => {
                log::error!("failed to encode raft message: {}", e);
                return;
            }
        };
        if peer_client.sender.try_send(request).is_err() {
            // Stream backlog full; raft will retransmit.
        }
    }
}
