//! Client-side routing: group resolution, leader discovery, and
//! redirect-aware dispatch.
//!
//! Every operation runs the same loop: resolve the group, find a leader
//! (cached or freshly discovered), dispatch, and react to failures by
//! invalidating the cache and backing off, or by following a redirect
//! immediately. The route cache is never authoritative; the worst a racing
//! update can produce is a stale entry that the next failure invalidates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tonic::transport::Channel;

use crate::pb::key_value_service_client::KeyValueServiceClient;
use crate::pb::{GetRequest, InsertRequest, LeaderRequest};

pub const OP_READ: u32 = 0;
pub const OP_WRITE: u32 = 1;
pub const OP_DELETE: u32 = 2;
pub const OP_MODIFY: u32 = 3;

/// Maps a key to its replication group. Stable: the same key always lands
/// in the same group for a fixed group count, so re-sharding requires an
/// explicit, coordinated group-count change.
pub struct GroupDirectory {
    base: String,
    group_count: u64,
}

impl GroupDirectory {
    pub fn new(base: &str, group_count: u32) -> GroupDirectory {
        GroupDirectory {
            base: base.to_string(),
            group_count: group_count.max(1) as u64,
        }
    }

    pub fn resolve(&self, key: &[u8]) -> String {
        format!("{}_{}", self.base, fxhash::hash64(&key) % self.group_count)
    }
}

/// Process-local leader cache per group. Not authoritative; always subject
/// to invalidation on failure.
#[derive(Default)]
pub struct RouteTable {
    entries: Mutex<HashMap<String, String>>,
}

impl RouteTable {
    pub fn select_leader(&self, group: &str) -> Option<String> {
        self.entries.lock().unwrap().get(group).cloned()
    }

    /// Records a new leader, or invalidates the entry when `None`.
    pub fn update_leader(&self, group: &str, leader: Option<String>) {
        let mut entries = self.entries.lock().unwrap();
        match leader {
            Some(addr) => {
                entries.insert(group.to_string(), addr);
            }
            None => {
                entries.remove(group);
            }
        }
    }
}

struct WireReply {
    success: bool,
    redirect: Option<String>,
    value: Vec<u8>,
}

pub struct Router {
    directory: GroupDirectory,
    routes: RouteTable,
    /// Configured peers of the replication group, used for leader refresh.
    peers: Vec<String>,
    timeout: Duration,
    conns: Mutex<HashMap<String, KeyValueServiceClient<Channel>>>,
    quit: Arc<AtomicBool>,
}

impl Router {
    pub fn new(
        directory: GroupDirectory,
        peers: Vec<String>,
        timeout_ms: u64,
        quit: Arc<AtomicBool>,
    ) -> Router {
        Router {
            directory,
            routes: RouteTable::default(),
            peers,
            timeout: Duration::from_millis(timeout_ms),
            conns: Mutex::new(HashMap::new()),
            quit,
        }
    }

    /// Dispatches one operation, retrying until it succeeds or the process
    /// is asked to quit. Returns the value for READ, empty otherwise.
    ///
    /// Retried mutations are not deduplicated: a retry after a lost
    /// response can apply the same mutation twice.
    pub async fn dispatch(&self, op: u32, key: &[u8], value: &[u8]) -> anyhow::Result<Vec<u8>> {
        // A command outside the op vocabulary can never succeed; surface it
        // without retrying.
        anyhow::ensure!(op <= OP_MODIFY, "unsupported op code {}", op);

        let group = self.directory.resolve(key);
        while !self.quit.load(Ordering::Relaxed) {
            // Find a leader candidate: cached, or discovered from the peers.
            let leader = match self.routes.select_leader(&group) {
                Some(addr) => addr,
                None => match self.refresh_leader(&group).await {
                    Some(addr) => {
                        self.routes.update_leader(&group, Some(addr.clone()));
                        addr
                    }
                    None => {
                        log::warn!("failed to refresh leader for {}", group);
                        self.backoff().await;
                        continue;
                    }
                },
            };

            let mut client = match self.connect(&leader).await {
                Ok(client) => client,
                Err(e) => {
                    log::warn!("failed to connect to {}: {}", leader, e);
                    self.routes.update_leader(&group, None);
                    self.backoff().await;
                    continue;
                }
            };

            match self.send(&mut client, op, key, value).await {
                Err(e) => {
                    // Transport failure: this leader may be gone; force a
                    // fresh discovery on the next iteration.
                    log::warn!("request to {} failed: {}", leader, e);
                    self.drop_conn(&leader);
                    self.routes.update_leader(&group, None);
                    self.backoff().await;
                }
                Ok(reply) if !reply.success => match reply.redirect {
                    Some(next) if !next.is_empty() => {
                        // Trust the redirect and retry immediately.
                        log::info!("redirected from {} to {}", leader, next);
                        self.routes.update_leader(&group, Some(next));
                    }
                    _ => {
                        self.routes.update_leader(&group, None);
                        self.backoff().await;
                    }
                },
                Ok(reply) => return Ok(reply.value),
            }
        }
        anyhow::bail!("asked to quit before the request completed")
    }

    async fn send(
        &self,
        client: &mut KeyValueServiceClient<Channel>,
        op: u32,
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<WireReply> {
        if op == OP_READ {
            let request = tonic::Request::new(GetRequest { key: key.to_vec() });
            let response = tokio::time::timeout(self.timeout, client.get(request))
                .await??
                .into_inner();
            Ok(WireReply {
                success: response.success,
                redirect: response.redirect,
                value: response.value,
            })
        } else {
            let request = tonic::Request::new(InsertRequest {
                key: key.to_vec(),
                op,
                value: value.to_vec(),
            });
            let response = tokio::time::timeout(self.timeout, client.insert(request))
                .await??
                .into_inner();
            Ok(WireReply {
                success: response.success,
                redirect: response.redirect,
                value: Vec::new(),
            })
        }
    }

    /// Queries each configured peer for the group's leader. This is a real
    /// network round-trip with its own timeout per peer, never assumed
    /// instantaneous or reliable.
    async fn refresh_leader(&self, group: &str) -> Option<String> {
        for peer in &self.peers {
            let mut client = match self.connect(peer).await {
                Ok(client) => client,
                Err(e) => {
                    log::debug!("leader query connect to {} failed: {}", peer, e);
                    continue;
                }
            };
            let request = tonic::Request::new(LeaderRequest {
                group: group.to_string(),
            });
            match tokio::time::timeout(self.timeout, client.get_leader(request)).await {
                Ok(Ok(response)) => {
                    let response = response.into_inner();
                    if response.success && !response.leader.is_empty() {
                        return Some(response.leader);
                    }
                }
                Ok(Err(status)) => {
                    log::debug!("leader query to {} failed: {}", peer, status);
                    self.drop_conn(peer);
                }
                Err(_) => log::debug!("leader query to {} timed out", peer),
            }
        }
        None
    }

    async fn connect(&self, addr: &str) -> anyhow::Result<KeyValueServiceClient<Channel>> {
        if let Some(client) = self.conns.lock().unwrap().get(addr) {
            return Ok(client.clone());
        }
        let client = tokio::time::timeout(
            self.timeout,
            KeyValueServiceClient::connect(addr.to_string()),
        )
        .await??;
        self.conns
            .lock()
            .unwrap()
            .insert(addr.to_string(), client.clone());
        Ok(client)
    }

    fn drop_conn(&self, addr: &str) {
        self.conns.lock().unwrap().remove(addr);
    }

    async fn backoff(&self) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
        tokio::time::sleep(self.timeout + jitter).await;
    }
}
