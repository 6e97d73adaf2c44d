//! Process assembly: wires the store, state machine, raft node, peer
//! transport, and the gRPC/metrics servers together.

use crate::config;
use crate::kv_service::pb::key_value_service_server::KeyValueServiceServer;
use crate::kv_service::KeyValueSVC;
use crate::metrics;
use crate::raft::proposal::Proposal;
use crate::raft_client;
use crate::raft_service::pb::raft_service_server::RaftServiceServer;
use crate::raft_service::RaftServiceSVC;
use crate::snapshot::SnapshotManager;
use crate::state_kv::StateKv;
use crate::store::KvStore;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use once_cell::sync::OnceCell;
use prometheus::{Encoder, TextEncoder};
use raft::eraftpb::Message;
use std::path::Path;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::time::Duration;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static INSTANCE: OnceCell<Mutex<Server>> = OnceCell::new();

/// Builds the process-wide server. Initialization failures (storage engine,
/// raft state reload) are fatal at startup, before any request is served.
pub fn init() -> anyhow::Result<()> {
    let server = Server::builder()?;
    INSTANCE
        .set(Mutex::new(server))
        .map_err(|_| anyhow::anyhow!("server already initialized"))?;
    Ok(())
}

pub fn instance() -> &'static Mutex<Server> {
    INSTANCE.get().expect("server not initialized")
}

pub struct Server {
    pub(crate) in_mailbox: Sender<Message>, // <- other nodes
    proposals: Sender<Proposal>,
    state: StateKv,
    shutdown: watch::Sender<bool>,
    stopped: Option<oneshot::Receiver<()>>,
}

impl Server {
    fn builder() -> anyhow::Result<Self> {
        let cfg = config::instance().lock().unwrap().clone();
        let data_path = Path::new(&cfg.data_path);

        let store = KvStore::open(data_path.join("db"))?;
        let snapshots = SnapshotManager::new(data_path.join("snapshot"))?;
        let state = StateKv::new(store, snapshots);

        let (in_mailbox, rx) = mpsc::channel(1024);
        let (proposals, rx_proposals) = mpsc::channel(1024);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = oneshot::channel();

        let out_mailbox = crate::raft::node::Node::start_raft(
            cfg.start_with_leader,
            cfg.id,
            rx,
            rx_proposals,
            shutdown_rx,
            stopped_tx,
            state.clone(),
            &cfg.data_path,
        )?;
        Self::start_run_out_message(out_mailbox);

        Ok(Server {
            in_mailbox,
            proposals,
            state,
            shutdown,
            stopped: Some(stopped_rx),
        })
    }

    /// Handle for the request-serving paths. Clones share the leadership
    /// state and the underlying store.
    pub fn state(&self) -> StateKv {
        self.state.clone()
    }

    pub async fn start(&mut self) {
        self.start_grpc_server().await;
        self.start_metrics_server().await;
        self.bootstrap_followers().await;
    }

    /// Request shutdown and wait for the raft node to drain its in-flight
    /// commands, bounded by a grace period.
    pub async fn stop(&mut self) {
        log::info!("server stop requested");
        let _ = self.shutdown.send(true);
        if let Some(stopped) = self.stopped.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, stopped).await.is_err() {
                log::warn!("raft node did not stop within {:?}", SHUTDOWN_GRACE);
            }
        }
    }

    pub async fn add_proposal(&self, proposal: Proposal) {
        if self.proposals.send(proposal).await.is_err() {
            log::error!("proposal channel closed");
        }
    }

    async fn start_grpc_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .addr
            .as_str()
            .parse()
            .expect("invalid listen addr");
        let mut server = tonic::transport::Server::builder();
        let raft_service = RaftServiceSVC::default();
        let kv_service = KeyValueSVC::default();
        let grpc_server = server
            .add_service(RaftServiceServer::new(raft_service))
            .add_service(KeyValueServiceServer::new(kv_service))
            .serve(addr);
        tokio::spawn(async move {
            if let Err(e) = grpc_server.await {
                log::error!("grpc server exited: {}", e);
            }
        });
        log::info!("grpc server started on {}", addr);
    }

    async fn start_metrics_server(&mut self) {
        let addr = config::instance()
            .lock()
            .unwrap()
            .metrics_addr
            .as_str()
            .parse()
            .expect("invalid metrics addr");
        let make_svc = make_service_fn(move |_| {
            let registry = metrics::REGISTRY_INSTANCE.clone();
            async move {
                Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                    let registry = registry.clone();
                    async move {
                        let encoder = TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut buffer = Vec::new();
                        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                            log::error!("failed to encode metrics: {}", e);
                        }
                        Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                    }
                }))
            }
        });
        metrics::init_registry();
        let server = hyper::Server::bind(&addr).serve(make_svc);
        tokio::spawn(async move {
            if let Err(e) = server.await {
                log::error!("metrics server exited: {}", e);
            }
        });
        log::info!("metrics server started on {}", addr);
    }

    /// Drain outgoing raft messages into the peer transport. Each message is
    /// dispatched on its own task so one slow peer never blocks the rest.
    fn start_run_out_message(mut out_mailbox: Receiver<Message>) {
        tokio::spawn(async move {
            let client = raft_client::RaftClient::builder();
            while let Some(msg) = out_mailbox.recv().await {
                let client = client.clone();
                tokio::spawn(async move {
                    client.post_data(msg).await;
                });
            }
        });
    }

    /// When bootstrapping a fresh group as its initial leader, add the
    /// other configured nodes through membership changes.
    async fn bootstrap_followers(&self) {
        let cfg = config::instance().lock().unwrap().clone();
        if !cfg.start_with_leader {
            return;
        }

        let ids: Vec<u64> = cfg
            .node_list
            .iter()
            .map(|n| n.id)
            .filter(|id| *id != cfg.id)
            .collect();
        if ids.is_empty() {
            return;
        }

        let proposals = self.proposals.clone();
        tokio::spawn(async move {
            crate::raft::node::add_all_followers(ids, &proposals).await;
        });
    }
}
