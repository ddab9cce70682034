//! Node wiring
//!
//! Builds a replica out of the subsystem crates and carries the glue
//! the engine needs: an [`Outbound`] that frames messages through the
//! channel manager into an outbox, and a local hook on the nodes map
//! that turns committed node records into consensus configurations.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use quill_channel::ChannelManager;
use quill_consensus::messages::Request;
use quill_consensus::{
    BftConsensus, CftConsensus, KvExecutor, NodeInfo, Outbound, ProgressTracker,
};
use quill_kv::{encryptor::TxEncryptor, maps, Store, StoreConfig, Transaction};
use quill_ledger::Ledger;
use quill_merkle::{CommitSource, MerkleHistory};
use quill_model::{crypto, NodeId, NodeRecord, NodeStatus, Version};

use crate::config::{Mode, NodeConfig};
use crate::snapshotter::NodeSnapshotter;
use crate::NodeError;

/// Frames handed to the host transport: a dispatch queue the host
/// drains from its own thread (`blocking_recv` or `try_recv`).
pub type OutboxReceiver = mpsc::UnboundedReceiver<(NodeId, Vec<u8>)>;

struct ChannelOutbound {
    channels: Arc<ChannelManager>,
    outbox: mpsc::UnboundedSender<(NodeId, Vec<u8>)>,
    /// Send lane for engine traffic; worker threads use their own.
    lane: u8,
}

impl Outbound for ChannelOutbound {
    fn send(&self, to: NodeId, msg: &[u8]) -> bool {
        match self.channels.send_authenticated(to, self.lane, msg) {
            Ok(frame) => self.outbox.send((to, frame)).is_ok(),
            Err(e) => {
                debug!(to, error = %e, "cannot frame message");
                false
            }
        }
    }

    fn create_channel(&self, peer: NodeId, hostname: &str, port: &str) {
        debug!(peer, hostname, port, "channel requested");
        if let Err(e) = self.channels.create_channel(peer) {
            warn!(peer, error = %e, "cannot create channel");
        }
    }

    fn destroy_channel(&self, peer: NodeId) {
        self.channels.close_channel(peer);
    }

    fn close_all_outgoing(&self) {
        self.channels.close_all_outgoing();
    }

    fn destroy_all(&self) {
        self.channels.destroy_all();
    }
}

pub enum Engine {
    Cft(Arc<CftConsensus>),
    Bft(Arc<BftConsensus>),
}

pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<Store>,
    pub history: Arc<MerkleHistory>,
    pub channels: Arc<ChannelManager>,
    pub snapshotter: Arc<NodeSnapshotter>,
    pub engine: Engine,
    outbox_rx: Mutex<OutboxReceiver>,
    /// Accumulated view of the nodes map, maintained by its local hook.
    peer_registry: Arc<Mutex<BTreeMap<NodeId, NodeInfo>>>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Result<Self, NodeError> {
        let node_id = config.node_id;

        let store = Store::new(StoreConfig::replicated());

        let encryptor = Arc::new(TxEncryptor::new(
            node_id as u32,
            NodeConfig::seed(&config.ledger_key)?,
        ));
        store.set_encryptor(encryptor);

        let (signing_key, _) =
            crypto::signing_key_from_seed(&NodeConfig::seed(&config.signing_key_seed)?);
        let history = MerkleHistory::new(
            store.clone(),
            node_id,
            signing_key,
            config.sig_tx_interval,
        );
        store.set_history(history.clone());

        let (network_key, _) =
            crypto::signing_key_from_seed(&NodeConfig::seed(&config.network_key_seed)?);
        let channels = Arc::new(ChannelManager::new(network_key));

        let ledger = Ledger::open(&config.ledger_dir, config.chunk_threshold)?;
        let snapshotter = NodeSnapshotter::new(
            store.clone(),
            config.snapshots_dir.clone(),
            config.snapshot_tx_interval,
        );

        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let outbound = Arc::new(ChannelOutbound {
            channels: channels.clone(),
            outbox: outbox_tx,
            lane: 0,
        });

        let initial_nodes: BTreeMap<NodeId, NodeInfo> = config
            .peers
            .iter()
            .map(|p| {
                (
                    p.node_id,
                    NodeInfo {
                        hostname: p.hostname.clone(),
                        port: p.port.clone(),
                    },
                )
            })
            .collect();

        let peer_registry = Arc::new(Mutex::new(BTreeMap::new()));

        let engine = match config.mode {
            Mode::Cft => {
                let engine = CftConsensus::new(
                    node_id,
                    store.clone(),
                    Box::new(ledger),
                    outbound,
                    snapshotter.clone(),
                    config.request_timeout_ms,
                    config.election_timeout_ms,
                    false,
                );
                store.set_replication(engine.clone());
                let source: Arc<dyn CommitSource> = engine.clone();
                history.set_commit_source(&source);

                engine.add_configuration(0, initial_nodes.clone());
                Self::install_nodes_hook(&store, &engine, &peer_registry);
                Engine::Cft(engine)
            }
            Mode::Bft => {
                let progress = ProgressTracker::new(node_id, store.clone());
                let engine = BftConsensus::new(
                    node_id,
                    initial_nodes.keys().copied().collect(),
                    store.clone(),
                    history.clone(),
                    Box::new(ledger),
                    outbound,
                    snapshotter.clone(),
                    Arc::new(KvExecutor),
                    progress,
                    config.view_change_timeout_ms,
                    config.checkpoint_interval,
                );
                store.set_replication(engine.clone());
                let source: Arc<dyn CommitSource> = engine.clone();
                history.set_commit_source(&source);
                Engine::Bft(engine)
            }
        };

        *peer_registry.lock() = initial_nodes.clone();

        // Channels toward every initial peer.
        for peer in initial_nodes.keys() {
            if *peer != node_id {
                channels.create_channel(*peer)?;
            }
        }

        info!(node_id, mode = ?config.mode, "node constructed");

        Ok(Self {
            config,
            store,
            history,
            channels,
            snapshotter,
            engine,
            outbox_rx: Mutex::new(outbox_rx),
            peer_registry,
        })
    }

    /// Committed writes to the nodes map become consensus
    /// configurations: trusted nodes join, retired nodes leave.
    fn install_nodes_hook(
        store: &Arc<Store>,
        engine: &Arc<CftConsensus>,
        registry: &Arc<Mutex<BTreeMap<NodeId, NodeInfo>>>,
    ) {
        let map = store
            .get_map_now(maps::NODES)
            .expect("nodes map exists from genesis");
        let engine = engine.clone();
        let registry = registry.clone();

        map.write().set_local_hook(Arc::new(move |version, writes| {
            let mut changed = false;
            {
                let mut registry = registry.lock();
                for (_, value) in writes {
                    let Some(value) = value else { continue };
                    let Ok(record) = NodeRecord::decode(value) else {
                        warn!(version, "undecodable node record");
                        continue;
                    };
                    match record.status {
                        NodeStatus::Retired => {
                            changed |= registry.remove(&record.node_id).is_some();
                        }
                        NodeStatus::Trusted | NodeStatus::Pending => {
                            let info = NodeInfo {
                                hostname: record.hostname,
                                port: record.port,
                            };
                            changed |= registry.insert(record.node_id, info).is_none();
                        }
                    }
                }
            }
            if changed {
                let nodes = registry.lock().clone();
                debug!(version, nodes = nodes.len(), "configuration change");
                engine.add_configuration(version, nodes);
            }
        }));
    }

    pub fn id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn create_tx(&self) -> Transaction {
        self.store.create_tx()
    }

    /// An inbound frame from the host transport: channel-verified, then
    /// dispatched to the engine.
    pub fn recv_frame(&self, from: NodeId, frame: &[u8]) -> Result<(), NodeError> {
        let msg = self.channels.recv_authenticated(from, frame)?.to_vec();
        match &self.engine {
            Engine::Cft(e) => e.recv_message(&msg),
            Engine::Bft(e) => e.recv_message(&msg),
        }
        Ok(())
    }

    /// A client request (BFT ordering). Returns false when the replica
    /// is not in a view that accepts requests.
    pub fn on_request(&self, request: Request) -> bool {
        match &self.engine {
            Engine::Bft(e) => e.on_request(request),
            Engine::Cft(_) => false,
        }
    }

    /// Drive timers, signature emission, and snapshot generation.
    pub fn periodic(&self, elapsed_ms: u64) {
        match &self.engine {
            Engine::Cft(e) => {
                e.periodic(elapsed_ms);
                // Periodic signatures are a CFT concern; BFT batches
                // carry their own signed evidence per pre-prepare.
                self.history.try_emit_signature();
            }
            Engine::Bft(e) => e.periodic(elapsed_ms),
        }
        self.snapshotter.flush();
    }

    /// Frames awaiting the host transport.
    pub fn drain_outbox(&self) -> Vec<(NodeId, Vec<u8>)> {
        let mut rx = self.outbox_rx.lock();
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    /// Our signed channel public for `peer`, to be carried by the host
    /// during join.
    pub fn handshake(&self, peer: NodeId) -> Result<Option<Vec<u8>>, NodeError> {
        Ok(self.channels.own_signed_public(peer)?)
    }

    /// The peer's signed channel public arrived; establish the channel.
    pub fn accept_handshake(&self, peer: NodeId, signed_public: &[u8]) -> Result<(), NodeError> {
        self.channels.load_peer_signed_public(peer, signed_public)?;
        Ok(())
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.peer_registry.lock().keys().copied().collect()
    }

    pub fn committed_version(&self) -> Version {
        self.store.commit_version()
    }
}
