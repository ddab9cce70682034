//! CFT cluster scenarios, driven through an in-memory message queue.
//! The channel layer is exercised separately; here frames flow between
//! engines directly, in a controlled order, so elections and rollbacks
//! are deterministic.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use quill_consensus::traits::NullSnapshotter;
use quill_consensus::{CftConsensus, NodeInfo, Outbound};
use quill_kv::{maps, Store, StoreConfig, TxHistory};
use quill_ledger::Ledger;
use quill_merkle::{CommitSource, MerkleHistory};
use quill_model::{crypto, NodeId, NodeRecord, NodeStatus};

const REQUEST_TIMEOUT: u64 = 10;
const ELECTION_TIMEOUT: u64 = 100;

#[derive(Default)]
struct Net {
    queue: Mutex<VecDeque<(NodeId, NodeId, Vec<u8>)>>,
}

struct TestOutbound {
    net: Arc<Net>,
    from: NodeId,
}

impl Outbound for TestOutbound {
    fn send(&self, to: NodeId, msg: &[u8]) -> bool {
        self.net.queue.lock().push_back((self.from, to, msg.to_vec()));
        true
    }
    fn create_channel(&self, _: NodeId, _: &str, _: &str) {}
    fn destroy_channel(&self, _: NodeId) {}
    fn close_all_outgoing(&self) {}
    fn destroy_all(&self) {}
}

struct Replica {
    store: Arc<Store>,
    history: Arc<MerkleHistory>,
    engine: Arc<CftConsensus>,
    _ledger_dir: TempDir,
}

struct Cluster {
    net: Arc<Net>,
    replicas: BTreeMap<NodeId, Replica>,
}

impl Cluster {
    fn new(ids: &[NodeId]) -> Self {
        let net = Arc::new(Net::default());
        let mut replicas = BTreeMap::new();

        let config: BTreeMap<NodeId, NodeInfo> = ids
            .iter()
            .map(|id| {
                (
                    *id,
                    NodeInfo {
                        hostname: "localhost".into(),
                        port: format!("{}", 4640 + id),
                    },
                )
            })
            .collect();

        for id in ids {
            let store = Store::new(StoreConfig::replicated());
            store.create_map("public:app").unwrap();
            let (sk, _) = crypto::signing_key_from_seed(&[*id as u8 + 1; 32]);
            let history = MerkleHistory::new(store.clone(), *id, sk, 1);
            store.set_history(history.clone());

            let ledger_dir = TempDir::new().unwrap();
            let ledger = Ledger::open(ledger_dir.path(), 100_000).unwrap();

            let outbound = Arc::new(TestOutbound {
                net: net.clone(),
                from: *id,
            });

            let engine = CftConsensus::new(
                *id,
                store.clone(),
                Box::new(ledger),
                outbound,
                Arc::new(NullSnapshotter),
                REQUEST_TIMEOUT,
                ELECTION_TIMEOUT,
                false,
            );
            store.set_replication(engine.clone());
            let source: Arc<dyn CommitSource> = engine.clone();
            history.set_commit_source(&source);

            engine.add_configuration(0, config.clone());

            replicas.insert(
                *id,
                Replica {
                    store,
                    history,
                    engine,
                    _ledger_dir: ledger_dir,
                },
            );
        }

        Self { net, replicas }
    }

    fn replica(&self, id: NodeId) -> &Replica {
        &self.replicas[&id]
    }

    /// Deliver queued frames, dropping any whose (from, to) link is
    /// blocked. Returns the number delivered.
    fn deliver(&self, blocked: &[(NodeId, NodeId)]) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.net.queue.lock().pop_front();
            let Some((from, to, frame)) = next else {
                break;
            };
            if blocked.contains(&(from, to)) {
                continue;
            }
            self.replicas[&to].engine.recv_message(&frame);
            delivered += 1;
        }
        delivered
    }

    fn deliver_all(&self) -> usize {
        self.deliver(&[])
    }

    /// Register every node's signing key through the leader's store, so
    /// signature entries verify on every replica after replication.
    fn register_nodes(&self, leader: NodeId) {
        for (id, _) in &self.replicas {
            let (_, pk) = crypto::signing_key_from_seed(&[*id as u8 + 1; 32]);
            let record = NodeRecord {
                node_id: *id,
                public_key: pk,
                hostname: "localhost".into(),
                port: format!("{}", 4640 + id),
                status: NodeStatus::Trusted,
            };
            let mut tx = self.replica(leader).store.create_tx();
            tx.put(maps::NODES, &id.to_le_bytes(), &record.encode());
            assert!(tx.commit().unwrap().is_ok());
        }
    }

    fn put(&self, node: NodeId, key: &[u8], value: &[u8]) {
        let mut tx = self.replica(node).store.create_tx();
        tx.put("public:app", key, value);
        assert!(tx.commit().unwrap().is_ok(), "commit failed");
    }

    /// A leader heartbeat round plus full delivery.
    fn pump(&self, leader: NodeId) {
        self.replica(leader).engine.periodic(REQUEST_TIMEOUT);
        self.deliver_all();
        self.deliver_all();
    }
}

#[test]
fn single_node_auto_commit() {
    let cluster = Cluster::new(&[0]);
    let r = cluster.replica(0);
    r.engine.force_become_leader();
    assert!(r.engine.is_leader());

    let mut tx = r.store.create_tx();
    tx.put("public:app", b"k", b"v");
    let outcome = tx.commit().unwrap();
    assert!(outcome.is_ok());

    assert_eq!(r.store.current_version(), 1);
    assert_eq!(r.engine.get_last_idx(), 1);
    assert_ne!(
        r.history.replicated_state_root(),
        quill_model::Hash::ZERO
    );

    // A signature commits the entry globally on a lone node.
    r.history.emit_signature();
    assert_eq!(r.engine.get_commit_idx(), 2);
    assert_eq!(r.store.commit_version(), 2);
}

#[test]
fn three_node_replication_and_commit() {
    let cluster = Cluster::new(&[0, 1, 2]);
    cluster.replica(0).engine.force_become_leader();
    cluster.register_nodes(0);
    cluster.put(0, b"k", b"v");
    cluster.replica(0).history.emit_signature();

    // Heartbeats carry the entries; responses advance commit.
    cluster.pump(0);
    cluster.pump(0);

    let sig_idx = cluster.replica(0).engine.get_last_idx();
    for id in [0, 1, 2] {
        let r = cluster.replica(id);
        assert_eq!(r.engine.get_last_idx(), sig_idx, "node {}", id);
        assert_eq!(r.engine.get_commit_idx(), sig_idx, "node {}", id);
    }

    // Agreement: bitwise-equal roots everywhere.
    let root = cluster.replica(0).history.replicated_state_root();
    assert_eq!(cluster.replica(1).history.replicated_state_root(), root);
    assert_eq!(cluster.replica(2).history.replicated_state_root(), root);

    // And the replicated application write is visible on follower 2.
    let map = cluster.replica(2).store.get_map_now("public:app").unwrap();
    let v = cluster.replica(2).store.current_version();
    assert_eq!(map.read().read_at(b"k", v).unwrap().value.unwrap(), b"v");
}

#[test]
fn rollback_on_leadership_change() {
    // S2: A replicates 1..=5 (signature at 3); B holds all five, C only
    // the signed prefix. A crashes; B wins the election and rolls back
    // to the last committable index.
    let cluster = Cluster::new(&[0, 1, 2]);
    cluster.replica(0).engine.force_become_leader();
    cluster.register_nodes(0); // versions 1..=3
    cluster.replica(0).history.emit_signature(); // version 4, committable
    cluster.pump(0);
    cluster.pump(0);
    let signed_idx = 4;
    assert_eq!(cluster.replica(0).engine.get_commit_idx(), signed_idx);

    // Two more entries that never get a signature.
    cluster.put(0, b"x", b"1"); // 5
    cluster.put(0, b"y", b"2"); // 6
    // B receives them, C does not.
    cluster.replica(0).engine.periodic(REQUEST_TIMEOUT);
    cluster.deliver(&[(0, 2)]);
    cluster.deliver(&[(0, 2)]);

    assert_eq!(cluster.replica(1).engine.get_last_idx(), 6);
    assert_eq!(cluster.replica(2).engine.get_last_idx(), signed_idx);

    // A crashes; B calls an election. C grants: B's committable log
    // (idx 4) is at least as up to date as C's.
    let blocked = [(1, 0), (0, 1), (0, 2), (2, 0)];
    cluster.replica(1).engine.periodic(ELECTION_TIMEOUT);
    cluster.deliver(&blocked);
    cluster.deliver(&blocked);

    let b = cluster.replica(1);
    assert!(b.engine.is_leader(), "B should win the election");
    // B's first action as leader: discard the unsigned tail.
    assert_eq!(b.engine.get_last_idx(), signed_idx);
    assert_eq!(b.store.current_version(), signed_idx);

    // A rejoins and accepts B's authority, overwriting its tail.
    cluster.replica(1).engine.periodic(REQUEST_TIMEOUT);
    cluster.deliver_all();
    cluster.deliver_all();

    let a = cluster.replica(0);
    assert!(a.engine.is_follower());
    assert_eq!(a.engine.get_last_idx(), signed_idx);
    assert_eq!(
        a.history.replicated_state_root(),
        b.history.replicated_state_root()
    );
}

#[test]
fn follower_catches_up_after_partition() {
    let cluster = Cluster::new(&[0, 1, 2]);
    cluster.replica(0).engine.force_become_leader();
    cluster.register_nodes(0);
    cluster.replica(0).history.emit_signature();

    // Node 2 misses everything for a while.
    cluster.replica(0).engine.periodic(REQUEST_TIMEOUT);
    cluster.deliver(&[(0, 2), (2, 0)]);
    cluster.deliver(&[(0, 2), (2, 0)]);
    assert_eq!(cluster.replica(2).engine.get_last_idx(), 0);

    cluster.put(0, b"late", b"entry");
    cluster.replica(0).history.emit_signature();

    // Partition heals: the log-matching backoff walks node 2 back to
    // index 0 and refills its whole log.
    for _ in 0..8 {
        cluster.pump(0);
    }
    let r2 = cluster.replica(2);
    assert_eq!(
        r2.engine.get_last_idx(),
        cluster.replica(0).engine.get_last_idx()
    );
    assert_eq!(
        r2.history.replicated_state_root(),
        cluster.replica(0).history.replicated_state_root()
    );
}

#[test]
fn vote_denied_to_stale_candidate() {
    let cluster = Cluster::new(&[0, 1, 2]);
    cluster.replica(0).engine.force_become_leader();
    cluster.register_nodes(0);
    cluster.replica(0).history.emit_signature();
    cluster.pump(0);
    cluster.pump(0);

    // Node 2 misses the next signed entry.
    cluster.put(0, b"k", b"v");
    cluster.replica(0).history.emit_signature();
    cluster.replica(0).engine.periodic(REQUEST_TIMEOUT);
    cluster.deliver(&[(0, 2)]);
    cluster.deliver(&[(0, 2)]);

    // With A silent, node 2 (stale) calls an election. B must deny:
    // its committable log is ahead.
    let blocked = [(0, 1), (0, 2), (1, 0), (2, 0)];
    cluster.replica(2).engine.periodic(ELECTION_TIMEOUT);
    cluster.deliver(&blocked);
    cluster.deliver(&blocked);
    assert!(!cluster.replica(2).engine.is_leader());

    // B, with the full committable log, wins instead.
    cluster.replica(1).engine.periodic(ELECTION_TIMEOUT);
    cluster.deliver(&blocked);
    cluster.deliver(&blocked);
    assert!(cluster.replica(1).engine.is_leader());
}

#[test]
fn leader_retires_when_removed_from_configuration() {
    let cluster = Cluster::new(&[0, 1, 2]);
    cluster.replica(0).engine.force_become_leader();
    cluster.register_nodes(0);
    cluster.replica(0).history.emit_signature();
    cluster.pump(0);
    cluster.pump(0);

    // A configuration that drops the leader, effective immediately,
    // followed by commit crossing it.
    let idx = cluster.replica(0).engine.get_last_idx() + 1;
    let remaining: BTreeMap<_, _> = [1u64, 2]
        .into_iter()
        .map(|id| {
            (
                id,
                NodeInfo {
                    hostname: "localhost".into(),
                    port: format!("{}", 4640 + id),
                },
            )
        })
        .collect();
    cluster.replica(0).engine.add_configuration(idx, remaining);

    cluster.put(0, b"post", b"reconf");
    cluster.replica(0).history.emit_signature();
    cluster.pump(0);
    cluster.pump(0);

    assert!(cluster.replica(0).engine.is_retired());
}
