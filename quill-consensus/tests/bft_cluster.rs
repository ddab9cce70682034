//! BFT cluster scenarios over an in-memory message queue: normal-case
//! three-phase ordering, view change on a stalled primary, and
//! rejection of a primary whose claimed root does not reproduce.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use quill_consensus::messages::{Message, PrePrepare, Request};
use quill_consensus::traits::NullSnapshotter;
use quill_consensus::{BftConsensus, KvExecutor, KvRequest, Outbound, ProgressTracker};
use quill_kv::{maps, Store, StoreConfig, TxHistory};
use quill_ledger::Ledger;
use quill_merkle::MerkleHistory;
use quill_model::{crypto, Hash, NodeId, NodeRecord, NodeStatus};

const VC_TIMEOUT: u64 = 100;
const CHECKPOINT_INTERVAL: u64 = 2;

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
    engine: Arc<BftConsensus>,
    _ledger_dir: TempDir,
}

struct Cluster {
    net: Arc<Net>,
    replicas: BTreeMap<NodeId, Replica>,
}

impl Cluster {
    fn new(n: u64) -> Self {
        let net = Arc::new(Net::default());
        let ids: Vec<NodeId> = (0..n).collect();
        let mut replicas = BTreeMap::new();

        for id in &ids {
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

            let progress = ProgressTracker::new(*id, store.clone());
            let engine = BftConsensus::new(
                *id,
                ids.clone(),
                store.clone(),
                history.clone(),
                Box::new(ledger),
                outbound,
                Arc::new(NullSnapshotter),
                Arc::new(KvExecutor),
                progress,
                VC_TIMEOUT,
                CHECKPOINT_INTERVAL,
            );
            store.set_replication(engine.clone());

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

    fn deliver(&self, blocked: &[(NodeId, NodeId)]) -> usize {
        self.deliver_where(|from, to, _| !blocked.contains(&(from, to)))
    }

    fn deliver_all(&self) -> usize {
        self.deliver_where(|_, _, _| true)
    }

    /// Deliver until the queue drains, keeping only frames the filter
    /// accepts.
    fn deliver_where(&self, keep: impl Fn(NodeId, NodeId, &[u8]) -> bool) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.net.queue.lock().pop_front();
            let Some((from, to, frame)) = next else {
                break;
            };
            if !keep(from, to, &frame) {
                continue;
            }
            self.replicas[&to].engine.recv_message(&frame);
            delivered += 1;
        }
        delivered
    }

    fn request(&self, id: u64, key: &[u8], value: &[u8]) -> Request {
        Request {
            request_id: id,
            payload: KvRequest {
                map: "public:app".into(),
                key: key.to_vec(),
                value: Some(value.to_vec()),
            }
            .encode(),
        }
    }
}

/// View 1 of a fresh 4-node cluster is led by node 1 (view mod n).
fn primary_of_fresh_cluster() -> NodeId {
    1
}

/// A request registering a node's signing key in the nodes map.
fn register_request(request_id: u64, node: NodeId) -> Request {
    let (_, pk) = crypto::signing_key_from_seed(&[node as u8 + 1; 32]);
    let record = NodeRecord {
        node_id: node,
        public_key: pk,
        hostname: "localhost".into(),
        port: format!("{}", 4640 + node),
        status: NodeStatus::Trusted,
    };
    Request {
        request_id,
        payload: KvRequest {
            map: maps::NODES.into(),
            key: node.to_le_bytes().to_vec(),
            value: Some(record.encode()),
        }
        .encode(),
    }
}

#[test]
fn three_phase_ordering_commits_once() {
    let cluster = Cluster::new(4);
    let primary = primary_of_fresh_cluster();
    assert!(cluster.replica(primary).engine.is_primary());

    let req = cluster.request(1, b"k", b"v");
    assert!(cluster.replica(primary).engine.on_request(req));

    // Pre-prepare → prepares → commits.
    cluster.deliver_all();
    cluster.deliver_all();
    cluster.deliver_all();

    for id in 0..4 {
        let r = cluster.replica(id);
        assert_eq!(r.engine.last_executed(), 1, "node {}", id);
        assert_eq!(r.engine.last_globally_committed(), 1, "node {}", id);
    }

    // Agreement: every replica applied the batch identically.
    let root = cluster.replica(0).history.replicated_state_root();
    for id in 1..4 {
        assert_eq!(
            cluster.replica(id).history.replicated_state_root(),
            root,
            "node {}",
            id
        );
    }

    // The write is visible through the KV on a backup.
    let backup = cluster.replica(2);
    let v = backup.store.current_version();
    let map = backup.store.get_map_now("public:app").unwrap();
    assert_eq!(map.read().read_at(b"k", v).unwrap().value.unwrap(), b"v");

    // Exactly one reply per request.
    assert!(cluster.replica(primary).engine.reply_for(1).is_some());
}

#[test]
fn commit_certificate_alone_does_not_finalise() {
    // With no signing keys registered, ordering still commits on the
    // 2f + 1 certificate, but the nonce-reveal evidence cannot verify
    // and the final commit watermark (and KV compaction) stays put.
    let cluster = Cluster::new(4);
    let primary = primary_of_fresh_cluster();

    let req = cluster.request(1, b"k", b"v");
    assert!(cluster.replica(primary).engine.on_request(req));
    cluster.deliver_all();
    cluster.deliver_all();

    let p = cluster.replica(primary);
    assert_eq!(p.engine.last_globally_committed(), 1);
    assert_eq!(p.engine.nonce_watermark(), 0);
    assert_eq!(p.engine.final_committed_version(), 0);
    assert_eq!(p.store.commit_version(), 0);
}

#[test]
fn nonce_reveal_evidence_finalises_commit() {
    // The full evidence cycle: every replica signs its computed root
    // and commits to a nonce, acks a quorum of signatures, reveals its
    // nonce, and only the complete certificate advances the final
    // commit watermark the KV compacts at. The aggregated records
    // replicate through the ordering path itself.
    let cluster = Cluster::new(4);
    let primary = primary_of_fresh_cluster();

    // Register every node's signing key, one batch per record, then a
    // client write once all four are in.
    for id in 0..4u64 {
        let req = register_request(id + 1, id);
        assert!(cluster.replica(primary).engine.on_request(req));
        cluster.deliver_all();
        cluster.deliver_all();
    }

    let client_version_before = cluster.replica(primary).store.current_version();
    let req = cluster.request(10, b"k", b"evidenced");
    assert!(cluster.replica(primary).engine.on_request(req));
    for _ in 0..4 {
        cluster.deliver_all();
    }

    // The client batch's version carries a full nonce certificate.
    for id in 0..4 {
        let r = cluster.replica(id);
        assert!(
            r.engine.nonce_watermark() > client_version_before,
            "node {}: nonce watermark {} not past {}",
            id,
            r.engine.nonce_watermark(),
            client_version_before
        );
        assert!(
            r.engine.final_committed_version() > client_version_before,
            "node {}",
            id
        );
        // Evidence gates compaction, and compaction followed it.
        assert_eq!(
            r.store.commit_version(),
            r.engine.final_committed_version(),
            "node {}",
            id
        );
    }

    // The aggregated evidence records were ordered and applied on the
    // backups, not just the primary.
    let backup = cluster.replica(3);
    let v = backup.store.current_version();
    let sigs_map = backup.store.get_map_now(maps::BACKUP_SIGNATURES).unwrap();
    assert!(sigs_map.read().read_at(b"0", v).is_some());
    let nonces_map = backup.store.get_map_now(maps::NONCES).unwrap();
    assert!(nonces_map.read().read_at(b"0", v).is_some());

    // Replicas stayed bit-identical through the record traffic.
    let root = cluster.replica(0).history.replicated_state_root();
    for id in 1..4 {
        assert_eq!(cluster.replica(id).history.replicated_state_root(), root);
    }
}

#[test]
fn checkpoints_stabilise_on_interval() {
    let cluster = Cluster::new(4);
    let primary = primary_of_fresh_cluster();

    for i in 0..4u64 {
        let req = cluster.request(i + 1, &[i as u8], b"v");
        cluster.replica(primary).engine.on_request(req);
        cluster.deliver_all();
        cluster.deliver_all();
        cluster.deliver_all();
    }

    for id in 0..4 {
        let r = cluster.replica(id);
        assert_eq!(r.engine.last_globally_committed(), 4);
        // Interval 2: seqno 4 is the newest stable checkpoint.
        assert_eq!(r.engine.last_stable(), 4, "node {}", id);
    }
}

#[test]
fn view_change_on_primary_stall() {
    // S3: the primary stalls after its pre-prepare for seqno 1 is
    // accepted; the commit round is lost with it. Backups' timers
    // expire, view + 1 elects the next primary, which re-issues the
    // prepared batch; it executes exactly once.
    let cluster = Cluster::new(4);
    let p0 = primary_of_fresh_cluster();

    let req = cluster.request(7, b"k", b"stalled");
    cluster.replica(p0).engine.on_request(req.clone());

    // Pre-prepares and prepares flow, but the primary goes dark and
    // the commit round is swallowed by the same outage: the batch is
    // prepared everywhere yet uncommitted.
    let dark = |from: NodeId, to: NodeId| from == p0 || to == p0;
    cluster.deliver_where(|from, to, frame| {
        if matches!(Message::decode(frame), Ok((_, Message::Commit(_)))) {
            return false;
        }
        // The initial pre-prepare still comes from p0.
        if matches!(Message::decode(frame), Ok((_, Message::PrePrepare(_)))) {
            return true;
        }
        !dark(from, to)
    });

    for id in (0..4).filter(|id| *id != p0) {
        assert_eq!(cluster.replica(id).engine.last_executed(), 1);
        assert_eq!(cluster.replica(id).engine.last_globally_committed(), 0);
    }

    // Backups' view-change timers expire.
    for id in (0..4).filter(|id| *id != p0) {
        cluster.replica(id).engine.periodic(VC_TIMEOUT);
    }
    let blocked: Vec<(NodeId, NodeId)> = (0..4)
        .flat_map(|other| [(p0, other), (other, p0)])
        .collect();
    cluster.deliver(&blocked);
    cluster.deliver(&blocked);
    cluster.deliver(&blocked);

    // New view: the next primary re-issued the pre-prepare; the batch
    // executes exactly once on every live replica.
    let p1 = 2; // view 2 mod 4
    assert!(cluster.replica(p1).engine.is_primary());
    for id in (0..4).filter(|id| *id != p0) {
        let r = cluster.replica(id);
        assert_eq!(r.engine.view(), 2, "node {}", id);
        assert!(!r.engine.in_view_change(), "node {}", id);
        assert_eq!(r.engine.last_executed(), 1, "node {}", id);
        assert_eq!(r.engine.last_globally_committed(), 1, "node {}", id);
    }

    let root = cluster.replica(p1).history.replicated_state_root();
    for id in (0..4).filter(|id| *id != p0) {
        assert_eq!(cluster.replica(id).history.replicated_state_root(), root);
    }

    // A single reply: the re-executed request still answers once.
    assert!(cluster.replica(p1).engine.reply_for(7).is_some());
}

#[test]
fn execution_mismatch_rejects_pre_prepare() {
    // S4: a pre-prepare claiming a root that tentative execution does
    // not reproduce. The backup rolls back, withholds its prepare, and
    // arms its view-change timer.
    let cluster = Cluster::new(4);
    let backup = 0;

    let req = cluster.request(9, b"k", b"v");
    let mut w = quill_model::RawWriter::new();
    w.write_u64(req.request_id);
    w.write_bytes(&req.payload);
    let mut batch = Vec::new();
    quill_ledger::frame_entry(&mut batch, &w.into_vec());

    let lying_root = Hash::from([0xaa; 32]);
    let pp = PrePrepare {
        view: 1,
        seqno: 1,
        digest: PrePrepare::compute_digest(1, 1, &batch, &lying_root),
        replicated_root: lying_root,
        hashed_nonce: quill_model::Nonce::default(),
        batch,
    };
    let frame = Message::PrePrepare(pp).encode(primary_of_fresh_cluster());

    let r = cluster.replica(backup);
    let version_before = r.store.current_version();
    let root_before = r.history.replicated_state_root();

    r.engine.recv_message(&frame);

    // Rolled back: no tentative state survives.
    assert_eq!(r.store.current_version(), version_before);
    assert_eq!(r.history.replicated_state_root(), root_before);
    assert_eq!(r.engine.last_executed(), 0);

    // No prepare went out for the bad batch.
    let sent_prepare = cluster
        .net
        .queue
        .lock()
        .iter()
        .any(|(from, _, frame)| {
            *from == backup
                && matches!(
                    Message::decode(frame),
                    Ok((_, Message::Prepare(_)))
                )
        });
    assert!(!sent_prepare);

    // The armed timer eventually forces a view change.
    r.engine.periodic(VC_TIMEOUT);
    assert!(r.engine.in_view_change());
}

#[test]
fn straggler_fetches_state_instead_of_replaying() {
    let cluster = Cluster::new(4);
    let primary = primary_of_fresh_cluster();
    let straggler: NodeId = 3;

    // The straggler misses two committed batches (one checkpoint).
    let dark: Vec<(NodeId, NodeId)> = (0..4)
        .flat_map(|other| [(straggler, other), (other, straggler)])
        .collect();
    for i in 0..2u64 {
        let req = cluster.request(i + 1, &[i as u8], b"v");
        cluster.replica(primary).engine.on_request(req);
        cluster.deliver(&dark);
        cluster.deliver(&dark);
        cluster.deliver(&dark);
    }
    assert_eq!(cluster.replica(primary).engine.last_stable(), 2);
    assert_eq!(cluster.replica(straggler).engine.last_executed(), 0);

    // Partition heals; checkpoint gossip tells the straggler it fell
    // behind, and it fetches the missing entries.
    for id in (0..4).filter(|id| *id != straggler) {
        let digest = cluster.replica(id).history.replicated_state_root();
        let cp = Message::Checkpoint(quill_consensus::messages::Checkpoint {
            seqno: 2,
            state_digest: digest,
        });
        cluster
            .net
            .queue
            .lock()
            .push_back((id, straggler, cp.encode(id)));
    }
    cluster.deliver_all();
    cluster.deliver_all();

    let s = cluster.replica(straggler);
    assert_eq!(s.engine.last_executed(), 2);
    assert_eq!(s.engine.last_globally_committed(), 2);
    assert_eq!(
        s.history.replicated_state_root(),
        cluster.replica(primary).history.replicated_state_root()
    );
}
