//! End-to-end history behaviour across two stores: a leader that
//! commits and signs, and a follower that replays the serialised
//! entries and verifies the signature.

use std::sync::Arc;

use parking_lot::Mutex;

use quill_kv::{maps, ApplyOutcome, ReplicationSink, Store, StoreConfig, TxHistory};
use quill_merkle::{CommitSource, MerkleHistory};
use quill_model::crypto;
use quill_model::{NodeRecord, NodeStatus, Term, TxId, Version};

/// Captures replicated entries for hand-feeding into a follower.
#[derive(Default)]
struct CaptureSink {
    entries: Mutex<Vec<(Version, Vec<u8>, bool)>>,
}

impl ReplicationSink for CaptureSink {
    fn replicate(&self, entries: Vec<(Version, Arc<Vec<u8>>, bool)>, _: Term) -> bool {
        self.entries
            .lock()
            .extend(entries.into_iter().map(|(v, d, c)| (v, (*d).clone(), c)));
        true
    }
}

/// Everything is immediately signable; the commit point is the current
/// version.
struct AlwaysSignable(Arc<Store>);

impl CommitSource for AlwaysSignable {
    fn signable_txid(&self) -> Option<TxId> {
        Some(self.0.current_txid())
    }
}

struct Replica {
    store: Arc<Store>,
    history: Arc<MerkleHistory>,
    sink: Arc<CaptureSink>,
    _source: Arc<dyn CommitSource>,
}

fn replica(node_id: u64, seed: u8) -> Replica {
    let store = Store::new(StoreConfig::replicated());
    let (sk, _) = crypto::signing_key_from_seed(&[seed; 32]);
    let history = MerkleHistory::new(store.clone(), node_id, sk, 1);
    store.set_history(history.clone());
    let sink = Arc::new(CaptureSink::default());
    store.set_replication(sink.clone());
    let source: Arc<dyn CommitSource> = Arc::new(AlwaysSignable(store.clone()));
    history.set_commit_source(&source);
    store.create_map("public:app").unwrap();
    Replica {
        store,
        history,
        sink,
        _source: source,
    }
}

fn register_node(leader: &Replica, node_id: u64, seed: u8) {
    let (_, pk) = crypto::signing_key_from_seed(&[seed; 32]);
    let record = NodeRecord {
        node_id,
        public_key: pk,
        hostname: "localhost".into(),
        port: "0".into(),
        status: NodeStatus::Trusted,
    };
    let mut tx = leader.store.create_tx();
    tx.put(maps::NODES, &node_id.to_le_bytes(), &record.encode());
    assert!(tx.commit().unwrap().is_ok());
}

#[test]
fn follower_replays_and_verifies_signature() {
    let leader = replica(1, 1);
    let follower = replica(2, 2);

    register_node(&leader, 1, 1);

    let mut tx = leader.store.create_tx();
    tx.put("public:app", b"k", b"v");
    assert!(tx.commit().unwrap().is_ok());

    leader.history.emit_signature();

    let entries = leader.sink.entries.lock().clone();
    assert_eq!(entries.len(), 3);
    // The signature entry is the committable boundary.
    assert!(entries[2].2);

    let mut outcomes = Vec::new();
    for (_, data, _) in &entries {
        outcomes.push(follower.store.deserialise(data, false).unwrap());
    }
    assert_eq!(
        outcomes,
        vec![
            ApplyOutcome::Pass,
            ApplyOutcome::Pass,
            ApplyOutcome::PassSignature(0)
        ]
    );

    // Both replicas now hold bitwise-equal roots.
    assert_eq!(
        leader.history.replicated_state_root(),
        follower.history.replicated_state_root()
    );

    // The follower can re-verify the record independently.
    let record = follower.history.latest_record().unwrap();
    assert_eq!(record.node, 1);
    assert_eq!(record.version, 3);
}

#[test]
fn tampered_entry_fails_signature_verification() {
    let leader = replica(1, 1);
    let follower = replica(2, 2);

    register_node(&leader, 1, 1);

    let mut tx = leader.store.create_tx();
    tx.put("public:app", b"k", b"v");
    assert!(tx.commit().unwrap().is_ok());
    leader.history.emit_signature();

    let entries = leader.sink.entries.lock().clone();

    // Replay the node registration, then a tampered application entry:
    // the follower's root diverges from what the leader signed over.
    follower.store.deserialise(&entries[0].1, false).unwrap();
    let mut tampered = entries[1].1.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    assert_eq!(
        follower.store.deserialise(&tampered, false).unwrap(),
        ApplyOutcome::Pass
    );

    // The signature entry no longer verifies.
    let err = follower.store.deserialise(&entries[2].1, false);
    assert!(err.is_err(), "tampered history must fail verification");
}

#[test]
fn roots_diverge_on_different_entries() {
    let a = replica(1, 1);
    let b = replica(2, 2);

    let mut tx = a.store.create_tx();
    tx.put("public:app", b"k", b"va");
    assert!(tx.commit().unwrap().is_ok());

    let mut tx = b.store.create_tx();
    tx.put("public:app", b"k", b"vb");
    assert!(tx.commit().unwrap().is_ok());

    assert_ne!(
        a.history.replicated_state_root(),
        b.history.replicated_state_root()
    );
}

#[test]
fn receipts_cover_replayed_entries() {
    let leader = replica(1, 1);
    register_node(&leader, 1, 1);

    for i in 0..5u8 {
        let mut tx = leader.store.create_tx();
        tx.put("public:app", &[i], b"v");
        assert!(tx.commit().unwrap().is_ok());
    }

    for v in 1..=6u64 {
        let receipt = leader.history.get_receipt(v).unwrap();
        assert!(leader.history.verify_receipt(&receipt), "version {}", v);
    }

    // A receipt stops verifying once the tree moves on.
    let receipt = leader.history.get_receipt(3).unwrap();
    let mut tx = leader.store.create_tx();
    tx.put("public:app", b"late", b"v");
    assert!(tx.commit().unwrap().is_ok());
    assert!(!leader.history.verify_receipt(&receipt));
}

#[test]
fn rollback_realigns_roots() {
    let a = replica(1, 1);
    let b = replica(2, 2);

    // Shared prefix.
    let mut tx = a.store.create_tx();
    tx.put("public:app", b"k", b"v");
    assert!(tx.commit().unwrap().is_ok());
    let entries = a.sink.entries.lock().clone();
    b.store.deserialise(&entries[0].1, false).unwrap();
    let shared_root = a.history.replicated_state_root();
    assert_eq!(shared_root, b.history.replicated_state_root());

    // b speculates past the shared prefix, then rolls back.
    let mut tx = b.store.create_tx();
    tx.put("public:app", b"spec", b"v");
    assert!(tx.commit().unwrap().is_ok());
    assert_ne!(shared_root, b.history.replicated_state_root());

    b.store.rollback(1, None).unwrap();
    assert_eq!(shared_root, b.history.replicated_state_root());
}
