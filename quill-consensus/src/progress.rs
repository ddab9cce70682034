//! Progress tracker
//!
//! Accumulates the BFT commit evidence for each `(term, version)`: the
//! primary's root, every node's signed root and hashed nonce, the
//! signature-receipt acks, and the revealed nonces. Crossing each
//! threshold advances the protocol one step:
//!
//! 1. `2f + 1` signatures → broadcast a signatures-received ack;
//! 2. `2f + 1` acks → reveal our own nonce;
//! 3. `2f + 1` matching reveals → the final commit watermark advances.
//!
//! The tracker is pure bookkeeping: the engine broadcasts the messages,
//! surfaces the watermark to the KV, and replicates the aggregated
//! records (built by [`ProgressTracker::backup_signatures_record`] and
//! [`ProgressTracker::revealed_nonces_record`]) through its own
//! ordering path, so every replica applies them identically.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use quill_kv::{maps, Store};
use quill_model::codec::{CodecError, RawReader, RawWriter};
use quill_model::{crypto, Hash, Nonce, NodeId, PubKey, Signature, TxId, Version};

/// What the caller should do after feeding the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerResult {
    Fail,
    Ok,
    SendSigAck,
    SendReplyAndNonce,
}

#[derive(Debug, Clone)]
struct NodeSig {
    sig: Signature,
    hashed_nonce: Nonce,
}

#[derive(Default)]
struct CommitCert {
    root: Hash,
    have_primary_signature: bool,
    sigs: BTreeMap<NodeId, NodeSig>,
    sig_acks: BTreeSet<NodeId>,
    /// Verified reveals, keyed by node.
    nonce_set: BTreeMap<NodeId, Nonce>,
    unmatched_nonces: BTreeMap<NodeId, Nonce>,
    my_nonce: Option<Nonce>,
    ack_sent: bool,
    reply_and_nonce_sent: bool,
}

/// Evidence threshold: `2f + 1` of `n`.
fn threshold(node_count: usize) -> usize {
    let f = node_count.saturating_sub(1) / 3;
    2 * f + 1
}

pub struct ProgressTracker {
    node_id: NodeId,
    store: Arc<Store>,
    certs: Mutex<BTreeMap<TxId, CommitCert>>,
    highest_committed: AtomicU64,
}

impl ProgressTracker {
    pub fn new(node_id: NodeId, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            node_id,
            store,
            certs: Mutex::new(BTreeMap::new()),
            highest_committed: AtomicU64::new(0),
        })
    }

    /// The highest version with a full nonce-reveal certificate.
    pub fn highest_committed_nonce(&self) -> Version {
        self.highest_committed.load(Ordering::Acquire)
    }

    fn signer_key(&self, node: NodeId) -> Option<PubKey> {
        let map = self.store.get_map_now(maps::NODES)?;
        let current = self.store.current_version();
        let value = map.read().read_at(&node.to_le_bytes(), current)?.value?;
        quill_model::NodeRecord::decode(&value)
            .ok()
            .map(|r| r.public_key)
    }

    /// Our nonce for this transaction, generated on first use.
    pub fn get_my_nonce(&self, txid: TxId) -> Nonce {
        let mut certs = self.certs.lock();
        let cert = certs.entry(txid).or_default();
        *cert
            .my_nonce
            .get_or_insert_with(|| Nonce(crypto::generate_secret()))
    }

    pub fn get_my_hashed_nonce(&self, txid: TxId) -> Nonce {
        let nonce = self.get_my_nonce(txid);
        Nonce(*crypto::content_hash(nonce.as_bytes()).as_bytes())
    }

    /// Record the primary's root for `txid`; signatures verify against
    /// it from here on.
    pub fn record_primary(
        &self,
        txid: TxId,
        node: NodeId,
        root: Hash,
        hashed_nonce: Nonce,
    ) -> TrackerResult {
        let mut certs = self.certs.lock();
        let cert = certs.entry(txid).or_default();
        if cert.have_primary_signature && cert.root != root {
            warn!(%txid, "conflicting primary roots");
            return TrackerResult::Fail;
        }
        cert.root = root;
        cert.have_primary_signature = true;
        cert.sigs.entry(node).or_insert(NodeSig {
            sig: Signature::default(),
            hashed_nonce,
        });
        TrackerResult::Ok
    }

    /// Add a node's signature over the root for `txid`.
    pub fn add_signature(
        &self,
        txid: TxId,
        node: NodeId,
        sig: Signature,
        hashed_nonce: Nonce,
        node_count: usize,
    ) -> TrackerResult {
        let verified = match self.signer_key(node) {
            Some(key) => {
                let root = self.certs.lock().get(&txid).map(|c| c.root);
                match root {
                    Some(root) if root != Hash::ZERO => {
                        crypto::verify_hash(&key, &root, &sig).is_ok()
                    }
                    // Root not yet known; accept provisionally, the
                    // backup-signatures record re-verifies.
                    _ => true,
                }
            }
            // Unknown signers are only tolerated before their join
            // transaction lands.
            None => false,
        };
        if !verified {
            warn!(%txid, node, "signature failed verification");
            return TrackerResult::Fail;
        }

        let mut certs = self.certs.lock();
        let cert = certs.entry(txid).or_default();
        cert.sigs.insert(node, NodeSig { sig, hashed_nonce });
        trace!(%txid, node, count = cert.sigs.len(), "signature recorded");

        if !cert.ack_sent && cert.sigs.len() >= threshold(node_count) {
            cert.ack_sent = true;
            return TrackerResult::SendSigAck;
        }
        TrackerResult::Ok
    }

    /// Record a signatures-received ack from `node`.
    pub fn add_signature_ack(
        &self,
        txid: TxId,
        node: NodeId,
        node_count: usize,
    ) -> TrackerResult {
        let mut certs = self.certs.lock();
        let cert = certs.entry(txid).or_default();
        cert.sig_acks.insert(node);
        trace!(%txid, node, count = cert.sig_acks.len(), "signature ack recorded");

        if !cert.reply_and_nonce_sent && cert.sig_acks.len() >= threshold(node_count) {
            cert.reply_and_nonce_sent = true;
            return TrackerResult::SendReplyAndNonce;
        }
        TrackerResult::Ok
    }

    /// Record a revealed nonce; it must match the hashed nonce the node
    /// committed to in its signature. Crossing the threshold advances
    /// the final commit watermark.
    pub fn add_nonce_reveal(
        &self,
        txid: TxId,
        nonce: Nonce,
        node: NodeId,
        node_count: usize,
    ) {
        let mut certs = self.certs.lock();
        let cert = certs.entry(txid).or_default();

        let hashed = Nonce(*crypto::content_hash(nonce.as_bytes()).as_bytes());
        match cert.sigs.get(&node) {
            Some(s) if s.hashed_nonce == hashed => {
                cert.nonce_set.insert(node, nonce);
            }
            Some(_) => {
                warn!(%txid, node, "revealed nonce does not match its commitment");
                cert.unmatched_nonces.insert(node, nonce);
                return;
            }
            None => {
                // Reveal before signature: park it.
                cert.unmatched_nonces.insert(node, nonce);
                return;
            }
        }

        if cert.nonce_set.len() >= threshold(node_count) {
            let prev = self.highest_committed.load(Ordering::Acquire);
            if txid.version > prev {
                self.highest_committed.store(txid.version, Ordering::Release);
                debug!(%txid, "nonce certificate complete, commit watermark advanced");
            }
        }
    }

    /// The aggregated signatures for `txid`, once the ack threshold has
    /// been crossed. The engine replicates this through its ordering
    /// path.
    pub fn backup_signatures_record(&self, txid: TxId) -> Option<BackupSignaturesRecord> {
        let certs = self.certs.lock();
        let cert = certs.get(&txid)?;
        if !cert.ack_sent {
            return None;
        }
        Some(BackupSignaturesRecord {
            txid,
            root: cert.root,
            sigs: cert
                .sigs
                .iter()
                .map(|(n, s)| (*n, s.hashed_nonce, s.sig))
                .collect(),
        })
    }

    /// The verified reveals for `txid`, once the nonce certificate is
    /// complete.
    pub fn revealed_nonces_record(&self, txid: TxId) -> Option<RevealedNoncesRecord> {
        let certs = self.certs.lock();
        let cert = certs.get(&txid)?;
        if cert.nonce_set.is_empty() || self.highest_committed_nonce() < txid.version {
            return None;
        }
        Some(RevealedNoncesRecord {
            txid,
            nonces: cert.nonce_set.iter().map(|(n, v)| (*n, *v)).collect(),
        })
    }

    /// Discard evidence above `version` (rollback) or wholly below
    /// `version` (compaction).
    pub fn rollback(&self, version: Version) {
        self.certs.lock().retain(|txid, _| txid.version <= version);
    }

    pub fn compact(&self, version: Version) {
        let committed = self.highest_committed_nonce();
        self.certs
            .lock()
            .retain(|txid, _| txid.version > version.min(committed));
    }

    // ------------------------------------------------------------------
    // Replicated records
    // ------------------------------------------------------------------

    /// A replicated backup-signatures entry was applied: re-verify and
    /// fold in every signature it carries.
    pub fn receive_backup_signatures(
        &self,
        node_count: usize,
    ) -> Result<(TxId, TrackerResult), CodecError> {
        let Some(map) = self.store.get_map_now(maps::BACKUP_SIGNATURES) else {
            return Ok((TxId::default(), TrackerResult::Fail));
        };
        let current = self.store.current_version();
        let Some(value) = map.read().read_at(b"0", current).and_then(|w| w.value) else {
            return Ok((TxId::default(), TrackerResult::Fail));
        };
        let record = BackupSignaturesRecord::decode(&value)?;

        self.record_primary(record.txid, self.node_id, record.root, Nonce::default());
        let mut result = TrackerResult::Ok;
        for (node, hashed_nonce, sig) in &record.sigs {
            let r = self.add_signature(record.txid, *node, *sig, *hashed_nonce, node_count);
            if r == TrackerResult::SendSigAck {
                result = TrackerResult::SendSigAck;
            }
        }
        Ok((record.txid, result))
    }

    /// A replicated revealed-nonces entry was applied.
    pub fn receive_nonces(&self, node_count: usize) -> Result<TxId, CodecError> {
        let Some(map) = self.store.get_map_now(maps::NONCES) else {
            return Ok(TxId::default());
        };
        let current = self.store.current_version();
        let Some(value) = map.read().read_at(b"0", current).and_then(|w| w.value) else {
            return Ok(TxId::default());
        };
        let record = RevealedNoncesRecord::decode(&value)?;
        for (node, nonce) in &record.nonces {
            self.add_nonce_reveal(record.txid, *nonce, *node, node_count);
        }
        Ok(record.txid)
    }
}

// ---------------------------------------------------------------------------
// Record formats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSignaturesRecord {
    pub txid: TxId,
    pub root: Hash,
    pub sigs: Vec<(NodeId, Nonce, Signature)>,
}

impl BackupSignaturesRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u64(self.txid.term);
        w.write_u64(self.txid.version);
        w.write_array(self.root.as_bytes());
        w.write_u64(self.sigs.len() as u64);
        for (node, hashed_nonce, sig) in &self.sigs {
            w.write_u64(*node);
            w.write_array(hashed_nonce.as_bytes());
            w.write_array(sig.as_bytes());
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = RawReader::new(data);
        let txid = TxId::new(r.read_u64()?, r.read_u64()?);
        let root = Hash::from(r.read_array::<32>()?);
        let n = r.read_u64()?;
        let mut sigs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            sigs.push((
                r.read_u64()?,
                Nonce::from(r.read_array::<32>()?),
                Signature::from(r.read_array::<64>()?),
            ));
        }
        r.finish()?;
        Ok(Self { txid, root, sigs })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealedNoncesRecord {
    pub txid: TxId,
    pub nonces: Vec<(NodeId, Nonce)>,
}

impl RevealedNoncesRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u64(self.txid.term);
        w.write_u64(self.txid.version);
        w.write_u64(self.nonces.len() as u64);
        for (node, nonce) in &self.nonces {
            w.write_u64(*node);
            w.write_array(nonce.as_bytes());
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = RawReader::new(data);
        let txid = TxId::new(r.read_u64()?, r.read_u64()?);
        let n = r.read_u64()?;
        let mut nonces = Vec::with_capacity(n as usize);
        for _ in 0..n {
            nonces.push((r.read_u64()?, Nonce::from(r.read_array::<32>()?)));
        }
        r.finish()?;
        Ok(Self { txid, nonces })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_kv::StoreConfig;

    fn tracker() -> Arc<ProgressTracker> {
        let store = Store::new(StoreConfig::replicated());
        ProgressTracker::new(0, store)
    }

    fn register_signer(
        tracker: &ProgressTracker,
        node: NodeId,
        seed: u8,
    ) -> ed25519_dalek::SigningKey {
        let (sk, pk) = crypto::signing_key_from_seed(&[seed; 32]);
        let record = quill_model::NodeRecord {
            node_id: node,
            public_key: pk,
            hostname: String::new(),
            port: String::new(),
            status: quill_model::NodeStatus::Trusted,
        };
        let mut tx = tracker.store.create_tx();
        tx.put(maps::NODES, &node.to_le_bytes(), &record.encode());
        assert!(tx.commit().unwrap().is_ok());
        sk
    }

    #[test]
    fn thresholds() {
        assert_eq!(threshold(1), 1);
        assert_eq!(threshold(4), 3);
        assert_eq!(threshold(7), 5);
    }

    #[test]
    fn full_evidence_cycle_advances_watermark() {
        let t = tracker();
        let txid = TxId::new(2, 10);
        let root = Hash::from([7u8; 32]);
        let n = 4;

        // Register keys for the four nodes and gather their sigs.
        let keys: Vec<_> = (0..4u64)
            .map(|id| register_signer(&t, id, id as u8 + 1))
            .collect();

        t.record_primary(txid, 0, root, t.get_my_hashed_nonce(txid));

        let mut nonces = Vec::new();
        let mut acked = false;
        for (id, key) in keys.iter().enumerate() {
            let nonce = Nonce(crypto::generate_secret());
            let hashed = Nonce(*crypto::content_hash(nonce.as_bytes()).as_bytes());
            nonces.push((id as NodeId, nonce));
            let sig = crypto::sign_hash(key, &root);
            if t.add_signature(txid, id as NodeId, sig, hashed, n) == TrackerResult::SendSigAck {
                acked = true;
            }
        }
        assert!(acked, "threshold signatures must trigger the ack");

        // The aggregated record is now available for replication.
        let record = t.backup_signatures_record(txid).unwrap();
        assert_eq!(record.root, root);
        assert_eq!(record.sigs.len(), 4);

        // Acks from 2f + 1 nodes trigger the nonce reveal.
        let mut reveal = false;
        for id in 0..3u64 {
            if t.add_signature_ack(txid, id, n) == TrackerResult::SendReplyAndNonce {
                reveal = true;
            }
        }
        assert!(reveal);

        assert_eq!(t.highest_committed_nonce(), 0);
        assert!(t.revealed_nonces_record(txid).is_none());
        for (id, nonce) in &nonces[..3] {
            t.add_nonce_reveal(txid, *nonce, *id, n);
        }
        assert_eq!(t.highest_committed_nonce(), 10);
        assert_eq!(t.revealed_nonces_record(txid).unwrap().nonces.len(), 3);
    }

    #[test]
    fn bad_signature_is_refused() {
        let t = tracker();
        let txid = TxId::new(1, 5);
        let root = Hash::from([1u8; 32]);
        register_signer(&t, 1, 9);
        let (wrong_key, _) = crypto::signing_key_from_seed(&[8u8; 32]);

        t.record_primary(txid, 0, root, Nonce::default());
        let sig = crypto::sign_hash(&wrong_key, &root);
        assert_eq!(
            t.add_signature(txid, 1, sig, Nonce::default(), 4),
            TrackerResult::Fail
        );
    }

    #[test]
    fn unknown_signer_is_refused() {
        let t = tracker();
        let txid = TxId::new(1, 5);
        let (key, _) = crypto::signing_key_from_seed(&[8u8; 32]);
        let root = Hash::from([1u8; 32]);
        t.record_primary(txid, 0, root, Nonce::default());
        assert_eq!(
            t.add_signature(txid, 9, crypto::sign_hash(&key, &root), Nonce::default(), 4),
            TrackerResult::Fail
        );
    }

    #[test]
    fn mismatched_reveal_is_parked() {
        let t = tracker();
        let txid = TxId::new(1, 5);
        let root = Hash::from([1u8; 32]);
        let key = register_signer(&t, 1, 9);

        t.record_primary(txid, 0, root, Nonce::default());
        let nonce = Nonce(crypto::generate_secret());
        let hashed = Nonce(*crypto::content_hash(nonce.as_bytes()).as_bytes());
        t.add_signature(txid, 1, crypto::sign_hash(&key, &root), hashed, 4);

        // A reveal that does not hash to the commitment never counts.
        t.add_nonce_reveal(txid, Nonce([3u8; 32]), 1, 1);
        assert_eq!(t.highest_committed_nonce(), 0);

        t.add_nonce_reveal(txid, nonce, 1, 1);
        assert_eq!(t.highest_committed_nonce(), 5);
    }

    #[test]
    fn records_roundtrip() {
        let bs = BackupSignaturesRecord {
            txid: TxId::new(1, 2),
            root: Hash::from([1u8; 32]),
            sigs: vec![(3, Nonce::from([2u8; 32]), Signature::from([4u8; 64]))],
        };
        assert_eq!(BackupSignaturesRecord::decode(&bs.encode()).unwrap(), bs);

        let rn = RevealedNoncesRecord {
            txid: TxId::new(1, 2),
            nonces: vec![(3, Nonce::from([5u8; 32]))],
        };
        assert_eq!(RevealedNoncesRecord::decode(&rn.encode()).unwrap(), rn);
    }
}
