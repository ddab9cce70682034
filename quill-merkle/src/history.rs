//! Transaction history
//!
//! Ties the Merkle tree to the store: every serialised entry extends the
//! tree, signatures over the root are emitted through reserved
//! transactions, and incoming signature entries are verified against the
//! signer's registered key.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use quill_kv::{maps, Store, TxHistory};
use quill_model::crypto;
use quill_model::{Hash, Nonce, NodeId, Term, TxId, Version};

use crate::record::SignatureRecord;
use crate::tree::{MerkleTree, Receipt};
use crate::HistoryError;

/// Receipts stay available for this many versions behind the
/// compaction point.
pub const MAX_HISTORY_LEN: u64 = 1000;

/// The key under which the signature record lives in the signatures map.
const SIG_KEY: &[u8] = b"0";

/// Commit information the history needs from the consensus engine.
pub trait CommitSource: Send + Sync {
    /// The `(term, version)` a signature would establish commit over.
    /// `None` while a newly elected leader is still re-establishing
    /// commit over earlier terms, during which signing is meaningless.
    fn signable_txid(&self) -> Option<TxId>;

    /// Hashed nonce bound into the signature record. Zero outside BFT.
    fn signature_nonce(&self, _txid: TxId) -> Nonce {
        Nonce::default()
    }
}

/// Placeholder target for the unset back-reference.
struct NeverSource;

impl CommitSource for NeverSource {
    fn signable_txid(&self) -> Option<TxId> {
        None
    }
}

pub struct MerkleHistory {
    store: Arc<Store>,
    node_id: NodeId,
    signing_key: ed25519_dalek::SigningKey,
    tree: Mutex<MerkleTree>,
    /// Back-reference to the consensus engine; weak, since the engine
    /// already owns the store that owns this history.
    source: RwLock<Weak<dyn CommitSource>>,
    sig_tx_interval: u64,
    emit_lock: Mutex<()>,
}

impl MerkleHistory {
    pub fn new(
        store: Arc<Store>,
        node_id: NodeId,
        signing_key: ed25519_dalek::SigningKey,
        sig_tx_interval: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            node_id,
            signing_key,
            tree: Mutex::new(MerkleTree::new(Hash::ZERO)),
            source: RwLock::new(Weak::<NeverSource>::new()),
            sig_tx_interval,
            emit_lock: Mutex::new(()),
        })
    }

    pub fn set_commit_source(&self, source: &Arc<dyn CommitSource>) {
        *self.source.write() = Arc::downgrade(source);
    }

    /// Sign the current root with the node key.
    pub fn sign_root(&self) -> (Hash, quill_model::Signature) {
        let root = self.tree.lock().root();
        (root, crypto::sign_hash(&self.signing_key, &root))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The latest signature record in the signatures map.
    pub fn latest_record(&self) -> Result<SignatureRecord, HistoryError> {
        let map = self
            .store
            .get_map_now(maps::SIGNATURES)
            .ok_or(HistoryError::NoSignature)?;
        let current = self.store.current_version();
        let write = map
            .read()
            .read_at(SIG_KEY, current)
            .ok_or(HistoryError::NoSignature)?;
        let value = write.value.ok_or(HistoryError::NoSignature)?;
        Ok(SignatureRecord::decode(&value)?)
    }

    fn signer_key(&self, node: NodeId) -> Result<quill_model::PubKey, HistoryError> {
        let map = self
            .store
            .get_map_now(maps::NODES)
            .ok_or(HistoryError::UnknownSigner(node))?;
        let current = self.store.current_version();
        let write = map
            .read()
            .read_at(&node.to_le_bytes(), current)
            .ok_or(HistoryError::UnknownSigner(node))?;
        let value = write.value.ok_or(HistoryError::UnknownSigner(node))?;
        let record = quill_model::NodeRecord::decode(&value)?;
        Ok(record.public_key)
    }

    /// Verify the latest signature record against the signer's key and
    /// the current root. Returns the record on success.
    pub fn verify(&self) -> Result<SignatureRecord, HistoryError> {
        let record = self.latest_record()?;
        let key = self.signer_key(record.node)?;
        let root = self.tree.lock().root();
        crypto::verify_hash(&key, &root, &record.sig).map_err(|_| HistoryError::BadSignature)?;
        Ok(record)
    }

    /// Sign the current root and write the record through a reserved
    /// transaction, marking the entry committable.
    pub fn emit_signature(self: &Arc<Self>) {
        let Some(source) = self.source.read().upgrade() else {
            return;
        };
        // Only sign once commit is established over our own term.
        let Some(commit) = source.signable_txid() else {
            return;
        };

        let txid = self.store.next_txid();
        debug!(%txid, commit = %commit, "issuing signature");

        let this = self.clone();
        let pending = Box::new(move || {
            let mut tx = this.store.create_reserved_tx(txid.version);
            // The root is captured here, in replication order: it
            // covers exactly the entries batched before this one.
            let (root, tree_bytes) = {
                let tree = this.tree.lock();
                (tree.root(), tree.serialise())
            };
            let record = SignatureRecord {
                node: this.node_id,
                version: txid.version,
                term: txid.term,
                commit_version: commit.version,
                commit_term: commit.term,
                root,
                hashed_nonce: source.signature_nonce(txid),
                sig: crypto::sign_hash(&this.signing_key, &root),
                tree: tree_bytes,
            };
            tx.put(maps::SIGNATURES, SIG_KEY, &record.encode());
            tx.commit_reserved()
        });

        let outcome = self.store.commit(txid, pending, true);
        if !outcome.is_ok() {
            warn!(%txid, ?outcome, "signature emission not replicated");
        }
    }

    /// Emit a signature if enough uncommittable versions have
    /// accumulated.
    pub fn try_emit_signature(self: &Arc<Self>) {
        if self.store.commit_gap() < self.sig_tx_interval {
            return;
        }
        let Some(_guard) = self.emit_lock.try_lock() else {
            return;
        };
        if self.store.commit_gap() >= self.sig_tx_interval {
            self.emit_signature();
        }
    }

    /// An audit path for the entry at `version` under the current root.
    pub fn get_receipt(&self, version: Version) -> Result<Vec<u8>, HistoryError> {
        Ok(self.tree.lock().receipt(version)?.serialise())
    }

    /// Check a serialised receipt against the current tree.
    pub fn verify_receipt(&self, data: &[u8]) -> bool {
        let Ok(receipt) = Receipt::deserialise(data) else {
            return false;
        };
        let tree = self.tree.lock();
        let Some(leaf) = tree.leaf(receipt.index) else {
            return false;
        };
        receipt.verify(&leaf) && receipt.root == tree.root()
    }
}

impl TxHistory for MerkleHistory {
    fn append_entry(&self, entry: &[u8]) {
        let digest = crypto::content_hash(entry);
        self.tree.lock().append(digest);
    }

    fn replicated_state_root(&self) -> Hash {
        self.tree.lock().root()
    }

    fn verify_signature(&self) -> Result<Term, ()> {
        match self.verify() {
            Ok(record) => Ok(record.term),
            Err(e) => {
                warn!(error = %e, "signature entry failed verification");
                Err(())
            }
        }
    }

    fn rollback(&self, version: Version) {
        self.tree.lock().retract(version);
    }

    fn compact(&self, version: Version) {
        if version > MAX_HISTORY_LEN {
            self.tree.lock().flush(version - MAX_HISTORY_LEN);
        }
    }

    fn raw_leaf(&self, version: Version) -> Option<Hash> {
        self.tree.lock().leaf(version)
    }

    fn init_from_snapshot(&self, hash_at_snapshot: Hash) -> bool {
        let record = match self.latest_record() {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "no signature record to rebuild history from");
                return false;
            }
        };
        let mut rebuilt = match MerkleTree::deserialise(&record.tree) {
            Ok(t) => t,
            Err(e) => {
                warn!(error = %e, "signature record carries a malformed tree");
                return false;
            }
        };
        rebuilt.append(hash_at_snapshot);
        *self.tree.lock() = rebuilt;
        true
    }
}
