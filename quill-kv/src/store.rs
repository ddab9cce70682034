//! The store
//!
//! Owns the ordered map registry and the single logical version clock.
//! Commit hands serialised entries to the replication sink in strict
//! version order; deserialise replays entries produced by another
//! replica and classifies them for the consensus layer.
//!
//! Locking discipline: the map registry lock and per-map locks are
//! acquired before the version lock, never after; the replicate lock
//! serialises the pending-queue drain so batches reach the sink in
//! order. Neither the version lock nor map locks are held across a
//! `replicate()` call.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use quill_model::{Term, TxId, Version, NO_VERSION};

use crate::encryptor::Encryptor;
use crate::map::Map;
use crate::serialise::deserialise_entry;
use crate::snapshot::StoreSnapshot;
use crate::tx::Transaction;
use crate::types::{
    is_reserved_map_name, maps as reserved, parse_security_domain, ApplyOutcome, CommitOutcome,
    KvError, ReplicateScope, ReplicationSink, TxHistory,
};

/// Deferred entry serialisation, executed in version order by the
/// pending-queue drain. Signature transactions capture the Merkle root
/// at execution time, after every earlier entry has been appended.
pub type PendingTx = Box<dyn FnOnce() -> Result<Vec<u8>, KvError> + Send>;

#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub replicate: ReplicateScope,
    /// Reject non-contiguous deserialised entries. Disabled only for
    /// historical-query stores.
    pub strict_versions: bool,
}

impl StoreConfig {
    pub fn replicated() -> Self {
        Self {
            replicate: ReplicateScope::All,
            strict_versions: true,
        }
    }
}

struct VersionState {
    version: Version,
    term: Term,
    compacted: Version,
    last_replicated: Version,
    last_committable: Version,
    rollback_count: u64,
    pending: BTreeMap<Version, (PendingTx, bool)>,
}

pub struct Store {
    /// Map name → (creation version, map). Name order gives the stable
    /// lock order. Creation version is [`NO_VERSION`] for static maps.
    maps: RwLock<BTreeMap<String, (Version, Arc<RwLock<Map>>)>>,
    vs: Mutex<VersionState>,
    /// Serialises the pending-queue drain and the sink call.
    replicate_lock: Mutex<()>,

    history: RwLock<Option<Arc<dyn TxHistory>>>,
    sink: RwLock<Option<Arc<dyn ReplicationSink>>>,
    encryptor: RwLock<Option<Arc<dyn Encryptor>>>,

    config: StoreConfig,
}

impl Store {
    pub fn new(config: StoreConfig) -> Arc<Self> {
        let store = Arc::new(Self {
            maps: RwLock::new(BTreeMap::new()),
            vs: Mutex::new(VersionState {
                version: NO_VERSION,
                term: 0,
                compacted: NO_VERSION,
                last_replicated: NO_VERSION,
                last_committable: NO_VERSION,
                rollback_count: 0,
                pending: BTreeMap::new(),
            }),
            replicate_lock: Mutex::new(()),
            history: RwLock::new(None),
            sink: RwLock::new(None),
            encryptor: RwLock::new(None),
            config,
        });

        // The internal maps exist from genesis on every replica.
        for name in [
            reserved::SIGNATURES,
            reserved::BACKUP_SIGNATURES,
            reserved::NONCES,
            reserved::SNAPSHOT_EVIDENCE,
            reserved::PRE_PREPARES,
            reserved::NEW_VIEWS,
            reserved::NODES,
        ] {
            store.create_map_unchecked(name, NO_VERSION);
        }

        store
    }

    // ------------------------------------------------------------------
    // Wiring
    // ------------------------------------------------------------------

    pub fn set_history(&self, history: Arc<dyn TxHistory>) {
        *self.history.write() = Some(history);
    }

    pub fn history(&self) -> Option<Arc<dyn TxHistory>> {
        self.history.read().clone()
    }

    pub fn set_replication(&self, sink: Arc<dyn ReplicationSink>) {
        *self.sink.write() = Some(sink);
    }

    pub fn set_encryptor(&self, encryptor: Arc<dyn Encryptor>) {
        *self.encryptor.write() = Some(encryptor);
    }

    pub fn encryptor(&self) -> Option<Arc<dyn Encryptor>> {
        self.encryptor.read().clone()
    }

    // ------------------------------------------------------------------
    // Maps
    // ------------------------------------------------------------------

    /// Create an application map. The security domain is derived from
    /// the name; the reserved prefix is rejected.
    pub fn create_map(&self, name: &str) -> Result<(), KvError> {
        if is_reserved_map_name(name) {
            return Err(KvError::ReservedMapName(name.to_string()));
        }
        if self.maps.read().contains_key(name) {
            return Err(KvError::MapExists(name.to_string()));
        }
        self.create_map_unchecked(name, NO_VERSION);
        Ok(())
    }

    pub(crate) fn create_map_unchecked(&self, name: &str, created_at: Version) -> Arc<RwLock<Map>> {
        let map = Arc::new(RwLock::new(Map::new(
            name.to_string(),
            parse_security_domain(name),
            self.config.replicate.is_replicated(name),
        )));
        self.maps
            .write()
            .insert(name.to_string(), (created_at, map.clone()));
        map
    }

    /// Look up a map by name, if it exists at `v`.
    pub fn get_map(&self, v: Version, name: &str) -> Option<Arc<RwLock<Map>>> {
        let maps = self.maps.read();
        let (created_at, map) = maps.get(name)?;
        if *created_at == NO_VERSION || v >= *created_at {
            Some(map.clone())
        } else {
            None
        }
    }

    /// Look up a map at the current version.
    pub fn get_map_now(&self, name: &str) -> Option<Arc<RwLock<Map>>> {
        self.get_map(self.current_version(), name)
    }

    pub fn map_names(&self) -> Vec<String> {
        self.maps.read().keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Version clock
    // ------------------------------------------------------------------

    pub fn current_version(&self) -> Version {
        self.vs.lock().version
    }

    pub fn current_txid(&self) -> TxId {
        let vs = self.vs.lock();
        TxId::new(vs.term, vs.version)
    }

    /// The compacted (durably committed) version.
    pub fn commit_version(&self) -> Version {
        self.vs.lock().compacted
    }

    /// Versions since the last committable entry; drives signature
    /// emission policy.
    pub fn commit_gap(&self) -> u64 {
        let vs = self.vs.lock();
        vs.version - vs.last_committable
    }

    pub fn set_term(&self, term: Term) {
        self.vs.lock().term = term;
    }

    pub fn next_version(&self) -> Version {
        let mut vs = self.vs.lock();
        vs.version += 1;
        vs.version
    }

    pub fn next_txid(&self) -> TxId {
        let mut vs = self.vs.lock();
        vs.version += 1;
        TxId::new(vs.term, vs.version)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn create_tx(self: &Arc<Self>) -> Transaction {
        Transaction::new(self.clone())
    }

    /// A transaction with a pre-allocated version, reading at
    /// `version - 1`. Used by the history to write signature records.
    pub fn create_reserved_tx(self: &Arc<Self>, version: Version) -> Transaction {
        Transaction::new_reserved(self.clone(), version, self.vs.lock().term)
    }

    // ------------------------------------------------------------------
    // Commit pipeline
    // ------------------------------------------------------------------

    /// Queue a serialised (or deferred) entry for replication. Entries
    /// reach the sink contiguously and in version order regardless of
    /// the order their transactions complete in.
    pub fn commit(&self, txid: TxId, pending: PendingTx, committable: bool) -> CommitOutcome {
        let sink = match self.sink.read().clone() {
            Some(s) => s,
            // A store without a replication sink commits locally only.
            None => return CommitOutcome::Ok(txid),
        };

        {
            let mut vs = self.vs.lock();
            if txid.term != vs.term {
                // The view changed between the transaction's read and
                // its commit.
                debug!(
                    want = txid.term,
                    current = vs.term,
                    "commit for stale term refused"
                );
                return CommitOutcome::NoReplicate;
            }
            if committable && txid.version > vs.last_committable {
                vs.last_committable = txid.version;
            }
            vs.pending.insert(txid.version, (pending, committable));
        }

        let _drain = self.replicate_lock.lock();

        let (prev_rollbacks, prev_replicated, term) = {
            let vs = self.vs.lock();
            (vs.rollback_count, vs.last_replicated, vs.term)
        };
        let history = self.history.read().clone();

        let mut batch: Vec<(Version, Arc<Vec<u8>>, bool)> = Vec::new();
        loop {
            let next_version = prev_replicated + batch.len() as u64 + 1;
            let entry = {
                let mut vs = self.vs.lock();
                if vs.rollback_count != prev_rollbacks {
                    // A rollback raced us; abandon the drain.
                    return CommitOutcome::NoReplicate;
                }
                match vs.pending.remove(&next_version) {
                    Some(e) => e,
                    None => break,
                }
            };

            let (build, entry_committable) = entry;
            let data = match build() {
                Ok(d) => d,
                Err(e) => {
                    warn!(version = next_version, error = %e, "pending entry failed to serialise");
                    return CommitOutcome::NoReplicate;
                }
            };

            if let Some(h) = &history {
                h.append_entry(&data);
            }

            debug!(version = next_version, size = data.len(), "batching entry");
            batch.push((next_version, Arc::new(data), entry_committable));
        }

        if batch.is_empty() {
            return CommitOutcome::Ok(txid);
        }

        let batched = batch.len() as u64;
        if sink.replicate(batch, term) {
            let mut vs = self.vs.lock();
            if vs.last_replicated == prev_replicated && vs.rollback_count == prev_rollbacks {
                vs.last_replicated = prev_replicated + batched;
            }
            CommitOutcome::Ok(txid)
        } else {
            debug!("replication sink refused batch");
            CommitOutcome::NoReplicate
        }
    }

    // ------------------------------------------------------------------
    // Deserialise (replicated entry replay)
    // ------------------------------------------------------------------

    /// Apply an entry produced by another replica at the same schema.
    /// PUBLIC maps are always applied; PRIVATE maps are skipped when
    /// `public_only`. An error rejects the entry: the caller requests
    /// retransmission.
    pub fn deserialise(&self, data: &[u8], public_only: bool) -> Result<ApplyOutcome, KvError> {
        let encryptor = self.encryptor.read().clone();
        let entry = deserialise_entry(data, encryptor.as_deref(), public_only)?;
        let v = entry.version;

        // Discard any local commits that did not propagate through
        // consensus before this entry.
        self.rollback(v.saturating_sub(1), None)?;

        if self.config.strict_versions {
            let current = self.current_version();
            if current != v.saturating_sub(1) {
                return Err(KvError::NonContiguous {
                    version: v,
                    current,
                });
            }
        }

        let mut touched: Vec<Arc<RwLock<Map>>> = Vec::new();
        let mut names: Vec<&str> = Vec::new();
        {
            let registry = self.maps.upgradable_read();
            let mut registry = parking_lot::RwLockUpgradableReadGuard::upgrade(registry);
            for seg in &entry.segments {
                let map = match registry.get(&seg.name) {
                    Some((_, m)) => m.clone(),
                    None => {
                        debug!(map = %seg.name, version = v, "creating map during deserialise");
                        let m = Arc::new(RwLock::new(Map::new(
                            seg.name.clone(),
                            parse_security_domain(&seg.name),
                            self.config.replicate.is_replicated(&seg.name),
                        )));
                        registry.insert(seg.name.clone(), (v, m.clone()));
                        m
                    }
                };
                map.write().apply_commit(v, seg.writes.clone());
                touched.push(map);
                names.push(&seg.name);
            }
        }

        {
            let mut vs = self.vs.lock();
            vs.version = v;
            vs.last_replicated = v;
        }

        for map in &touched {
            map.read().trigger_local_hook();
        }

        let history = self.history.read().clone();
        let outcome = if names.contains(&reserved::SIGNATURES) {
            // A signature entry must contain only the signature.
            if names.len() != 1 {
                return Err(KvError::MixedSignatureEntry(v));
            }
            let term = match &history {
                Some(h) => h
                    .verify_signature()
                    .map_err(|_| KvError::SignatureInvalid(v))?,
                None => 0,
            };
            ApplyOutcome::PassSignature(term)
        } else if names.contains(&reserved::BACKUP_SIGNATURES) {
            ApplyOutcome::PassBackupSignature
        } else if names.contains(&reserved::NONCES) {
            ApplyOutcome::PassNonces
        } else if names.contains(&reserved::SNAPSHOT_EVIDENCE) {
            ApplyOutcome::PassSnapshotEvidence
        } else if names.contains(&reserved::PRE_PREPARES) {
            ApplyOutcome::PassPrePrepare
        } else if names.contains(&reserved::NEW_VIEWS) {
            ApplyOutcome::PassNewView
        } else {
            ApplyOutcome::Pass
        };

        if let Some(h) = &history {
            h.append_entry(data);
        }

        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Compact / rollback
    // ------------------------------------------------------------------

    /// Commit globally up to `v`: coalesce versioned writes, fire global
    /// hooks in version order, advance the encryptor and history.
    pub fn compact(&self, v: Version) {
        let registry = self.maps.read();
        if v > self.current_version() {
            return;
        }

        for (_, map) in registry.values() {
            map.write().compact(v);
        }

        {
            let mut vs = self.vs.lock();
            if v > vs.compacted {
                vs.compacted = v;
            }
        }

        if let Some(h) = self.history.read().clone() {
            h.compact(v);
        }
        if let Some(e) = self.encryptor.read().clone() {
            e.compact(v);
        }

        for (_, map) in registry.values() {
            map.write().post_compact();
        }
    }

    /// Roll the store back to `v`. The term, when supplied, is always
    /// updated even if the version needs no change.
    pub fn rollback(&self, v: Version, term: Option<Term>) -> Result<(), KvError> {
        let mut registry = self.maps.write();

        {
            let mut vs = self.vs.lock();
            if let Some(t) = term {
                vs.term = t;
            }
            if v >= vs.version {
                return Ok(());
            }
            if v < vs.compacted {
                return Err(KvError::RollbackBelowCommit {
                    requested: v,
                    committed: vs.compacted,
                });
            }
        }

        let mut forget = Vec::new();
        for (name, (created_at, map)) in registry.iter() {
            map.write().rollback(v);
            if *created_at != NO_VERSION && *created_at > v {
                forget.push(name.clone());
            }
        }
        for name in forget {
            debug!(map = %name, "forgetting map created above rollback point");
            registry.remove(&name);
        }

        {
            let mut vs = self.vs.lock();
            vs.version = v;
            vs.last_replicated = v;
            vs.last_committable = v;
            vs.rollback_count += 1;
            vs.pending.clear();
        }

        if let Some(h) = self.history.read().clone() {
            h.rollback(v);
        }
        if let Some(e) = self.encryptor.read().clone() {
            e.rollback(v);
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Capture the committed state at `v`. Fails outside
    /// `[commit_version, current_version]`.
    pub fn snapshot(&self, v: Version) -> Result<StoreSnapshot, KvError> {
        {
            let vs = self.vs.lock();
            if v < vs.compacted || v > vs.version {
                return Err(KvError::SnapshotOutOfRange {
                    requested: v,
                    committed: vs.compacted,
                    current: vs.version,
                });
            }
        }

        let registry = self.maps.read();
        let mut snap = StoreSnapshot::new(v);
        for (_, map) in registry.values() {
            let map = map.read();
            snap.add_map(
                map.name().to_string(),
                map.is_replicated(),
                map.snapshot_state(v),
            );
        }

        if let Some(h) = self.history.read().clone() {
            if let Some(leaf) = h.raw_leaf(v) {
                snap.set_hash_at_snapshot(leaf);
            }
        }
        if let Some(sink) = self.sink.read().clone() {
            snap.set_view_history(sink.view_history_until(v));
        }

        Ok(snap)
    }

    /// Serialise a snapshot, sealing private maps with the encryptor.
    pub fn serialise_snapshot(&self, snap: &StoreSnapshot) -> Result<Vec<u8>, KvError> {
        snap.serialise(self.encryptor.read().clone().as_deref())
    }

    /// Apply a serialised snapshot to this (empty) store. Returns the
    /// snapshot version and the view history it carried.
    pub fn deserialise_snapshot(
        &self,
        data: &[u8],
        public_only: bool,
    ) -> Result<(Version, Vec<Version>), KvError> {
        let encryptor = self.encryptor.read().clone();
        let snap = StoreSnapshot::deserialise(data, encryptor.as_deref(), public_only)?;
        let v = snap.version();

        {
            let mut registry = self.maps.write();
            for m in snap.maps() {
                let map = match registry.get(&m.name) {
                    Some((_, existing)) => existing.clone(),
                    None => {
                        let created = Arc::new(RwLock::new(Map::new(
                            m.name.clone(),
                            parse_security_domain(&m.name),
                            self.config.replicate.is_replicated(&m.name),
                        )));
                        registry.insert(m.name.clone(), (NO_VERSION, created.clone()));
                        created
                    }
                };
                map.write().apply_snapshot(v, m.state.clone());
            }
        }

        {
            let mut vs = self.vs.lock();
            vs.version = v;
            vs.last_replicated = v;
            vs.last_committable = v;
            vs.compacted = v;
        }

        if let Some(h) = self.history.read().clone() {
            if let Some(leaf) = snap.hash_at_snapshot() {
                if !h.init_from_snapshot(leaf) {
                    return Err(KvError::SignatureInvalid(v));
                }
            }
        }

        Ok((v, snap.view_history().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl ReplicationSink for NullSink {
        fn replicate(&self, _: Vec<(Version, Arc<Vec<u8>>, bool)>, _: Term) -> bool {
            true
        }
    }

    struct RefusingSink;
    impl ReplicationSink for RefusingSink {
        fn replicate(&self, _: Vec<(Version, Arc<Vec<u8>>, bool)>, _: Term) -> bool {
            false
        }
    }

    #[test]
    fn reserved_maps_exist_from_genesis() {
        let store = Store::new(StoreConfig::replicated());
        assert!(store.get_map(NO_VERSION, reserved::SIGNATURES).is_some());
        assert!(store.get_map(NO_VERSION, reserved::NODES).is_some());
    }

    #[test]
    fn create_map_rejects_reserved_prefix() {
        let store = Store::new(StoreConfig::replicated());
        assert!(matches!(
            store.create_map("public:quill.sneaky"),
            Err(KvError::ReservedMapName(_))
        ));
        store.create_map("public:accounts").unwrap();
        assert!(matches!(
            store.create_map("public:accounts"),
            Err(KvError::MapExists(_))
        ));
    }

    #[test]
    fn commit_without_sink_is_local() {
        let store = Store::new(StoreConfig::replicated());
        store.create_map("a").unwrap();

        let mut tx = store.create_tx();
        tx.put("a", b"k", b"v");
        let outcome = tx.commit().unwrap();
        assert!(outcome.is_ok());
        assert_eq!(store.current_version(), 1);
    }

    #[test]
    fn refused_replication_surfaces_no_replicate() {
        let store = Store::new(StoreConfig::replicated());
        store.set_replication(Arc::new(RefusingSink));
        store.create_map("a").unwrap();

        let mut tx = store.create_tx();
        tx.put("a", b"k", b"v");
        assert_eq!(tx.commit().unwrap(), CommitOutcome::NoReplicate);
    }

    #[test]
    fn stale_term_commit_is_refused() {
        let store = Store::new(StoreConfig::replicated());
        store.set_replication(Arc::new(NullSink));
        store.create_map("a").unwrap();

        let mut tx = store.create_tx();
        tx.put("a", b"k", b"v");
        // A view change intervenes between read and commit.
        let _ = tx.get("a", b"k");
        store.set_term(5);
        assert_eq!(tx.commit().unwrap(), CommitOutcome::NoReplicate);
    }

    struct CaptureSink(Mutex<Vec<Vec<u8>>>);
    impl ReplicationSink for CaptureSink {
        fn replicate(&self, entries: Vec<(Version, Arc<Vec<u8>>, bool)>, _: Term) -> bool {
            self.0
                .lock()
                .extend(entries.into_iter().map(|(_, d, _)| (*d).clone()));
            true
        }
    }

    #[test]
    fn rollback_forgets_dynamic_maps() {
        let store = Store::new(StoreConfig::replicated());
        let peer = Store::new(StoreConfig::replicated());
        let capture = Arc::new(CaptureSink(Mutex::new(Vec::new())));
        peer.set_replication(capture.clone());
        peer.create_map("public:dyn").unwrap();

        // Build an entry on a peer and replay it here to create the map
        // dynamically.
        let mut tx = peer.create_tx();
        tx.put("public:dyn", b"k", b"v");
        assert!(tx.commit().unwrap().is_ok());
        let data = capture.0.lock()[0].clone();

        assert_eq!(store.deserialise(&data, false).unwrap(), ApplyOutcome::Pass);
        assert!(store.get_map_now("public:dyn").is_some());

        store.rollback(0, None).unwrap();
        assert!(store.get_map_now("public:dyn").is_none());
    }

    #[test]
    fn rollback_below_commit_is_refused() {
        let store = Store::new(StoreConfig::replicated());
        store.create_map("a").unwrap();
        let mut tx = store.create_tx();
        tx.put("a", b"k", b"v");
        tx.commit().unwrap();
        store.compact(1);

        assert!(matches!(
            store.rollback(0, None),
            Err(KvError::RollbackBelowCommit { .. })
        ));
    }

    #[test]
    fn commit_gap_tracks_committable() {
        let store = Store::new(StoreConfig::replicated());
        store.set_replication(Arc::new(NullSink));
        store.create_map("a").unwrap();

        for i in 0..3u8 {
            let mut tx = store.create_tx();
            tx.put("a", &[i], b"v");
            assert!(tx.commit().unwrap().is_ok());
        }
        assert_eq!(store.commit_gap(), 3);
    }
}
