//! Snapshotter
//!
//! Decides when a commit warrants a snapshot and generates them outside
//! the engine's lock: the engine only marks a snapshot as due, and the
//! node's periodic loop calls [`NodeSnapshotter::flush`] to produce it,
//! write it to the snapshots directory, and commit the snapshot
//! evidence (the digest of the serialised snapshot) through the KV.
//!
//! A generated snapshot is only trustworthy once the ledger chunk
//! containing its evidence commits; until then it is pending.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use quill_consensus::Snapshotter;
use quill_kv::{maps, Store};
use quill_model::codec::RawWriter;
use quill_model::{crypto, Version};

struct PendingSnapshot {
    version: Version,
    evidence_version: Version,
}

pub struct NodeSnapshotter {
    store: Arc<Store>,
    snapshots_dir: PathBuf,
    snapshot_tx_interval: u64,

    last_snapshot_idx: Mutex<Version>,
    /// Snapshot request from the engine, generated at the next flush.
    due: Mutex<Option<Version>>,
    /// Generated snapshots whose evidence has not committed yet.
    pending: Mutex<Vec<PendingSnapshot>>,
}

impl NodeSnapshotter {
    pub fn new(
        store: Arc<Store>,
        snapshots_dir: PathBuf,
        snapshot_tx_interval: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            snapshots_dir,
            snapshot_tx_interval,
            last_snapshot_idx: Mutex::new(0),
            due: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn last_snapshot_idx(&self) -> Version {
        *self.last_snapshot_idx.lock()
    }

    /// Generate any due snapshot. Called from the node loop, never from
    /// inside the engine.
    pub fn flush(&self) {
        let Some(version) = self.due.lock().take() else {
            return;
        };

        let snapshot = match self.store.snapshot(version) {
            Ok(s) => s,
            Err(e) => {
                warn!(version, error = %e, "snapshot generation failed");
                return;
            }
        };
        let data = match self.store.serialise_snapshot(&snapshot) {
            Ok(d) => d,
            Err(e) => {
                warn!(version, error = %e, "snapshot serialisation failed");
                return;
            }
        };

        if let Err(e) = std::fs::create_dir_all(&self.snapshots_dir) {
            warn!(error = %e, "cannot create snapshots directory");
            return;
        }
        let path = self.snapshots_dir.join(format!("snapshot_{}", version));
        if let Err(e) = std::fs::write(&path, &data) {
            warn!(error = %e, "cannot write snapshot file");
            return;
        }

        // Snapshot evidence: the digest of the serialised snapshot,
        // committed through the KV so it replicates and lands in the
        // ledger.
        let digest = crypto::content_hash(&data);
        let mut record = RawWriter::new();
        record.write_u64(version);
        record.write_array(digest.as_bytes());

        let mut tx = self.store.create_tx();
        tx.put(maps::SNAPSHOT_EVIDENCE, b"0", &record.into_vec());
        let evidence_version = match tx.commit() {
            Ok(outcome) if outcome.is_ok() => self.store.current_version(),
            other => {
                warn!(version, ?other, "snapshot evidence did not commit");
                return;
            }
        };

        info!(version, evidence_version, "snapshot generated");
        *self.last_snapshot_idx.lock() = version;
        self.pending.lock().push(PendingSnapshot {
            version,
            evidence_version,
        });
    }

    /// Snapshots whose evidence has committed durably.
    pub fn committed_snapshots(&self) -> Vec<Version> {
        let commit = self.store.commit_version();
        self.pending
            .lock()
            .iter()
            .filter(|p| p.evidence_version <= commit)
            .map(|p| p.version)
            .collect()
    }
}

impl Snapshotter for NodeSnapshotter {
    fn requires_snapshot(&self, idx: Version) -> bool {
        idx.saturating_sub(*self.last_snapshot_idx.lock()) >= self.snapshot_tx_interval
    }

    fn snapshot(&self, idx: Version) {
        if !self.requires_snapshot(idx) {
            return;
        }
        debug!(idx, "snapshot due");
        *self.due.lock() = Some(idx);
    }

    fn compact(&self, idx: Version) {
        // Evidence below the commit boundary is firm; forget older
        // pending entries.
        self.pending
            .lock()
            .retain(|p| p.evidence_version > idx || p.version >= idx);
    }

    fn rollback(&self, idx: Version) {
        let mut due = self.due.lock();
        if matches!(*due, Some(v) if v > idx) {
            *due = None;
        }
        self.pending.lock().retain(|p| p.version <= idx);
    }

    fn set_last_snapshot_idx(&self, idx: Version) {
        *self.last_snapshot_idx.lock() = idx;
    }
}
