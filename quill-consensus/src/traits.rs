//! Capability sets consumed by the engines
//!
//! Polymorphism over the ledger, the channel layer, and the snapshotter
//! at the consensus boundary: production and test implementations
//! satisfy the same contracts.

use quill_model::{NodeId, Version};

/// The engine's view of the ledger.
pub trait LedgerSink: Send {
    fn put_entry(&mut self, data: &[u8], committable: bool, force_chunk: bool);
    fn truncate(&mut self, idx: Version);
    fn commit(&mut self, idx: Version);
    fn init(&mut self, idx: Version);
    fn get_entry(&mut self, idx: Version) -> Option<Vec<u8>>;
    /// Framed entries covering `from..=to`, for AppendEntries payloads.
    fn framed_entries(&mut self, from: Version, to: Version) -> Option<Vec<u8>>;
}

impl LedgerSink for quill_ledger::Ledger {
    fn put_entry(&mut self, data: &[u8], committable: bool, force_chunk: bool) {
        if let Err(e) = quill_ledger::Ledger::put_entry(self, data, committable, force_chunk) {
            // Transient IO: the entry is abandoned and re-derived from
            // the progress tracker on the next send.
            tracing::warn!(error = %e, "ledger append failed");
        }
    }

    fn truncate(&mut self, idx: Version) {
        if let Err(e) = quill_ledger::Ledger::truncate(self, idx) {
            tracing::warn!(error = %e, idx, "ledger truncate failed");
        }
    }

    fn commit(&mut self, idx: Version) {
        if let Err(e) = quill_ledger::Ledger::commit(self, idx) {
            tracing::warn!(error = %e, idx, "ledger commit failed");
        }
    }

    fn init(&mut self, idx: Version) {
        quill_ledger::Ledger::init(self, idx)
    }

    fn get_entry(&mut self, idx: Version) -> Option<Vec<u8>> {
        quill_ledger::Ledger::get_entry(self, idx).ok().flatten()
    }

    fn framed_entries(&mut self, from: Version, to: Version) -> Option<Vec<u8>> {
        quill_ledger::Ledger::read_framed_entries(self, from, to)
            .ok()
            .flatten()
    }
}

/// The engine's view of the channel layer. `send` hands an
/// already-encoded message to the channel/host path and must not
/// block; failures surface as a false return and the transfer is
/// re-derived from per-peer progress.
pub trait Outbound: Send + Sync {
    fn send(&self, to: NodeId, msg: &[u8]) -> bool;
    fn create_channel(&self, peer: NodeId, hostname: &str, port: &str);
    fn destroy_channel(&self, peer: NodeId);
    fn close_all_outgoing(&self);
    fn destroy_all(&self);
}

/// The engine's view of the snapshotter.
pub trait Snapshotter: Send + Sync {
    /// Would committing `idx` warrant a snapshot (and therefore a
    /// forced ledger chunk at the committable entry)?
    fn requires_snapshot(&self, idx: Version) -> bool;

    /// Generate a snapshot at `idx` (leader/primary only).
    fn snapshot(&self, idx: Version);

    /// The commit boundary advanced.
    fn compact(&self, idx: Version);

    fn rollback(&self, idx: Version);

    /// Resuming from a snapshot at `idx`.
    fn set_last_snapshot_idx(&self, idx: Version);
}

/// No-op snapshotter for stores that never snapshot (tests, tools).
pub struct NullSnapshotter;

impl Snapshotter for NullSnapshotter {
    fn requires_snapshot(&self, _: Version) -> bool {
        false
    }
    fn snapshot(&self, _: Version) {}
    fn compact(&self, _: Version) {}
    fn rollback(&self, _: Version) {}
    fn set_last_snapshot_idx(&self, _: Version) {}
}
