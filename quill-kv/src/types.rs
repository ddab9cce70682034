//! Shared KV types, outcomes, and the traits that break the
//! Store ↔ History ↔ Consensus ownership cycle.

use quill_model::{Hash, Term, TxId, Version};
use thiserror::Error;

/// Maps whose names begin with this prefix are PUBLIC: serialised in the
/// clear and deserialised even in public-only recovery.
pub const PUBLIC_MAP_PREFIX: &str = "public:";

/// Internal maps carry this prefix inside their name; application maps
/// may not use it.
pub const RESERVED_MAP_PREFIX: &str = "quill.";

/// Well-known internal map names.
pub mod maps {
    /// Merkle-root signature records emitted by the history.
    pub const SIGNATURES: &str = "public:quill.signatures";
    /// Aggregated backup signatures written by the progress tracker.
    pub const BACKUP_SIGNATURES: &str = "public:quill.backup_signatures";
    /// Revealed commit-evidence nonces.
    pub const NONCES: &str = "public:quill.nonces";
    /// Snapshot evidence (digest of a serialised snapshot).
    pub const SNAPSHOT_EVIDENCE: &str = "public:quill.snapshot_evidence";
    /// Pre-prepare records written for BFT ledger playback.
    pub const PRE_PREPARES: &str = "public:quill.pre_prepares";
    /// New-view records written for BFT ledger playback.
    pub const NEW_VIEWS: &str = "public:quill.new_views";
    /// Node identities and their signing keys.
    pub const NODES: &str = "public:quill.nodes";
}

/// Security domain of a map. PUBLIC appears first in serialised entries
/// and is applied even during public-only recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityDomain {
    Public,
    Private,
}

/// Derive the security domain from a map name.
pub fn parse_security_domain(name: &str) -> SecurityDomain {
    if name.starts_with(PUBLIC_MAP_PREFIX) {
        SecurityDomain::Public
    } else {
        SecurityDomain::Private
    }
}

/// Whether a map name is reserved for internal use.
pub fn is_reserved_map_name(name: &str) -> bool {
    name.strip_prefix(PUBLIC_MAP_PREFIX)
        .unwrap_or(name)
        .starts_with(RESERVED_MAP_PREFIX)
}

/// Which maps replicate through consensus.
#[derive(Debug, Clone, Default)]
pub enum ReplicateScope {
    /// Every map replicates.
    #[default]
    All,
    /// No map replicates (node-local store).
    None,
    /// Only the named maps replicate.
    Some(std::collections::BTreeSet<String>),
}

impl ReplicateScope {
    pub fn is_replicated(&self, name: &str) -> bool {
        match self {
            ReplicateScope::All => true,
            ReplicateScope::None => false,
            ReplicateScope::Some(set) => set.contains(name),
        }
    }
}

/// Outcome of committing a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Committed locally and handed to replication.
    Ok(TxId),
    /// A key in the read set changed after the read version; retry with
    /// a fresh transaction.
    Conflict,
    /// Committed locally but the replication layer refused the batch.
    NoReplicate,
}

impl CommitOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommitOutcome::Ok(_))
    }
}

/// Classification of a successfully applied replicated entry.
///
/// Entries that touch the reserved maps are surfaced to the consensus
/// layer so it can run the matching protocol step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Ordinary application writes.
    Pass,
    /// A Merkle-root signature; delimits a committable boundary. Carries
    /// the term the signature was emitted in.
    PassSignature(Term),
    /// A replayed BFT pre-prepare record.
    PassPrePrepare,
    /// A replayed BFT new-view record.
    PassNewView,
    /// Aggregated backup signatures from the progress tracker.
    PassBackupSignature,
    /// Revealed nonces from the progress tracker.
    PassNonces,
    /// Snapshot evidence.
    PassSnapshotEvidence,
}

/// KV error taxonomy. Deserialisation failures reject the entry (the
/// replication layer requests retransmission); serialisation failures
/// are fatal for the transaction.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("map {0:?} already exists")]
    MapExists(String),

    #[error("map name {0:?} uses the reserved prefix")]
    ReservedMapName(String),

    #[error("transaction already committed")]
    AlreadyCommitted,

    #[error("entry at version {version} is not contiguous: store is at {current}")]
    NonContiguous { version: Version, current: Version },

    #[error("malformed entry: {0}")]
    Malformed(#[from] quill_model::codec::CodecError),

    #[error("signature entry failed verification at version {0}")]
    SignatureInvalid(Version),

    #[error("signature entry at version {0} contains other writes")]
    MixedSignatureEntry(Version),

    #[error("cannot decrypt private domain at version {0}")]
    DecryptFailed(Version),

    #[error("no encryption key valid for version {0}")]
    NoEncryptionKey(Version),

    #[error("cannot snapshot at {requested}: committed is {committed}, current is {current}")]
    SnapshotOutOfRange {
        requested: Version,
        committed: Version,
        current: Version,
    },

    #[error("rollback to {requested} crosses committed version {committed}")]
    RollbackBelowCommit {
        requested: Version,
        committed: Version,
    },
}

/// Transaction history consumed by the store: the Merkle tree over
/// serialised entries plus signature verification. Implemented by
/// `quill-merkle`.
pub trait TxHistory: Send + Sync {
    /// Extend the tree with the digest of a serialised entry.
    fn append_entry(&self, entry: &[u8]);

    /// Root over every appended entry.
    fn replicated_state_root(&self) -> Hash;

    /// Verify the most recent signature record against the signer's key
    /// registered in the nodes map. On success reports the term the
    /// signature was emitted in.
    fn verify_signature(&self) -> Result<Term, ()>;

    /// Discard tree state above `version`.
    fn rollback(&self, version: Version);

    /// Advance the flush point; receipts below it become unavailable.
    fn compact(&self, version: Version);

    /// The raw leaf digest at `version`, for snapshots.
    fn raw_leaf(&self, version: Version) -> Option<Hash>;

    /// Rebuild the tree from a snapshot's serialised tree plus the
    /// digest of the snapshot transaction itself.
    fn init_from_snapshot(&self, hash_at_snapshot: Hash) -> bool;
}

/// Replication sink consumed by the store on commit. Implemented by the
/// consensus engine.
pub trait ReplicationSink: Send + Sync {
    /// Hand a batch of `(version, serialised entry, committable)` to the
    /// replication layer. Entries are contiguous and in version order.
    /// Returns false if the sink refuses (wrong term, not leader).
    fn replicate(
        &self,
        entries: Vec<(Version, std::sync::Arc<Vec<u8>>, bool)>,
        term: Term,
    ) -> bool;

    /// View history up to `version`, captured into snapshots.
    fn view_history_until(&self, _version: Version) -> Vec<Version> {
        Vec::new()
    }
}
