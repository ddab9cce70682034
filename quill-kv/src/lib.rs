//! Quill KV
//!
//! Multi-version, multi-map transactional store. Transactions read at a
//! snapshot version and commit through a single logical version clock;
//! committed entries are serialised for replication and replayed on
//! other replicas via [`Store::deserialise`]. Compaction coalesces
//! versioned writes and fires global hooks; rollback truncates above a
//! version. The store knows nothing about consensus beyond the
//! [`ReplicationSink`] and [`TxHistory`] traits it calls through.

pub mod encryptor;
pub mod map;
pub mod serialise;
pub mod snapshot;
pub mod store;
pub mod tx;
pub mod types;

pub use encryptor::{Encryptor, TxEncryptor};
pub use map::{Map, Write, WriteSet};
pub use snapshot::StoreSnapshot;
pub use store::{Store, StoreConfig};
pub use tx::Transaction;
pub use types::{
    maps, parse_security_domain, ApplyOutcome, CommitOutcome, KvError, ReplicateScope,
    ReplicationSink, SecurityDomain, TxHistory, PUBLIC_MAP_PREFIX, RESERVED_MAP_PREFIX,
};
