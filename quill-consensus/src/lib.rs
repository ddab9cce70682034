//! Quill Consensus
//!
//! The replication core. A node runs exactly one of two engines, fixed
//! at construction:
//!
//! - [`CftConsensus`]: leader-based log replication (a Raft variant)
//!   with committable signature boundaries and joint-configuration
//!   commit;
//! - [`BftConsensus`]: three-phase ordering (a PBFT variant) with
//!   signed responses, nonce-reveal commit evidence, checkpoints, view
//!   change, and state transfer, replaying through the transactional
//!   KV store.
//!
//! The engines consume the ledger, channels, and snapshotter through
//! trait capability sets so production and test implementations satisfy
//! the same contracts.

pub mod bft;
pub mod cft;
pub mod config;
pub mod messages;
pub mod progress;
pub mod traits;
pub mod view_history;

pub use bft::{BftConsensus, KvExecutor, KvRequest, RequestExecutor};
pub use cft::CftConsensus;
pub use config::{Configuration, NodeInfo};
pub use messages::{MsgHeader, MsgTag};
pub use progress::{ProgressTracker, TrackerResult};
pub use traits::{LedgerSink, Outbound, Snapshotter};
pub use view_history::ViewHistory;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("malformed message: {0}")]
    Malformed(#[from] quill_model::codec::CodecError),

    #[error("message length {got} disagrees with tag {tag:?}")]
    BadLength { tag: messages::MsgTag, got: usize },

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("not the leader")]
    NotLeader,

    #[error("invariant violation: {0}")]
    Invariant(String),
}
