//! Quill Node
//!
//! Wires the subsystems into a replica: the store gets its history and
//! replication sink, the history gets the node signing key and a commit
//! source, channels get the network key, and the consensus engine gets
//! the ledger, channels, and snapshotter. Construction order is
//! store → encryptor → history → channels → consensus.
//!
//! The transport below the channel layer and the RPC surface above the
//! store are out of scope: the node exposes `recv_frame` / `outbox` to
//! whatever host process carries bytes, and `create_tx` to whatever
//! frontend builds transactions.

pub mod config;
pub mod node;
pub mod snapshotter;

pub use config::{NodeConfig, PeerConfig};
pub use node::{Engine, Node, OutboxReceiver};
pub use snapshotter::NodeSnapshotter;

use thiserror::Error;

/// Initialise logging from `RUST_LOG`. Safe to call more than once.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error: {0}")]
    Ledger(#[from] quill_ledger::LedgerError),

    #[error("channel error: {0}")]
    Channel(#[from] quill_channel::ChannelError),

    #[error("kv error: {0}")]
    Kv(#[from] quill_kv::KvError),
}
