//! Node configuration
//!
//! Deserialised from JSON. Key material is given as 32-byte hex seeds;
//! production deployments inject them from sealed storage, tests
//! generate them.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use quill_model::NodeId;

use crate::NodeError;

fn default_chunk_threshold() -> usize {
    5_000_000
}

fn default_request_timeout_ms() -> u64 {
    100
}

fn default_election_timeout_ms() -> u64 {
    1000
}

fn default_view_change_timeout_ms() -> u64 {
    5000
}

fn default_sig_tx_interval() -> u64 {
    5000
}

fn default_snapshot_tx_interval() -> u64 {
    10_000
}

fn default_checkpoint_interval() -> u64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub hostname: String,
    pub port: String,
    /// Hex Ed25519 public key.
    pub public_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Cft,
    Bft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub mode: Mode,

    /// 32-byte hex seed for the node signing key.
    pub signing_key_seed: String,
    /// 32-byte hex seed for the network (service) key.
    pub network_key_seed: String,
    /// 32-byte hex initial ledger encryption key.
    pub ledger_key: String,

    pub ledger_dir: PathBuf,
    pub snapshots_dir: PathBuf,

    #[serde(default = "default_chunk_threshold")]
    pub chunk_threshold: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,
    #[serde(default = "default_view_change_timeout_ms")]
    pub view_change_timeout_ms: u64,
    #[serde(default = "default_sig_tx_interval")]
    pub sig_tx_interval: u64,
    #[serde(default = "default_snapshot_tx_interval")]
    pub snapshot_tx_interval: u64,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,

    /// The initial configuration, this node included.
    pub peers: Vec<PeerConfig>,
}

impl NodeConfig {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, NodeError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn seed(hex_seed: &str) -> Result<[u8; 32], NodeError> {
        let bytes = hex::decode(hex_seed).map_err(|e| NodeError::Config(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|_| NodeError::Config("seed must be 32 bytes of hex".into()))
    }
}
