//! Consensus configurations
//!
//! A configuration is the set of node identities eligible to vote and
//! to count toward quorum from a given log index. Reconfiguration
//! enqueues a new configuration; commit crossing the *next*
//! configuration's index retires all prior ones.

use std::collections::BTreeMap;

use quill_model::{NodeId, Version};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub hostname: String,
    pub port: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    /// The configuration takes effect from this index.
    pub idx: Version,
    pub nodes: BTreeMap<NodeId, NodeInfo>,
}

impl Configuration {
    pub fn new(idx: Version, nodes: BTreeMap<NodeId, NodeInfo>) -> Self {
        Self { idx, nodes }
    }

    /// Maximum tolerated Byzantine faults for this configuration.
    pub fn max_faults(&self) -> usize {
        self.nodes.len().saturating_sub(1) / 3
    }
}
