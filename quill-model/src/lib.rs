//! Quill Model
//!
//! Core data types for the Quill replicated ledger, decoupled from the
//! store, ledger, channel, and consensus crates that build on them.

pub mod codec;
pub mod crypto;
pub mod node;
pub mod types;

pub use codec::{RawReader, RawWriter};
pub use node::{NodeRecord, NodeStatus};
pub use types::{Hash, Nonce, PubKey, Signature};
pub use types::{NodeId, SeqNo, Term, TxId, Version, View, NO_NODE, NO_VERSION};
