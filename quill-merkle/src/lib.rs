//! Quill Merkle
//!
//! Append-only Merkle history over serialised transaction digests,
//! indexed by version. Two replicas that applied the same prefix of
//! entries hold bitwise-equal roots; a signature record at version `v`
//! commits to every entry with version `<= v`.

pub mod history;
pub mod record;
pub mod tree;

pub use history::{CommitSource, MerkleHistory, MAX_HISTORY_LEN};
pub use record::SignatureRecord;
pub use tree::{MerkleTree, Receipt};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("index {0} is below the flush point and no longer available")]
    Flushed(u64),

    #[error("index {0} is not yet in the tree")]
    Unknown(u64),

    #[error("malformed record: {0}")]
    Malformed(#[from] quill_model::codec::CodecError),

    #[error("no signature record in the signatures map")]
    NoSignature,

    #[error("signer {0} is not registered in the nodes map")]
    UnknownSigner(u64),

    #[error("signature verification failed")]
    BadSignature,
}
