//! Quill Ledger
//!
//! Framed, chunked, append-only log of serialised transactions. Entries
//! are written at contiguous indices starting at 1; a chunk is sealed
//! when it crosses the size threshold at a committable entry, or when a
//! new chunk is forced (a snapshot is about to be taken). Committed
//! chunks are renamed to `ledger_<first>-<last>.committed`, which is how
//! downstream consumers observe the durable commit boundary.
//!
//! This is the only persistent state in the system: everything else is
//! rebuilt by replaying it.

pub mod chunk;
pub mod frame;
pub mod ledger;

pub use frame::{frame_entry, FrameCursor, FRAME_HEADER_LEN};
pub use ledger::Ledger;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed ledger file {0}: {1}")]
    Malformed(String, String),

    #[error("ledger file name {0:?} does not contain a start index")]
    BadFileName(String),

    #[error("unknown entry range {from}..={to}")]
    BadRange { from: u64, to: u64 },

    #[error("chunk threshold must be between 1 and {max}, got {got}")]
    BadThreshold { got: usize, max: usize },
}
