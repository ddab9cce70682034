//! Quill Channel
//!
//! Authenticated, encrypted, nonced point-to-point transport between
//! replicas. Each peer pair runs an X25519 key exchange whose public
//! halves are signed by the network key; the derived AES-256-GCM key
//! frames every message with a `(lane, counter)` IV. Per-lane counters
//! must strictly increase, so replays and reordering within a lane are
//! rejected before any state changes.

pub mod channel;
pub mod header;
pub mod manager;

pub use channel::{Channel, ChannelStatus};
pub use header::{MsgHeader, RecvNonce, MSG_HEADER_LEN};
pub use manager::ChannelManager;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is not established")]
    NotEstablished,

    #[error("channel is already established")]
    AlreadyEstablished,

    #[error("no channel with peer {0}")]
    UnknownPeer(u64),

    #[error("channel with peer {0} has been closed")]
    ClosedPeer(u64),

    #[error("invalid nonce on lane {lane}: received {received}, last seen {last}")]
    InvalidNonce { lane: u8, received: u64, last: u64 },

    #[error("AEAD verification failed")]
    Aead,

    #[error("peer channel public failed network signature check")]
    BadHandshake,

    #[error("malformed frame or handshake")]
    Malformed,
}
