//! A single peer channel
//!
//! Lifecycle: INITIATED (key-exchange context live, peer public not yet
//! verified) → ESTABLISHED (AES-GCM key derived). The exchange context
//! is consumed on establishment.
//!
//! Multiple sender threads share a channel: the send counter is a
//! monotonic atomic, and received counters are tracked per lane, each
//! updated only after the AEAD check passes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::warn;

use quill_model::crypto::{self, AeadKey, KeyExchange};

use crate::header::{MsgHeader, RecvNonce};
use crate::ChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Initiated,
    Established,
}

const KEY_CONTEXT: &str = "quill node channel v1";

enum State {
    Initiated(KeyExchange),
    Established(AeadKey),
}

pub struct Channel {
    state: RwLock<State>,
    /// Set for channels created implicitly by inbound traffic; an
    /// outgoing connection upgrade clears it.
    incoming_only: RwLock<bool>,
    send_counter: AtomicU64,
    /// Last accepted counter per receive lane.
    recv_lanes: Mutex<BTreeMap<u8, u64>>,
}

impl Channel {
    pub fn new(incoming_only: bool) -> Self {
        Self {
            state: RwLock::new(State::Initiated(KeyExchange::new())),
            incoming_only: RwLock::new(incoming_only),
            send_counter: AtomicU64::new(1),
            recv_lanes: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn status(&self) -> ChannelStatus {
        match *self.state.read() {
            State::Initiated(_) => ChannelStatus::Initiated,
            State::Established(_) => ChannelStatus::Established,
        }
    }

    pub fn is_incoming_only(&self) -> bool {
        *self.incoming_only.read()
    }

    pub fn set_outgoing(&self) {
        *self.incoming_only.write() = false;
    }

    pub fn set_incoming_only(&self) {
        *self.incoming_only.write() = true;
    }

    /// Our key-exchange public, available until establishment.
    pub fn own_public(&self) -> Option<[u8; 32]> {
        match &*self.state.read() {
            State::Initiated(ctx) => Some(ctx.own_public()),
            State::Established(_) => None,
        }
    }

    /// Derive the channel key from the peer's (already verified)
    /// public half. Consumes the exchange context.
    pub fn establish(&self, peer_public: &[u8; 32]) -> Result<(), ChannelError> {
        let mut state = self.state.write();
        let ctx = match &*state {
            State::Initiated(ctx) => ctx,
            State::Established(_) => return Err(ChannelError::AlreadyEstablished),
        };
        let shared = ctx
            .shared_secret(peer_public)
            .map_err(|_| ChannelError::BadHandshake)?;
        let key = crypto::derive_key(KEY_CONTEXT, &shared);
        *state = State::Established(AeadKey::new(&key));
        Ok(())
    }

    fn next_nonce(&self, lane: u8) -> RecvNonce {
        RecvNonce::new(lane, self.send_counter.fetch_add(1, Ordering::Relaxed))
    }

    fn with_key<T>(
        &self,
        f: impl FnOnce(&AeadKey) -> Result<T, ChannelError>,
    ) -> Result<T, ChannelError> {
        match &*self.state.read() {
            State::Established(key) => f(key),
            State::Initiated(_) => Err(ChannelError::NotEstablished),
        }
    }

    /// Tag authenticated-but-unencrypted data. Used for consensus
    /// messages whose body is public but integrity-sensitive.
    pub fn tag(&self, lane: u8, aad: &[u8]) -> Result<MsgHeader, ChannelError> {
        let mut header = MsgHeader::new(self.next_nonce(lane));
        self.with_key(|key| {
            let (_, tag) = key.seal(&header.iv, aad, &[]).map_err(|_| ChannelError::Aead)?;
            header.tag = tag;
            Ok(header)
        })
    }

    /// Encrypt a confidential payload, authenticating `aad` alongside.
    pub fn encrypt(
        &self,
        lane: u8,
        aad: &[u8],
        plain: &[u8],
    ) -> Result<(MsgHeader, Vec<u8>), ChannelError> {
        let mut header = MsgHeader::new(self.next_nonce(lane));
        self.with_key(|key| {
            let (cipher, tag) = key
                .seal(&header.iv, aad, plain)
                .map_err(|_| ChannelError::Aead)?;
            header.tag = tag;
            Ok((header, cipher))
        })
    }

    fn verify_or_decrypt(
        &self,
        header: &MsgHeader,
        aad: &[u8],
        cipher: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        let nonce = header.nonce();

        {
            let lanes = self.recv_lanes.lock();
            let last = lanes.get(&nonce.lane).copied().unwrap_or(0);
            if nonce.counter <= last {
                warn!(
                    lane = nonce.lane,
                    received = nonce.counter,
                    last,
                    "invalid nonce, possible replay attack"
                );
                return Err(ChannelError::InvalidNonce {
                    lane: nonce.lane,
                    received: nonce.counter,
                    last,
                });
            }
        }

        let plain = self.with_key(|key| {
            key.open(&header.iv, aad, cipher, &header.tag)
                .map_err(|_| ChannelError::Aead)
        })?;

        // Only a successful AEAD check advances the lane.
        self.recv_lanes.lock().insert(nonce.lane, nonce.counter);
        Ok(plain)
    }

    /// Verify a tag-only frame. Rejection leaves the channel state
    /// unchanged.
    pub fn verify(&self, header: &MsgHeader, aad: &[u8]) -> Result<(), ChannelError> {
        self.verify_or_decrypt(header, aad, &[]).map(|_| ())
    }

    /// Verify and decrypt an encrypted frame.
    pub fn decrypt(
        &self,
        header: &MsgHeader,
        aad: &[u8],
        cipher: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        self.verify_or_decrypt(header, aad, cipher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn established_pair() -> (Channel, Channel) {
        let a = Channel::new(false);
        let b = Channel::new(false);
        let a_pub = a.own_public().unwrap();
        let b_pub = b.own_public().unwrap();
        a.establish(&b_pub).unwrap();
        b.establish(&a_pub).unwrap();
        (a, b)
    }

    #[test]
    fn lifecycle() {
        let c = Channel::new(false);
        assert_eq!(c.status(), ChannelStatus::Initiated);
        assert!(c.tag(0, b"x").is_err());

        let peer = Channel::new(false);
        c.establish(&peer.own_public().unwrap()).unwrap();
        assert_eq!(c.status(), ChannelStatus::Established);
        assert!(c.own_public().is_none());
        assert_eq!(
            c.establish(&[9u8; 32]),
            Err(ChannelError::AlreadyEstablished)
        );
    }

    #[test]
    fn tag_verify_roundtrip() {
        let (a, b) = established_pair();
        let header = a.tag(0, b"consensus message").unwrap();
        b.verify(&header, b"consensus message").unwrap();

        let header = a.tag(0, b"another").unwrap();
        assert_eq!(b.verify(&header, b"forged"), Err(ChannelError::Aead));
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (a, b) = established_pair();
        let (header, cipher) = a.encrypt(0, b"aad", b"secret").unwrap();
        assert_eq!(b.decrypt(&header, b"aad", &cipher).unwrap(), b"secret");
    }

    #[test]
    fn replay_is_rejected_without_state_change() {
        let (a, b) = established_pair();

        // Frames 1..=6 to advance the counter, accept frame 7.
        for _ in 0..6 {
            let h = a.tag(0, b"m").unwrap();
            b.verify(&h, b"m").unwrap();
        }
        let frame7 = a.tag(0, b"m7").unwrap();
        assert_eq!(frame7.nonce().counter, 7);
        b.verify(&frame7, b"m7").unwrap();

        // Identical replay of frame 7 is rejected.
        assert!(matches!(
            b.verify(&frame7, b"m7"),
            Err(ChannelError::InvalidNonce {
                received: 7,
                last: 7,
                ..
            })
        ));

        // Frame 8 is still accepted: the failed replay changed nothing.
        let frame8 = a.tag(0, b"m8").unwrap();
        b.verify(&frame8, b"m8").unwrap();
    }

    #[test]
    fn failed_aead_does_not_advance_lane() {
        let (a, b) = established_pair();
        let h1 = a.tag(0, b"one").unwrap();
        // Tamper: verification fails, counter 1 stays available.
        assert_eq!(b.verify(&h1, b"tampered"), Err(ChannelError::Aead));
        b.verify(&h1, b"one").unwrap();
    }

    #[test]
    fn lanes_are_independent() {
        let (a, b) = established_pair();
        let h_lane0 = a.tag(0, b"x").unwrap();
        let h_lane5 = a.tag(5, b"y").unwrap();

        // Lane 5's counter (2) does not constrain lane 0's (1), in
        // either acceptance order.
        b.verify(&h_lane5, b"y").unwrap();
        b.verify(&h_lane0, b"x").unwrap();
    }

    #[test]
    fn out_of_order_within_lane_rejected() {
        let (a, b) = established_pair();
        let h1 = a.tag(0, b"one").unwrap();
        let h2 = a.tag(0, b"two").unwrap();
        b.verify(&h2, b"two").unwrap();
        assert!(matches!(
            b.verify(&h1, b"one"),
            Err(ChannelError::InvalidNonce { .. })
        ));
    }
}
