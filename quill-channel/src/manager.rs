//! Channel manager
//!
//! Owns one channel per peer and the handshake that establishes them:
//! each side's X25519 public half is signed by the network key, so only
//! nodes the service has admitted can form channels. Closed channels
//! are tombstoned; a stale peer id is never re-used.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use quill_model::codec::{RawReader, RawWriter};
use quill_model::crypto;
use quill_model::{NodeId, PubKey};

use crate::channel::Channel;
use crate::header::{MsgHeader, MSG_HEADER_LEN};
use crate::ChannelError;

enum Slot {
    Open(Arc<Channel>),
    Closed,
}

pub struct ChannelManager {
    channels: Mutex<HashMap<NodeId, Slot>>,
    /// Network identity key: signs our channel publics, verifies peers'.
    network_key: ed25519_dalek::SigningKey,
    network_public: PubKey,
}

impl ChannelManager {
    pub fn new(network_key: ed25519_dalek::SigningKey) -> Self {
        let network_public = PubKey(network_key.verifying_key().to_bytes());
        Self {
            channels: Mutex::new(HashMap::new()),
            network_key,
            network_public,
        }
    }

    pub fn network_public(&self) -> PubKey {
        self.network_public
    }

    /// Create (or upgrade to outgoing) the channel with `peer`.
    pub fn create_channel(&self, peer: NodeId) -> Result<Arc<Channel>, ChannelError> {
        let mut channels = self.channels.lock();
        match channels.get(&peer) {
            Some(Slot::Closed) => return Err(ChannelError::ClosedPeer(peer)),
            Some(Slot::Open(existing)) => {
                if existing.is_incoming_only() {
                    debug!(peer, "upgrading incoming-only channel to outgoing");
                    existing.set_outgoing();
                }
                return Ok(existing.clone());
            }
            None => {}
        }
        info!(peer, "creating channel");
        let channel = Arc::new(Channel::new(false));
        channels.insert(peer, Slot::Open(channel.clone()));
        Ok(channel)
    }

    /// The channel with `peer`, creating an incoming-only one for
    /// unsolicited inbound traffic.
    pub fn get(&self, peer: NodeId) -> Result<Arc<Channel>, ChannelError> {
        let mut channels = self.channels.lock();
        match channels.get(&peer) {
            Some(Slot::Open(c)) => Ok(c.clone()),
            Some(Slot::Closed) => Err(ChannelError::ClosedPeer(peer)),
            None => {
                debug!(peer, "creating incoming-only channel");
                let channel = Arc::new(Channel::new(true));
                channels.insert(peer, Slot::Open(channel.clone()));
                Ok(channel)
            }
        }
    }

    /// Tombstone the channel with `peer`.
    pub fn close_channel(&self, peer: NodeId) {
        let mut channels = self.channels.lock();
        if channels.insert(peer, Slot::Closed).is_none() {
            warn!(peer, "closing a channel that does not exist");
        } else {
            info!(peer, "channel closed");
        }
    }

    /// Drop every channel entirely (retirement).
    pub fn destroy_all(&self) {
        self.channels.lock().clear();
    }

    /// Demote every channel to incoming-only (losing leadership).
    pub fn close_all_outgoing(&self) {
        for slot in self.channels.lock().values() {
            if let Slot::Open(c) = slot {
                c.set_incoming_only();
            }
        }
    }

    /// Our channel public for `peer`, signed by the network key and
    /// length-prefixed: `(public, signature)`.
    pub fn own_signed_public(&self, peer: NodeId) -> Result<Option<Vec<u8>>, ChannelError> {
        let channel = self.get(peer)?;
        let Some(public) = channel.own_public() else {
            // Already established.
            return Ok(None);
        };
        let signature = crypto::sign_bytes(&self.network_key, &public);
        let mut w = RawWriter::new();
        w.write_bytes(&public);
        w.write_bytes(signature.as_bytes());
        Ok(Some(w.into_vec()))
    }

    /// Verify a peer's signed channel public against the network key
    /// and establish the channel. Any parse or signature failure leaves
    /// the channel untouched.
    pub fn load_peer_signed_public(
        &self,
        peer: NodeId,
        signed_public: &[u8],
    ) -> Result<(), ChannelError> {
        let mut r = RawReader::new(signed_public);
        let public: [u8; 32] = r
            .read_bytes()
            .map_err(|_| ChannelError::Malformed)?
            .try_into()
            .map_err(|_| ChannelError::Malformed)?;
        let sig_bytes: [u8; 64] = r
            .read_bytes()
            .map_err(|_| ChannelError::Malformed)?
            .try_into()
            .map_err(|_| ChannelError::Malformed)?;
        // The signature must use all remaining bytes.
        r.finish().map_err(|_| ChannelError::Malformed)?;

        crypto::verify_bytes(
            &self.network_public,
            &public,
            &quill_model::Signature(sig_bytes),
        )
        .map_err(|_| {
            warn!(peer, "peer channel public failed network signature check");
            ChannelError::BadHandshake
        })?;

        let channel = self.get(peer)?;
        channel.establish(&public)?;
        info!(peer, "channel established");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Framed send/receive
    // ------------------------------------------------------------------

    /// Authenticated frame: `header || msg`, tag computed over `msg`.
    pub fn send_authenticated(
        &self,
        peer: NodeId,
        lane: u8,
        msg: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        let channel = self.get(peer)?;
        let header = channel.tag(lane, msg)?;
        let mut frame = Vec::with_capacity(MSG_HEADER_LEN + msg.len());
        frame.extend_from_slice(&header.serialise());
        frame.extend_from_slice(msg);
        Ok(frame)
    }

    /// Verify an authenticated frame, returning the message bytes.
    pub fn recv_authenticated<'a>(
        &self,
        peer: NodeId,
        frame: &'a [u8],
    ) -> Result<&'a [u8], ChannelError> {
        let channel = self.get(peer)?;
        let header = MsgHeader::deserialise(frame)?;
        let msg = &frame[MSG_HEADER_LEN..];
        channel.verify(&header, msg)?;
        Ok(msg)
    }

    /// Encrypted frame: `header || aad || cipher`, with the AAD length
    /// prefixed so the receiver can split it off.
    pub fn send_encrypted(
        &self,
        peer: NodeId,
        lane: u8,
        aad: &[u8],
        plain: &[u8],
    ) -> Result<Vec<u8>, ChannelError> {
        let channel = self.get(peer)?;
        let (header, cipher) = channel.encrypt(lane, aad, plain)?;
        let mut w = RawWriter::with_capacity(MSG_HEADER_LEN + aad.len() + cipher.len() + 16);
        w.write_array(&header.serialise());
        w.write_bytes(aad);
        w.write_array(&cipher);
        Ok(w.into_vec())
    }

    /// Decrypt an encrypted frame, returning `(aad, plaintext)`.
    pub fn recv_encrypted(
        &self,
        peer: NodeId,
        frame: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), ChannelError> {
        let channel = self.get(peer)?;
        let header = MsgHeader::deserialise(frame)?;
        let mut r = RawReader::new(&frame[MSG_HEADER_LEN..]);
        let aad = r.read_bytes().map_err(|_| ChannelError::Malformed)?.to_vec();
        let cipher = &frame[frame.len() - r.remaining()..];
        let plain = channel.decrypt(&header, &aad, cipher)?;
        Ok((aad, plain))
    }
}
