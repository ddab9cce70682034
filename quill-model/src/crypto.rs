//! Centralized cryptographic operations for Quill.
//!
//! **All** Ed25519 signing, verification, BLAKE3 hashing, X25519 key
//! agreement, and AES-256-GCM sealing should go through this module. This
//! provides a single audit surface for cryptographic correctness.
//!
//! # Primitives
//!
//! | Primitive   | Algorithm        | Purpose                                   |
//! |-------------|------------------|-------------------------------------------|
//! | Hash        | BLAKE3 (32 B)    | Entry digests, Merkle leaves, key derive  |
//! | Signature   | Ed25519 (64 B)   | Merkle-root signing, channel handshake    |
//! | Agreement   | X25519           | Node-to-node channel key exchange         |
//! | AEAD        | AES-256-GCM      | Channel framing, private-domain sealing   |

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce as GcmNonce};

use crate::types::{Hash, PubKey, Signature};

/// AES-GCM IV length in bytes.
pub const GCM_IV_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const GCM_TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Content hashing (BLAKE3)
// ---------------------------------------------------------------------------

/// Compute the BLAKE3 content hash of arbitrary bytes.
///
/// Used for: serialised-entry digests (Merkle leaves), nonce hashing,
/// snapshot evidence, and any other content-addressed lookups.
#[inline]
pub fn content_hash(data: &[u8]) -> Hash {
    Hash(*blake3::hash(data).as_bytes())
}

/// Derive a 32-byte key for `context` from input key material.
///
/// The channel layer derives its AES-GCM key from the X25519 shared
/// secret this way; the context string separates uses of the same IKM.
#[inline]
pub fn derive_key(context: &str, ikm: &[u8]) -> [u8; 32] {
    blake3::derive_key(context, ikm)
}

// ---------------------------------------------------------------------------
// Ed25519 signing
// ---------------------------------------------------------------------------

/// Sign a BLAKE3 content hash with an Ed25519 signing key.
///
/// This is the canonical signing pattern in Quill: compute
/// `blake3(content)`, then sign the 32-byte digest. Merkle-root
/// signatures and channel handshakes both use this.
pub fn sign_hash(signing_key: &ed25519_dalek::SigningKey, hash: &Hash) -> Signature {
    use ed25519_dalek::Signer;
    let sig = signing_key.sign(hash.as_bytes());
    Signature(sig.to_bytes())
}

/// Sign raw bytes (hashed internally) with an Ed25519 signing key.
pub fn sign_bytes(signing_key: &ed25519_dalek::SigningKey, data: &[u8]) -> Signature {
    sign_hash(signing_key, &content_hash(data))
}

// ---------------------------------------------------------------------------
// Ed25519 verification
// ---------------------------------------------------------------------------

/// Verify an Ed25519 signature over a BLAKE3 content hash.
///
/// Uses `verify_strict()` (rejects small-order keys, checks canonical S).
pub fn verify_hash(pubkey: &PubKey, hash: &Hash, signature: &Signature) -> Result<(), CryptoError> {
    let vk = verifying_key(pubkey)?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    vk.verify_strict(hash.as_bytes(), &sig)
        .map_err(|_| CryptoError::InvalidSignature)
}

/// Verify an Ed25519 signature over raw bytes (hashed internally).
pub fn verify_bytes(
    pubkey: &PubKey,
    data: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    verify_hash(pubkey, &content_hash(data), signature)
}

/// Deserialize a `PubKey` into an Ed25519 `VerifyingKey`.
///
/// Fails if the 32 bytes are not a valid curve point.
pub fn verifying_key(pubkey: &PubKey) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
    ed25519_dalek::VerifyingKey::from_bytes(&pubkey.0).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Construct a signing key from a 32-byte seed and return it with its
/// public half.
pub fn signing_key_from_seed(seed: &[u8; 32]) -> (ed25519_dalek::SigningKey, PubKey) {
    let sk = ed25519_dalek::SigningKey::from_bytes(seed);
    let pk = PubKey(sk.verifying_key().to_bytes());
    (sk, pk)
}

// ---------------------------------------------------------------------------
// X25519 key agreement
// ---------------------------------------------------------------------------

/// An X25519 key-exchange context. Created per peer channel, consumed on
/// establishment.
pub struct KeyExchange {
    secret: x25519_dalek::StaticSecret,
    public: [u8; 32],
}

impl KeyExchange {
    /// Generate a fresh exchange keypair from the OS RNG.
    pub fn new() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = x25519_dalek::PublicKey::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Our public half, to be signed and sent to the peer.
    pub fn own_public(&self) -> [u8; 32] {
        self.public
    }

    /// Compute the shared secret against the peer's public half.
    ///
    /// Rejects the all-zero (low-order) result.
    pub fn shared_secret(&self, peer_public: &[u8; 32]) -> Result<[u8; 32], CryptoError> {
        let peer = x25519_dalek::PublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(*shared.as_bytes())
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// AES-256-GCM AEAD
// ---------------------------------------------------------------------------

/// An AES-256-GCM key. Wraps the cipher so call sites never touch raw key
/// bytes after construction.
pub struct AeadKey {
    cipher: Aes256Gcm,
}

impl AeadKey {
    pub fn new(key: &[u8; 32]) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { cipher }
    }

    /// Encrypt `plain` under `iv`, authenticating `aad`. Returns
    /// ciphertext and the 16-byte tag separately so framing layers can
    /// place the tag in their header.
    pub fn seal(
        &self,
        iv: &[u8; GCM_IV_LEN],
        aad: &[u8],
        plain: &[u8],
    ) -> Result<(Vec<u8>, [u8; GCM_TAG_LEN]), CryptoError> {
        let mut out = self
            .cipher
            .encrypt(GcmNonce::from_slice(iv), Payload { msg: plain, aad })
            .map_err(|_| CryptoError::AeadFailure)?;
        // aes-gcm appends the tag to the ciphertext
        let split = out.len() - GCM_TAG_LEN;
        let mut tag = [0u8; GCM_TAG_LEN];
        tag.copy_from_slice(&out[split..]);
        out.truncate(split);
        Ok((out, tag))
    }

    /// Decrypt `cipher` under `iv`, verifying `tag` over `aad` and the
    /// ciphertext. Any failure yields [`CryptoError::AeadFailure`] and no
    /// plaintext.
    pub fn open(
        &self,
        iv: &[u8; GCM_IV_LEN],
        aad: &[u8],
        cipher: &[u8],
        tag: &[u8; GCM_TAG_LEN],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut joined = Vec::with_capacity(cipher.len() + GCM_TAG_LEN);
        joined.extend_from_slice(cipher);
        joined.extend_from_slice(tag);
        self.cipher
            .decrypt(
                GcmNonce::from_slice(iv),
                Payload {
                    msg: &joined,
                    aad,
                },
            )
            .map_err(|_| CryptoError::AeadFailure)
    }
}

// ---------------------------------------------------------------------------
// Secret generation (CSPRNG)
// ---------------------------------------------------------------------------

/// Generate 32 bytes of cryptographically secure randomness.
///
/// Used for: commit-evidence nonces, ledger encryption keys, test key
/// material.
pub fn generate_secret() -> [u8; 32] {
    use rand::RngCore;
    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    secret
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Cryptographic operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid Ed25519 signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("AEAD encryption or verification failure")]
    AeadFailure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let (sk, pk) = signing_key_from_seed(&[7u8; 32]);
        let h = content_hash(b"payload");
        let sig = sign_hash(&sk, &h);
        verify_hash(&pk, &h, &sig).unwrap();

        let other = content_hash(b"other payload");
        assert_eq!(
            verify_hash(&pk, &other, &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn key_exchange_agrees() {
        let a = KeyExchange::new();
        let b = KeyExchange::new();
        let sa = a.shared_secret(&b.own_public()).unwrap();
        let sb = b.shared_secret(&a.own_public()).unwrap();
        assert_eq!(sa, sb);

        let ka = derive_key("quill test channel", &sa);
        let kb = derive_key("quill test channel", &sb);
        assert_eq!(ka, kb);
    }

    #[test]
    fn aead_roundtrip_and_tamper() {
        let key = AeadKey::new(&[3u8; 32]);
        let iv = [9u8; GCM_IV_LEN];
        let (cipher, tag) = key.seal(&iv, b"aad", b"secret payload").unwrap();
        assert_eq!(cipher.len(), b"secret payload".len());

        let plain = key.open(&iv, b"aad", &cipher, &tag).unwrap();
        assert_eq!(plain, b"secret payload");

        // Wrong AAD fails
        assert!(key.open(&iv, b"bad", &cipher, &tag).is_err());

        // Tampered cipher fails
        let mut bad = cipher.clone();
        bad[0] ^= 1;
        assert!(key.open(&iv, b"aad", &bad, &tag).is_err());
    }

    #[test]
    fn tag_only_aead() {
        // Empty plaintext: tag authenticates AAD alone.
        let key = AeadKey::new(&[5u8; 32]);
        let iv = [1u8; GCM_IV_LEN];
        let (cipher, tag) = key.seal(&iv, b"header bytes", b"").unwrap();
        assert!(cipher.is_empty());
        key.open(&iv, b"header bytes", &[], &tag).unwrap();
        assert!(key.open(&iv, b"forged", &[], &tag).is_err());
    }
}
