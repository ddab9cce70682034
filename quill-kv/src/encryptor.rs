//! Transaction encryptor
//!
//! Seals the private-domain half of serialised entries under a
//! version-ordered schedule of ledger keys. The key for version `v` is
//! the newest key whose introduction version is `<= v`, so rekeying
//! takes effect exactly at the version it commits at.

use parking_lot::Mutex;

use quill_model::crypto::{AeadKey, GCM_IV_LEN, GCM_TAG_LEN};
use quill_model::Version;

use crate::types::KvError;

/// Serialised GCM header length: IV then tag.
pub const HEADER_LEN: usize = GCM_IV_LEN + GCM_TAG_LEN;

/// Encryption surface the store and snapshotter call through. A store
/// without an encryptor writes private domains in the clear (test
/// stores, public-only recovery stores).
pub trait Encryptor: Send + Sync {
    /// Seal `plain`, authenticating `aad`. Output is `header || cipher`.
    fn encrypt(
        &self,
        plain: &[u8],
        aad: &[u8],
        version: Version,
        is_snapshot: bool,
    ) -> Result<Vec<u8>, KvError>;

    /// Open `header || cipher` produced by [`Encryptor::encrypt`].
    fn decrypt(&self, sealed: &[u8], aad: &[u8], version: Version) -> Result<Vec<u8>, KvError>;

    /// Register a new ledger key effective from `version`.
    fn update_encryption_key(&self, version: Version, raw_key: [u8; 32]);

    /// Drop keys introduced above `version`.
    fn rollback(&self, version: Version);

    /// Drop keys wholly superseded at or below `version`.
    fn compact(&self, version: Version);
}

struct KeyEntry {
    version: Version,
    key: AeadKey,
}

/// Production encryptor: AES-256-GCM with an IV that packs the node's
/// IV id and the entry version, so two nodes sealing distinct content at
/// the same version cannot reuse an IV.
pub struct TxEncryptor {
    keys: Mutex<Vec<KeyEntry>>,
    iv_id: u32,
}

impl TxEncryptor {
    /// `iv_id` must be unique per writer (the node id is used).
    pub fn new(iv_id: u32, initial_key: [u8; 32]) -> Self {
        Self {
            keys: Mutex::new(vec![KeyEntry {
                version: 0,
                key: AeadKey::new(&initial_key),
            }]),
            iv_id,
        }
    }

    fn make_iv(&self, version: Version, is_snapshot: bool) -> [u8; GCM_IV_LEN] {
        let mut iv = [0u8; GCM_IV_LEN];
        let mut id = self.iv_id;
        if is_snapshot {
            id |= 1 << 31;
        }
        iv[..4].copy_from_slice(&id.to_le_bytes());
        iv[4..].copy_from_slice(&version.to_le_bytes());
        iv
    }

    fn with_key<T>(
        &self,
        version: Version,
        f: impl FnOnce(&AeadKey) -> Result<T, KvError>,
    ) -> Result<T, KvError> {
        let keys = self.keys.lock();
        let entry = keys
            .iter()
            .rev()
            .find(|k| k.version <= version)
            .ok_or(KvError::NoEncryptionKey(version))?;
        f(&entry.key)
    }
}

impl Encryptor for TxEncryptor {
    fn encrypt(
        &self,
        plain: &[u8],
        aad: &[u8],
        version: Version,
        is_snapshot: bool,
    ) -> Result<Vec<u8>, KvError> {
        let iv = self.make_iv(version, is_snapshot);
        self.with_key(version, |key| {
            let (cipher, tag) = key
                .seal(&iv, aad, plain)
                .map_err(|_| KvError::NoEncryptionKey(version))?;
            let mut out = Vec::with_capacity(HEADER_LEN + cipher.len());
            out.extend_from_slice(&iv);
            out.extend_from_slice(&tag);
            out.extend_from_slice(&cipher);
            Ok(out)
        })
    }

    fn decrypt(&self, sealed: &[u8], aad: &[u8], version: Version) -> Result<Vec<u8>, KvError> {
        if sealed.len() < HEADER_LEN {
            return Err(KvError::DecryptFailed(version));
        }
        let iv: [u8; GCM_IV_LEN] = sealed[..GCM_IV_LEN].try_into().unwrap();
        let tag: [u8; GCM_TAG_LEN] = sealed[GCM_IV_LEN..HEADER_LEN].try_into().unwrap();
        let cipher = &sealed[HEADER_LEN..];
        self.with_key(version, |key| {
            key.open(&iv, aad, cipher, &tag)
                .map_err(|_| KvError::DecryptFailed(version))
        })
    }

    fn update_encryption_key(&self, version: Version, raw_key: [u8; 32]) {
        let mut keys = self.keys.lock();
        keys.push(KeyEntry {
            version,
            key: AeadKey::new(&raw_key),
        });
        keys.sort_by_key(|k| k.version);
    }

    fn rollback(&self, version: Version) {
        let mut keys = self.keys.lock();
        while keys.len() > 1 {
            if keys.last().unwrap().version <= version {
                break;
            }
            keys.pop();
        }
    }

    fn compact(&self, version: Version) {
        let mut keys = self.keys.lock();
        // A key is dead once its successor is already effective at the
        // compaction point.
        while keys.len() > 1 {
            if keys[1].version > version {
                break;
            }
            keys.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let enc = TxEncryptor::new(1, [7u8; 32]);
        let sealed = enc.encrypt(b"private bytes", b"public aad", 5, false).unwrap();
        let plain = enc.decrypt(&sealed, b"public aad", 5).unwrap();
        assert_eq!(plain, b"private bytes");

        assert!(enc.decrypt(&sealed, b"wrong aad", 5).is_err());
    }

    #[test]
    fn rekey_selects_by_version() {
        let enc = TxEncryptor::new(1, [1u8; 32]);
        enc.update_encryption_key(10, [2u8; 32]);

        let sealed_old = enc.encrypt(b"old", b"", 9, false).unwrap();
        let sealed_new = enc.encrypt(b"new", b"", 10, false).unwrap();
        assert_eq!(enc.decrypt(&sealed_old, b"", 9).unwrap(), b"old");
        assert_eq!(enc.decrypt(&sealed_new, b"", 10).unwrap(), b"new");

        // After rollback below the rekey, version 10 seals under the old key.
        enc.rollback(9);
        assert!(enc.decrypt(&sealed_new, b"", 10).is_err());
    }

    #[test]
    fn compact_drops_superseded_keys() {
        let enc = TxEncryptor::new(1, [1u8; 32]);
        enc.update_encryption_key(10, [2u8; 32]);
        enc.update_encryption_key(20, [3u8; 32]);

        let sealed = enc.encrypt(b"x", b"", 5, false).unwrap();
        enc.compact(25);
        // The version-0 and version-10 keys are gone.
        assert!(enc.decrypt(&sealed, b"", 5).is_err());
        assert!(enc.encrypt(b"y", b"", 25, false).is_ok());
    }

    #[test]
    fn snapshot_iv_is_distinct() {
        let enc = TxEncryptor::new(1, [1u8; 32]);
        let a = enc.encrypt(b"same", b"", 5, false).unwrap();
        let b = enc.encrypt(b"same", b"", 5, true).unwrap();
        assert_ne!(a[..GCM_IV_LEN], b[..GCM_IV_LEN]);
    }
}
