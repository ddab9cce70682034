//! Store snapshots
//!
//! A snapshot captures every map's committed state at one version, the
//! Merkle leaf of the transaction at that version, and the view history
//! up to it. Applying a snapshot to an empty store with equal schema
//! reproduces the state at that version exactly.
//!
//! Layout mirrors the entry format: a public block in the clear and a
//! private block sealed by the encryptor (with the snapshot IV bit set),
//! public block as additional data.

use quill_model::codec::{CodecError, RawReader, RawWriter};
use quill_model::{Hash, Version};

use crate::encryptor::Encryptor;
use crate::map::Write;
use crate::types::{parse_security_domain, KvError, SecurityDomain};

pub const SNAPSHOT_FORMAT: u8 = 1;

#[derive(Debug, Clone)]
pub struct MapSnapshot {
    pub name: String,
    pub replicated: bool,
    pub state: Vec<(Vec<u8>, Write)>,
}

#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    version: Version,
    maps: Vec<MapSnapshot>,
    hash_at_snapshot: Option<Hash>,
    view_history: Vec<Version>,
}

impl StoreSnapshot {
    pub fn new(version: Version) -> Self {
        Self {
            version,
            maps: Vec::new(),
            hash_at_snapshot: None,
            view_history: Vec::new(),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn maps(&self) -> &[MapSnapshot] {
        &self.maps
    }

    pub fn hash_at_snapshot(&self) -> Option<Hash> {
        self.hash_at_snapshot
    }

    pub fn view_history(&self) -> &[Version] {
        &self.view_history
    }

    pub fn add_map(&mut self, name: String, replicated: bool, state: Vec<(Vec<u8>, Write)>) {
        self.maps.push(MapSnapshot {
            name,
            replicated,
            state,
        });
    }

    pub fn set_hash_at_snapshot(&mut self, hash: Hash) {
        self.hash_at_snapshot = Some(hash);
    }

    pub fn set_view_history(&mut self, history: Vec<Version>) {
        self.view_history = history;
    }

    fn write_maps_block(maps: &[&MapSnapshot]) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u32(maps.len() as u32);
        for m in maps {
            w.write_bytes(m.name.as_bytes());
            w.write_bool(m.replicated);
            w.write_u64(m.state.len() as u64);
            for (key, write) in &m.state {
                w.write_bytes(key);
                w.write_u64(write.version);
                w.write_bytes(write.value.as_deref().unwrap_or(&[]));
            }
        }
        w.into_vec()
    }

    fn read_maps_block(data: &[u8], out: &mut Vec<MapSnapshot>) -> Result<(), CodecError> {
        let mut r = RawReader::new(data);
        let count = r.read_u32()?;
        for _ in 0..count {
            let name = String::from_utf8_lossy(r.read_bytes()?).into_owned();
            let replicated = r.read_bool()?;
            let n = r.read_u64()?;
            let mut state = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let key = r.read_bytes()?.to_vec();
                let version = r.read_u64()?;
                let value = r.read_bytes()?.to_vec();
                state.push((
                    key,
                    Write {
                        version,
                        value: Some(value),
                    },
                ));
            }
            out.push(MapSnapshot {
                name,
                replicated,
                state,
            });
        }
        r.finish()
    }

    pub fn serialise(&self, encryptor: Option<&dyn Encryptor>) -> Result<Vec<u8>, KvError> {
        let public: Vec<&MapSnapshot> = self
            .maps
            .iter()
            .filter(|m| parse_security_domain(&m.name) == SecurityDomain::Public)
            .collect();
        let private: Vec<&MapSnapshot> = self
            .maps
            .iter()
            .filter(|m| parse_security_domain(&m.name) == SecurityDomain::Private)
            .collect();

        let public_block = Self::write_maps_block(&public);
        let private_block = if private.is_empty() {
            Vec::new()
        } else {
            let plain = Self::write_maps_block(&private);
            match encryptor {
                Some(e) => e.encrypt(&plain, &public_block, self.version, true)?,
                None => plain,
            }
        };

        let mut w = RawWriter::new();
        w.write_u8(SNAPSHOT_FORMAT);
        w.write_u64(self.version);
        match self.hash_at_snapshot {
            Some(h) => {
                w.write_bool(true);
                w.write_array(h.as_bytes());
            }
            None => w.write_bool(false),
        }
        w.write_u64(self.view_history.len() as u64);
        for v in &self.view_history {
            w.write_u64(*v);
        }
        w.write_bytes(&public_block);
        w.write_bytes(&private_block);
        Ok(w.into_vec())
    }

    pub fn deserialise(
        data: &[u8],
        encryptor: Option<&dyn Encryptor>,
        public_only: bool,
    ) -> Result<Self, KvError> {
        let mut r = RawReader::new(data);
        let _format = r.read_u8()?;
        let version = r.read_u64()?;
        let hash_at_snapshot = if r.read_bool()? {
            Some(Hash::from(r.read_array::<32>()?))
        } else {
            None
        };
        let n = r.read_u64()?;
        let mut view_history = Vec::with_capacity(n as usize);
        for _ in 0..n {
            view_history.push(r.read_u64()?);
        }
        let public_block = r.read_bytes()?;
        let private_block = r.read_bytes()?;
        r.finish()?;

        let mut maps = Vec::new();
        Self::read_maps_block(public_block, &mut maps)?;
        if !public_only && !private_block.is_empty() {
            match encryptor {
                Some(e) => {
                    let plain = e.decrypt(private_block, public_block, version)?;
                    Self::read_maps_block(&plain, &mut maps)?;
                }
                None => Self::read_maps_block(private_block, &mut maps)?,
            }
        }

        Ok(Self {
            version,
            maps,
            hash_at_snapshot,
            view_history,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryptor::TxEncryptor;

    fn snapshot() -> StoreSnapshot {
        let mut s = StoreSnapshot::new(9);
        s.add_map(
            "public:a".into(),
            true,
            vec![(
                b"k".to_vec(),
                Write {
                    version: 4,
                    value: Some(b"v".to_vec()),
                },
            )],
        );
        s.add_map(
            "secret".into(),
            true,
            vec![(
                b"p".to_vec(),
                Write {
                    version: 7,
                    value: Some(b"q".to_vec()),
                },
            )],
        );
        s.set_hash_at_snapshot(Hash::from([3u8; 32]));
        s.set_view_history(vec![1, 5]);
        s
    }

    #[test]
    fn roundtrip() {
        let snap = snapshot();
        let enc = TxEncryptor::new(2, [1u8; 32]);
        let data = snap.serialise(Some(&enc)).unwrap();
        let out = StoreSnapshot::deserialise(&data, Some(&enc), false).unwrap();

        assert_eq!(out.version(), 9);
        assert_eq!(out.maps().len(), 2);
        assert_eq!(out.hash_at_snapshot(), Some(Hash::from([3u8; 32])));
        assert_eq!(out.view_history(), &[1, 5]);
        assert_eq!(out.maps()[1].state[0].1.version, 7);
    }

    #[test]
    fn public_only_drops_private_maps() {
        let snap = snapshot();
        let enc = TxEncryptor::new(2, [1u8; 32]);
        let data = snap.serialise(Some(&enc)).unwrap();
        let out = StoreSnapshot::deserialise(&data, Some(&enc), true).unwrap();
        assert_eq!(out.maps().len(), 1);
        assert_eq!(out.maps()[0].name, "public:a");
    }
}
