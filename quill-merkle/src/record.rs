//! Signature records
//!
//! The record written to the signatures map by [`emit_signature`]. It
//! binds the Merkle root to the emitting node, the version/term it was
//! issued at, and the commit point it establishes; the serialised tree
//! lets a joining node rebuild its history from a snapshot.
//!
//! [`emit_signature`]: crate::MerkleHistory::emit_signature

use quill_model::codec::{CodecError, RawReader, RawWriter};
use quill_model::{Hash, Nonce, NodeId, Signature, Term, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRecord {
    pub node: NodeId,
    pub version: Version,
    pub term: Term,
    pub commit_version: Version,
    pub commit_term: Term,
    pub root: Hash,
    pub hashed_nonce: Nonce,
    pub sig: Signature,
    pub tree: Vec<u8>,
}

impl SignatureRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u64(self.node);
        w.write_u64(self.version);
        w.write_u64(self.term);
        w.write_u64(self.commit_version);
        w.write_u64(self.commit_term);
        w.write_array(self.root.as_bytes());
        w.write_array(self.hashed_nonce.as_bytes());
        w.write_array(self.sig.as_bytes());
        w.write_bytes(&self.tree);
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = RawReader::new(data);
        let node = r.read_u64()?;
        let version = r.read_u64()?;
        let term = r.read_u64()?;
        let commit_version = r.read_u64()?;
        let commit_term = r.read_u64()?;
        let root = Hash::from(r.read_array::<32>()?);
        let hashed_nonce = Nonce::from(r.read_array::<32>()?);
        let sig = Signature::from(r.read_array::<64>()?);
        let tree = r.read_bytes()?.to_vec();
        r.finish()?;
        Ok(Self {
            node,
            version,
            term,
            commit_version,
            commit_term,
            root,
            hashed_nonce,
            sig,
            tree,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let record = SignatureRecord {
            node: 2,
            version: 17,
            term: 3,
            commit_version: 12,
            commit_term: 3,
            root: Hash::from([9u8; 32]),
            hashed_nonce: Nonce::from([4u8; 32]),
            sig: Signature::from([7u8; 64]),
            tree: vec![1, 2, 3],
        };
        assert_eq!(SignatureRecord::decode(&record.encode()).unwrap(), record);
    }
}
