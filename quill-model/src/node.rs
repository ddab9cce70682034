//! Node identity records
//!
//! The record stored in the nodes map for every replica: its signing
//! key and the address peers dial it on. Written by governance when a
//! node joins; read by the history to verify signatures and by the
//! consensus layer to build configurations.

use crate::codec::{CodecError, RawReader, RawWriter};
use crate::types::{NodeId, PubKey};

/// Lifecycle of a node in the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Trusted,
    Retired,
}

impl NodeStatus {
    fn to_u8(self) -> u8 {
        match self {
            NodeStatus::Pending => 0,
            NodeStatus::Trusted => 1,
            NodeStatus::Retired => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeStatus::Trusted,
            2 => NodeStatus::Retired,
            _ => NodeStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub public_key: PubKey,
    pub hostname: String,
    pub port: String,
    pub status: NodeStatus,
}

impl NodeRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u64(self.node_id);
        w.write_array(self.public_key.as_bytes());
        w.write_bytes(self.hostname.as_bytes());
        w.write_bytes(self.port.as_bytes());
        w.write_u8(self.status.to_u8());
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut r = RawReader::new(data);
        let node_id = r.read_u64()?;
        let public_key = PubKey::from(r.read_array::<32>()?);
        let hostname = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        let port = String::from_utf8_lossy(r.read_bytes()?).into_owned();
        let status = NodeStatus::from_u8(r.read_u8()?);
        r.finish()?;
        Ok(Self {
            node_id,
            public_key,
            hostname,
            port,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let record = NodeRecord {
            node_id: 3,
            public_key: PubKey::from([5u8; 32]),
            hostname: "node-3.internal".into(),
            port: "4640".into(),
            status: NodeStatus::Trusted,
        };
        let back = NodeRecord::decode(&record.encode()).unwrap();
        assert_eq!(record, back);
    }
}
