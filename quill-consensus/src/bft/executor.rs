//! Request execution
//!
//! The ordering engine is agnostic about what a request does; it only
//! needs execution to be deterministic so every replica computes the
//! same replicated-state root for the same batch. The frontend
//! registers an executor; [`KvExecutor`] is the standard one, applying
//! `(map, key, value)` writes through a store transaction.

use std::sync::Arc;

use tracing::warn;

use quill_kv::Store;
use quill_model::codec::{RawReader, RawWriter};

/// Applies one client request against the store and produces the reply
/// payload. Must be deterministic: no clocks, no randomness.
pub trait RequestExecutor: Send + Sync {
    fn execute(&self, request_id: u64, payload: &[u8], store: &Arc<Store>) -> Vec<u8>;
}

/// A request payload for [`KvExecutor`]: one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvRequest {
    pub map: String,
    pub key: Vec<u8>,
    /// `None` removes the key.
    pub value: Option<Vec<u8>>,
}

impl KvRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_bytes(self.map.as_bytes());
        w.write_bytes(&self.key);
        match &self.value {
            Some(v) => {
                w.write_bool(true);
                w.write_bytes(v);
            }
            None => w.write_bool(false),
        }
        w.into_vec()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        let mut r = RawReader::new(data);
        let map = String::from_utf8_lossy(r.read_bytes().ok()?).into_owned();
        let key = r.read_bytes().ok()?.to_vec();
        let value = if r.read_bool().ok()? {
            Some(r.read_bytes().ok()?.to_vec())
        } else {
            None
        };
        r.finish().ok()?;
        Some(Self { map, key, value })
    }
}

/// The standard executor: the payload is a [`KvRequest`], applied in
/// its own transaction. The reply is the committed version, or empty on
/// failure.
pub struct KvExecutor;

impl RequestExecutor for KvExecutor {
    fn execute(&self, request_id: u64, payload: &[u8], store: &Arc<Store>) -> Vec<u8> {
        let Some(request) = KvRequest::decode(payload) else {
            warn!(request_id, "undecodable request payload");
            return Vec::new();
        };

        let mut tx = store.create_tx();
        match &request.value {
            Some(v) => tx.put(&request.map, &request.key, v),
            None => tx.remove(&request.map, &request.key),
        }

        match tx.commit() {
            Ok(outcome) if outcome.is_ok() => {
                let mut w = RawWriter::new();
                w.write_u64(store.current_version());
                w.into_vec()
            }
            other => {
                warn!(request_id, ?other, "request execution did not commit");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_kv::StoreConfig;

    #[test]
    fn request_roundtrip() {
        let r = KvRequest {
            map: "public:app".into(),
            key: b"k".to_vec(),
            value: Some(b"v".to_vec()),
        };
        assert_eq!(KvRequest::decode(&r.encode()).unwrap(), r);

        let del = KvRequest {
            map: "public:app".into(),
            key: b"k".to_vec(),
            value: None,
        };
        assert_eq!(KvRequest::decode(&del.encode()).unwrap(), del);
    }

    #[test]
    fn executor_applies_writes() {
        let store = Store::new(StoreConfig::replicated());
        store.create_map("public:app").unwrap();

        let put = KvRequest {
            map: "public:app".into(),
            key: b"k".to_vec(),
            value: Some(b"v".to_vec()),
        };
        let reply = KvExecutor.execute(1, &put.encode(), &store);
        assert!(!reply.is_empty());
        assert_eq!(store.current_version(), 1);

        let map = store.get_map_now("public:app").unwrap();
        assert_eq!(map.read().read_at(b"k", 1).unwrap().value.unwrap(), b"v");
    }
}
