//! Transactions
//!
//! A transaction reads every map at one snapshot version and records a
//! per-map read set and write set. Commit validates the read set against
//! current versions, assigns the next global version to the writes, and
//! hands the serialised entry to the store's replication pipeline.
//!
//! Conflict is a normal outcome: the caller retries with a fresh
//! transaction. Serialisation failure is fatal for the transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use quill_model::{TxId, Version, NO_VERSION};

use crate::map::WriteSet;
use crate::serialise::{serialise_entry, Segment};
use crate::store::Store;
use crate::types::{is_reserved_map_name, CommitOutcome, KvError, SecurityDomain};

#[derive(Default)]
struct TxMap {
    /// Rollback counter of the map at first touch; a rollback in between
    /// fails the commit.
    rollback_counter: Option<u64>,
    /// Whole-map read marker recorded by iteration.
    map_marker: Option<Version>,
    reads: BTreeMap<Vec<u8>, Version>,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

pub struct Transaction {
    store: Arc<Store>,
    /// `(term, read version)`, fixed on first access.
    read: Option<TxId>,
    /// Pre-allocated commit version for reserved transactions.
    reserved: Option<Version>,
    tx_maps: BTreeMap<String, TxMap>,
    committed: bool,
}

impl Transaction {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            read: None,
            reserved: None,
            tx_maps: BTreeMap::new(),
            committed: false,
        }
    }

    pub(crate) fn new_reserved(store: Arc<Store>, version: Version, term: u64) -> Self {
        Self {
            store,
            read: Some(TxId::new(term, version - 1)),
            reserved: Some(version),
            tx_maps: BTreeMap::new(),
            committed: false,
        }
    }

    fn ensure_read(&mut self) -> TxId {
        if let Some(r) = self.read {
            return r;
        }
        let txid = self.store.current_txid();
        self.read = Some(txid);
        txid
    }

    /// The snapshot version this transaction reads at.
    pub fn read_version(&mut self) -> Version {
        self.ensure_read().version
    }

    fn touch_map(&mut self, name: &str) {
        if self.tx_maps.contains_key(name) {
            return;
        }
        let rollback_counter = self
            .store
            .get_map_now(name)
            .map(|m| m.read().rollback_counter());
        self.tx_maps.insert(
            name.to_string(),
            TxMap {
                rollback_counter,
                ..Default::default()
            },
        );
    }

    /// The most recent value at or below the read version, own writes
    /// included. Records the observed version in the read set.
    pub fn get(&mut self, map: &str, key: &[u8]) -> Option<Vec<u8>> {
        let read = self.ensure_read();
        self.touch_map(map);

        if let Some(w) = self.tx_maps.get(map).and_then(|m| m.writes.get(key)) {
            return w.clone();
        }

        let observed = self
            .store
            .get_map_now(map)
            .and_then(|m| m.read().read_at(key, read.version));

        let tx_map = self.tx_maps.get_mut(map).unwrap();
        match observed {
            Some(w) => {
                tx_map.reads.insert(key.to_vec(), w.version);
                w.value
            }
            None => {
                tx_map.reads.insert(key.to_vec(), NO_VERSION);
                None
            }
        }
    }

    pub fn put(&mut self, map: &str, key: &[u8], value: &[u8]) {
        self.ensure_read();
        self.touch_map(map);
        self.tx_maps
            .get_mut(map)
            .unwrap()
            .writes
            .insert(key.to_vec(), Some(value.to_vec()));
    }

    pub fn remove(&mut self, map: &str, key: &[u8]) {
        self.ensure_read();
        self.touch_map(map);
        self.tx_maps
            .get_mut(map)
            .unwrap()
            .writes
            .insert(key.to_vec(), None);
    }

    /// Visit every live `(key, value)` at the read version, own writes
    /// included, in key order. Records a whole-map read marker: the
    /// commit fails if the map moves past it.
    pub fn foreach(&mut self, map: &str, mut f: impl FnMut(&[u8], &[u8]) -> bool) {
        let read = self.ensure_read();
        self.touch_map(map);

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        if let Some(m) = self.store.get_map_now(map) {
            let m = m.read();
            let tx_map = self.tx_maps.get_mut(map).unwrap();
            if tx_map.map_marker.is_none() {
                tx_map.map_marker = Some(m.tail_version_at(read.version));
            }
            m.foreach_at(read.version, |k, v| {
                merged.insert(k.to_vec(), v.to_vec());
                true
            });
        } else {
            let tx_map = self.tx_maps.get_mut(map).unwrap();
            if tx_map.map_marker.is_none() {
                tx_map.map_marker = Some(NO_VERSION);
            }
        }

        for (key, value) in &self.tx_maps.get(map).unwrap().writes {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        for (k, v) in &merged {
            if !f(k, v) {
                break;
            }
        }
    }

    fn has_writes(&self) -> bool {
        self.tx_maps.values().any(|m| !m.writes.is_empty())
    }

    /// Commit the transaction. See the module docs for the outcome
    /// taxonomy.
    pub fn commit(&mut self) -> Result<CommitOutcome, KvError> {
        if self.committed {
            return Err(KvError::AlreadyCommitted);
        }

        let read = self.ensure_read();
        if !self.has_writes() {
            // A read-only transaction commits without consuming a version.
            self.committed = true;
            return Ok(CommitOutcome::Ok(read));
        }

        // Resolve maps up front, creating the ones this transaction
        // introduces. Application transactions may not introduce
        // reserved names.
        let mut resolved = Vec::with_capacity(self.tx_maps.len());
        for name in self.tx_maps.keys() {
            let map = match self.store.get_map_now(name) {
                Some(m) => m,
                None => {
                    if self.reserved.is_none() && is_reserved_map_name(name) {
                        return Err(KvError::ReservedMapName(name.clone()));
                    }
                    self.store.create_map_unchecked(name, read.version + 1)
                }
            };
            resolved.push((name.clone(), map));
        }

        // Lock in name order (resolved follows tx_maps key order).
        let mut guards: Vec<_> = resolved.iter().map(|(_, m)| m.write()).collect();

        // Validate the read set against current versions.
        for ((name, _), guard) in resolved.iter().zip(guards.iter()) {
            let tx_map = &self.tx_maps[name];
            if let Some(rc) = tx_map.rollback_counter {
                if guard.rollback_counter() != rc {
                    return Ok(CommitOutcome::Conflict);
                }
            }
            if let Some(marker) = tx_map.map_marker {
                if guard.tail_version() != marker {
                    return Ok(CommitOutcome::Conflict);
                }
            }
            for (key, recorded) in &tx_map.reads {
                if guard.current_version_of(key) != *recorded {
                    return Ok(CommitOutcome::Conflict);
                }
            }
        }

        let version = match self.reserved {
            Some(v) => v,
            None => self.store.next_version(),
        };
        let txid = TxId::new(read.term, version);

        // Serialise replicated segments before touching map state, so a
        // serialisation failure leaves the store untouched.
        let mut segments = Vec::new();
        for ((name, _), guard) in resolved.iter().zip(guards.iter()) {
            let tx_map = &self.tx_maps[name];
            if tx_map.writes.is_empty() || !guard.is_replicated() {
                continue;
            }
            segments.push((
                guard.security_domain(),
                Segment {
                    name: name.clone(),
                    read_version: NO_VERSION,
                    reads: Vec::new(),
                    writes: tx_map
                        .writes
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                },
            ));
        }
        let replicates = !segments.is_empty();
        let seg_refs: Vec<(SecurityDomain, &Segment)> =
            segments.iter().map(|(d, s)| (*d, s)).collect();
        let encryptor = self.store.encryptor();
        let data = serialise_entry(version, &seg_refs, encryptor.as_deref(), false)?;

        // Apply writes, then fire local hooks once every map has
        // applied, maps still locked.
        for ((name, _), guard) in resolved.iter().zip(guards.iter_mut()) {
            let tx_map = &self.tx_maps[name];
            if tx_map.writes.is_empty() {
                continue;
            }
            let writes: WriteSet = tx_map
                .writes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            guard.apply_commit(version, writes);
        }
        for ((name, _), guard) in resolved.iter().zip(guards.iter()) {
            if !self.tx_maps[name].writes.is_empty() {
                guard.trigger_local_hook();
            }
        }
        drop(guards);

        self.committed = true;

        if !replicates {
            return Ok(CommitOutcome::Ok(txid));
        }

        Ok(self
            .store
            .commit(txid, Box::new(move || Ok(data)), false))
    }

    /// Commit a reserved transaction, returning the serialised entry.
    /// Reserved versions execute in order at `read = version - 1`, so
    /// they cannot conflict.
    pub fn commit_reserved(&mut self) -> Result<Vec<u8>, KvError> {
        if self.committed {
            return Err(KvError::AlreadyCommitted);
        }
        let version = match self.reserved {
            Some(v) => v,
            None => return Err(KvError::AlreadyCommitted),
        };

        let mut resolved = Vec::with_capacity(self.tx_maps.len());
        for name in self.tx_maps.keys() {
            let map = match self.store.get_map_now(name) {
                Some(m) => m,
                None => self.store.create_map_unchecked(name, version),
            };
            resolved.push((name.clone(), map));
        }

        let mut guards: Vec<_> = resolved.iter().map(|(_, m)| m.write()).collect();

        let mut segments = Vec::new();
        for ((name, _), guard) in resolved.iter().zip(guards.iter()) {
            let tx_map = &self.tx_maps[name];
            if tx_map.writes.is_empty() || !guard.is_replicated() {
                continue;
            }
            segments.push((
                guard.security_domain(),
                Segment {
                    name: name.clone(),
                    read_version: NO_VERSION,
                    reads: Vec::new(),
                    writes: tx_map
                        .writes
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                },
            ));
        }
        let seg_refs: Vec<(SecurityDomain, &Segment)> =
            segments.iter().map(|(d, s)| (*d, s)).collect();
        let encryptor = self.store.encryptor();
        let data = serialise_entry(version, &seg_refs, encryptor.as_deref(), false)?;

        for ((name, _), guard) in resolved.iter().zip(guards.iter_mut()) {
            let tx_map = &self.tx_maps[name];
            if tx_map.writes.is_empty() {
                continue;
            }
            let writes: WriteSet = tx_map
                .writes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            guard.apply_commit(version, writes);
        }
        for ((name, _), guard) in resolved.iter().zip(guards.iter()) {
            if !self.tx_maps[name].writes.is_empty() {
                guard.trigger_local_hook();
            }
        }
        drop(guards);

        self.committed = true;
        Ok(data)
    }
}
