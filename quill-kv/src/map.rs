//! Versioned map
//!
//! Each map owns, per key, a chain of versioned writes above the
//! compaction point and at most one committed value at it. Reads are
//! answered from the newest write at or below the requested version, so
//! snapshot isolation needs no locking once a read version is fixed.
//!
//! The map expects to be locked by the store during commit, compaction,
//! rollback, and snapshotting.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use quill_model::{Version, NO_VERSION};

use crate::types::SecurityDomain;

/// A single versioned write. `value == None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Write {
    pub version: Version,
    pub value: Option<Vec<u8>>,
}

/// The ordered write set of one transaction against one map.
pub type WriteSet = Vec<(Vec<u8>, Option<Vec<u8>>)>;

/// Hook invoked with `(version, writes)`; local hooks fire in commit
/// order, global hooks in compaction order.
pub type CommitHook = Arc<dyn Fn(Version, &WriteSet) + Send + Sync>;

pub struct Map {
    name: String,
    security_domain: SecurityDomain,
    replicated: bool,

    /// Committed value per key at the compaction point. Tombstoned keys
    /// are absent.
    committed: BTreeMap<Vec<u8>, Write>,
    compacted: Version,

    /// Versioned writes above the compaction point, oldest first.
    chains: BTreeMap<Vec<u8>, Vec<Write>>,

    /// Per-commit write sets above the compaction point, version order.
    roll: VecDeque<(Version, WriteSet)>,

    /// Deltas awaiting the global hook, drained by [`Map::post_compact`].
    commit_deltas: Vec<(Version, WriteSet)>,

    /// Incremented on every rollback that discards state; transactions
    /// that began before the rollback must fail their commit.
    rollback_counter: u64,

    local_hook: Option<CommitHook>,
    global_hook: Option<CommitHook>,
}

impl Map {
    pub fn new(name: String, security_domain: SecurityDomain, replicated: bool) -> Self {
        Self {
            name,
            security_domain,
            replicated,
            committed: BTreeMap::new(),
            compacted: NO_VERSION,
            chains: BTreeMap::new(),
            roll: VecDeque::new(),
            commit_deltas: Vec::new(),
            rollback_counter: 0,
            local_hook: None,
            global_hook: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn security_domain(&self) -> SecurityDomain {
        self.security_domain
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn rollback_counter(&self) -> u64 {
        self.rollback_counter
    }

    /// Version of the newest commit that touched this map.
    pub fn tail_version(&self) -> Version {
        self.roll.back().map(|(v, _)| *v).unwrap_or(self.compacted)
    }

    /// Version of the newest commit at or below `at`. Records the state
    /// a whole-map iteration observed; commit fails if the map has moved
    /// past it.
    pub fn tail_version_at(&self, at: Version) -> Version {
        self.roll
            .iter()
            .rev()
            .find(|(v, _)| *v <= at)
            .map(|(v, _)| *v)
            .unwrap_or(self.compacted)
    }

    pub fn set_local_hook(&mut self, hook: CommitHook) {
        self.local_hook = Some(hook);
    }

    pub fn unset_local_hook(&mut self) {
        self.local_hook = None;
    }

    pub fn set_global_hook(&mut self, hook: CommitHook) {
        self.global_hook = Some(hook);
    }

    pub fn unset_global_hook(&mut self) {
        self.global_hook = None;
    }

    /// The newest write at or below `at` for `key`, with the version it
    /// was written at. Returns `None` if the key has never been written
    /// at or below `at`; a tombstone is `Some(Write { value: None, .. })`.
    pub fn read_at(&self, key: &[u8], at: Version) -> Option<Write> {
        if let Some(chain) = self.chains.get(key) {
            if let Some(w) = chain.iter().rev().find(|w| w.version <= at) {
                return Some(w.clone());
            }
        }
        self.committed
            .get(key)
            .filter(|w| w.version <= at)
            .cloned()
    }

    /// The version of the newest write for `key`, at any version.
    /// [`NO_VERSION`] if the key has never been written (or its only
    /// trace was compacted away as a tombstone).
    pub fn current_version_of(&self, key: &[u8]) -> Version {
        if let Some(chain) = self.chains.get(key) {
            if let Some(w) = chain.last() {
                return w.version;
            }
        }
        self.committed.get(key).map(|w| w.version).unwrap_or(NO_VERSION)
    }

    /// Visit every live `(key, value)` at version `at`, in key order.
    /// The visitor returns false to stop early.
    pub fn foreach_at(&self, at: Version, mut visitor: impl FnMut(&[u8], &[u8]) -> bool) {
        // Merge committed base and chains; both are key-ordered.
        let mut chain_iter = self.chains.iter().peekable();
        for (key, base) in &self.committed {
            // Flush chain keys sorting before this committed key.
            while let Some((ck, _)) = chain_iter.peek() {
                if ck.as_slice() < key.as_slice() {
                    let (ck, chain) = chain_iter.next().unwrap();
                    if let Some(w) = chain.iter().rev().find(|w| w.version <= at) {
                        if let Some(v) = &w.value {
                            if !visitor(ck, v) {
                                return;
                            }
                        }
                    }
                } else {
                    break;
                }
            }

            // The chain shadows the committed base when it has an entry
            // at or below `at`.
            let shadowed = chain_iter
                .peek()
                .filter(|(ck, _)| ck.as_slice() == key.as_slice())
                .map(|(_, chain)| chain.iter().rev().find(|w| w.version <= at));
            match shadowed {
                Some(Some(w)) => {
                    chain_iter.next();
                    if let Some(v) = &w.value {
                        if !visitor(key, v) {
                            return;
                        }
                    }
                }
                Some(None) => {
                    chain_iter.next();
                    if base.version <= at {
                        if let Some(v) = &base.value {
                            if !visitor(key, v) {
                                return;
                            }
                        }
                    }
                }
                None => {
                    if base.version <= at {
                        if let Some(v) = &base.value {
                            if !visitor(key, v) {
                                return;
                            }
                        }
                    }
                }
            }
        }
        for (ck, chain) in chain_iter {
            if let Some(w) = chain.iter().rev().find(|w| w.version <= at) {
                if let Some(v) = &w.value {
                    if !visitor(ck, v) {
                        return;
                    }
                }
            }
        }
    }

    /// Append a committed write set at version `v`. The caller has
    /// already validated the read set and assigned the version.
    pub fn apply_commit(&mut self, v: Version, writes: WriteSet) {
        debug_assert!(v > self.tail_version(), "commit versions are monotonic");
        for (key, value) in &writes {
            self.chains.entry(key.clone()).or_default().push(Write {
                version: v,
                value: value.clone(),
            });
        }
        self.roll.push_back((v, writes));
    }

    /// Fire the local hook for the newest commit. Run after every map in
    /// the transaction has applied, while the maps are still locked.
    pub fn trigger_local_hook(&self) {
        if let Some(hook) = &self.local_hook {
            if let Some((v, writes)) = self.roll.back() {
                hook(*v, writes);
            }
        }
    }

    /// Coalesce versioned writes at or below `v` into the committed
    /// state and queue global-hook deltas. Tombstones at the compaction
    /// point drop out of the committed state entirely.
    pub fn compact(&mut self, v: Version) {
        if v <= self.compacted {
            return;
        }

        while let Some((rv, _)) = self.roll.front() {
            if *rv > v {
                break;
            }
            let (rv, writes) = self.roll.pop_front().unwrap();
            if self.global_hook.is_some() {
                self.commit_deltas.push((rv, writes));
            }
        }

        let mut emptied = Vec::new();
        for (key, chain) in self.chains.iter_mut() {
            let split = chain.partition_point(|w| w.version <= v);
            if split == 0 {
                continue;
            }
            let newest = chain[split - 1].clone();
            chain.drain(..split);
            match newest.value {
                Some(_) => {
                    self.committed.insert(key.clone(), newest);
                }
                None => {
                    self.committed.remove(key);
                }
            }
            if chain.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.chains.remove(&key);
        }

        self.compacted = v;
    }

    /// Fire the global hook for every compacted delta, in version order.
    /// Run after compaction with the map unlocked.
    pub fn post_compact(&mut self) {
        if let Some(hook) = &self.global_hook {
            for (v, writes) in &self.commit_deltas {
                hook(*v, writes);
            }
        }
        self.commit_deltas.clear();
    }

    /// Truncate every versioned write above `v`.
    pub fn rollback(&mut self, v: Version) {
        let mut advanced = false;

        while let Some((rv, _)) = self.roll.back() {
            if *rv <= v {
                break;
            }
            self.roll.pop_back();
            advanced = true;
        }

        let mut emptied = Vec::new();
        for (key, chain) in self.chains.iter_mut() {
            let keep = chain.partition_point(|w| w.version <= v);
            if keep < chain.len() {
                chain.truncate(keep);
                advanced = true;
            }
            if chain.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.chains.remove(&key);
        }

        if advanced {
            self.rollback_counter += 1;
        }
    }

    /// The live `(key, write)` state at version `v`, for snapshots.
    pub fn snapshot_state(&self, v: Version) -> Vec<(Vec<u8>, Write)> {
        let mut out = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for (key, chain) in &self.chains {
            if let Some(w) = chain.iter().rev().find(|w| w.version <= v) {
                seen.insert(key.clone());
                if w.value.is_some() {
                    out.push((key.clone(), w.clone()));
                }
            }
        }
        for (key, base) in &self.committed {
            if base.version <= v && !seen.contains(key) {
                out.push((key.clone(), base.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Install a snapshot state. Only valid on an empty map.
    pub fn apply_snapshot(&mut self, version: Version, state: Vec<(Vec<u8>, Write)>) {
        debug_assert!(self.roll.is_empty() && self.chains.is_empty());
        self.committed = state.into_iter().collect();
        self.compacted = version;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> Map {
        Map::new("public:test".into(), SecurityDomain::Public, true)
    }

    fn put(m: &mut Map, v: Version, key: &[u8], value: &[u8]) {
        m.apply_commit(v, vec![(key.to_vec(), Some(value.to_vec()))]);
    }

    #[test]
    fn versioned_reads() {
        let mut m = map();
        put(&mut m, 1, b"k", b"one");
        put(&mut m, 3, b"k", b"three");

        assert_eq!(m.read_at(b"k", 1).unwrap().value.unwrap(), b"one");
        assert_eq!(m.read_at(b"k", 2).unwrap().value.unwrap(), b"one");
        assert_eq!(m.read_at(b"k", 3).unwrap().value.unwrap(), b"three");
        assert!(m.read_at(b"k", 0).is_none());
        assert_eq!(m.current_version_of(b"k"), 3);
        assert_eq!(m.current_version_of(b"absent"), NO_VERSION);
    }

    #[test]
    fn tombstone_reads() {
        let mut m = map();
        put(&mut m, 1, b"k", b"v");
        m.apply_commit(2, vec![(b"k".to_vec(), None)]);

        let w = m.read_at(b"k", 2).unwrap();
        assert!(w.value.is_none(), "tombstone is observed, not absent");
        assert_eq!(w.version, 2);
        assert_eq!(m.read_at(b"k", 1).unwrap().value.unwrap(), b"v");
    }

    #[test]
    fn compact_coalesces_and_drops_tombstones() {
        let mut m = map();
        put(&mut m, 1, b"a", b"a1");
        put(&mut m, 2, b"a", b"a2");
        m.apply_commit(3, vec![(b"b".to_vec(), Some(b"b3".to_vec()))]);
        m.apply_commit(4, vec![(b"a".to_vec(), None)]);

        m.compact(4);

        // "a" was tombstoned at the compaction point: gone entirely.
        assert!(m.read_at(b"a", 4).is_none());
        assert_eq!(m.current_version_of(b"a"), NO_VERSION);
        // "b" survives as a single committed value.
        assert_eq!(m.read_at(b"b", 4).unwrap().value.unwrap(), b"b3");
        assert_eq!(m.tail_version(), 4);
    }

    #[test]
    fn global_hook_fires_in_version_order() {
        let mut m = map();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        m.set_global_hook(Arc::new(move |v, _| seen2.lock().push(v)));

        put(&mut m, 1, b"a", b"1");
        put(&mut m, 2, b"a", b"2");
        put(&mut m, 3, b"a", b"3");

        m.compact(2);
        m.post_compact();
        assert_eq!(*seen.lock(), vec![1, 2]);

        m.compact(3);
        m.post_compact();
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn rollback_truncates_above() {
        let mut m = map();
        put(&mut m, 1, b"a", b"1");
        put(&mut m, 2, b"a", b"2");
        put(&mut m, 3, b"b", b"3");

        let before = m.rollback_counter();
        m.rollback(1);
        assert_eq!(m.rollback_counter(), before + 1);

        assert_eq!(m.read_at(b"a", 10).unwrap().value.unwrap(), b"1");
        assert!(m.read_at(b"b", 10).is_none());
        assert_eq!(m.tail_version(), 1);

        // Rolling back to the same point again discards nothing.
        m.rollback(1);
        assert_eq!(m.rollback_counter(), before + 1);
    }

    #[test]
    fn rollback_never_crosses_compact() {
        let mut m = map();
        put(&mut m, 1, b"a", b"1");
        put(&mut m, 2, b"a", b"2");
        m.compact(2);
        // Committed state is untouched by a rollback above it.
        m.rollback(2);
        assert_eq!(m.read_at(b"a", 2).unwrap().value.unwrap(), b"2");
    }

    #[test]
    fn snapshot_state_reflects_version() {
        let mut m = map();
        put(&mut m, 1, b"a", b"1");
        put(&mut m, 2, b"b", b"2");
        m.apply_commit(3, vec![(b"a".to_vec(), None)]);

        let at2 = m.snapshot_state(2);
        assert_eq!(at2.len(), 2);

        let at3 = m.snapshot_state(3);
        assert_eq!(at3.len(), 1);
        assert_eq!(at3[0].0, b"b");

        let mut fresh = map();
        fresh.apply_snapshot(3, at3);
        assert_eq!(fresh.read_at(b"b", 3).unwrap().value.unwrap(), b"2");
        assert!(fresh.read_at(b"a", 3).is_none());
    }

    #[test]
    fn foreach_merges_base_and_chains() {
        let mut m = map();
        put(&mut m, 1, b"a", b"base-a");
        put(&mut m, 1, b"c", b"base-c");
        m.compact(1);
        put(&mut m, 2, b"b", b"chain-b");
        m.apply_commit(3, vec![(b"c".to_vec(), None)]);

        let mut keys = Vec::new();
        m.foreach_at(3, |k, _| {
            keys.push(k.to_vec());
            true
        });
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);

        let mut keys = Vec::new();
        m.foreach_at(2, |k, _| {
            keys.push(k.to_vec());
            true
        });
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }
}
