//! Append-only Merkle tree with flush and retract
//!
//! Leaves are 32-byte digests at consecutive indices. Internal nodes
//! hash their children's concatenation; a node with no right child is
//! promoted unchanged. The root therefore covers every leaf ever
//! appended and is identical on any replica holding the same leaf
//! sequence.
//!
//! `flush(idx)` freezes leaves below `idx` into their complete aligned
//! subtree roots, bounding memory while keeping the root computable.
//! `retract(idx)` discards leaves above `idx`; it never crosses the
//! flush point (rollback never crosses global commit).

use std::collections::VecDeque;

use quill_model::codec::{RawReader, RawWriter};
use quill_model::Hash;

use crate::HistoryError;

fn hash_node(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash(*hasher.finalize().as_bytes())
}

/// A frozen complete subtree: `size` leaves starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Peak {
    offset: u64,
    size: u64,
    hash: Hash,
}

pub struct MerkleTree {
    /// Frozen aligned subtrees covering `[0, begin)`, left to right.
    peaks: Vec<Peak>,
    /// Retained leaves for `[begin, end)`.
    leaves: VecDeque<Hash>,
    begin: u64,
    end: u64,
}

impl MerkleTree {
    /// A new tree seeded with a single leaf at index 0, so version `v`
    /// maps to leaf index `v`.
    pub fn new(first: Hash) -> Self {
        Self {
            peaks: Vec::new(),
            leaves: VecDeque::from([first]),
            begin: 0,
            end: 1,
        }
    }

    /// First retained leaf index.
    pub fn begin_index(&self) -> u64 {
        self.begin
    }

    /// Last appended leaf index.
    pub fn end_index(&self) -> u64 {
        self.end - 1
    }

    pub fn in_range(&self, index: u64) -> bool {
        index >= self.begin && index < self.end
    }

    pub fn append(&mut self, leaf: Hash) {
        self.leaves.push_back(leaf);
        self.end += 1;
    }

    pub fn leaf(&self, index: u64) -> Option<Hash> {
        if !self.in_range(index) {
            return None;
        }
        Some(self.leaves[(index - self.begin) as usize])
    }

    /// The hash of the aligned block `[offset, offset + size)`, clipped
    /// at the ragged right edge. `None` for an empty block.
    fn block_hash(&self, offset: u64, size: u64) -> Result<Option<Hash>, HistoryError> {
        if offset >= self.end {
            return Ok(None);
        }
        if size == 1 {
            if offset >= self.begin {
                return Ok(Some(self.leaves[(offset - self.begin) as usize]));
            }
            // A frozen single leaf survives only as a height-0 peak.
            return match self.peaks.iter().find(|p| p.offset == offset && p.size == 1) {
                Some(p) => Ok(Some(p.hash)),
                None => Err(HistoryError::Flushed(offset)),
            };
        }
        if offset + size <= self.begin {
            if let Some(p) = self
                .peaks
                .iter()
                .find(|p| p.offset == offset && p.size == size)
            {
                return Ok(Some(p.hash));
            }
            // Fall through and split; the parts are peaks of the
            // frozen prefix whenever this block was reachable from the
            // root or a receipt above the flush point.
        }
        let half = size / 2;
        let left = self.block_hash(offset, half)?;
        let right = self.block_hash(offset + half, half)?;
        Ok(match (left, right) {
            (Some(l), Some(r)) => Some(hash_node(&l, &r)),
            (Some(l), None) => Some(l),
            (None, _) => None,
        })
    }

    fn span(&self) -> u64 {
        self.end.next_power_of_two()
    }

    /// The root over every appended leaf.
    pub fn root(&self) -> Hash {
        self.block_hash(0, self.span())
            .ok()
            .flatten()
            .unwrap_or(Hash::ZERO)
    }

    /// Freeze leaves below `index` into complete aligned subtrees.
    pub fn flush(&mut self, index: u64) {
        let target = index.min(self.end - 1);
        while self.begin < target {
            let leaf = self.leaves.pop_front().expect("retained leaf below end");
            self.peaks.push(Peak {
                offset: self.begin,
                size: 1,
                hash: leaf,
            });
            self.begin += 1;

            // Merge buddy peaks bottom-up.
            while self.peaks.len() >= 2 {
                let a = &self.peaks[self.peaks.len() - 2];
                let b = &self.peaks[self.peaks.len() - 1];
                if a.size == b.size && a.offset % (2 * a.size) == 0 {
                    let merged = Peak {
                        offset: a.offset,
                        size: a.size * 2,
                        hash: hash_node(&a.hash, &b.hash),
                    };
                    self.peaks.pop();
                    self.peaks.pop();
                    self.peaks.push(merged);
                } else {
                    break;
                }
            }
        }
    }

    /// Discard every leaf above `index`, keeping `index` itself.
    pub fn retract(&mut self, index: u64) {
        let keep = index.max(self.begin.saturating_sub(1)) + 1;
        if keep >= self.end {
            return;
        }
        self.leaves.truncate((keep - self.begin) as usize);
        self.end = keep;
    }

    /// Audit path proving `index` under the current root.
    pub fn receipt(&self, index: u64) -> Result<Receipt, HistoryError> {
        if index < self.begin {
            return Err(HistoryError::Flushed(index));
        }
        if index >= self.end {
            return Err(HistoryError::Unknown(index));
        }

        let mut path = Vec::new();
        let mut size = 1u64;
        while size < self.span() {
            let own_offset = index / (2 * size) * (2 * size);
            let (sib_offset, sib_is_left) = if index % (2 * size) < size {
                (own_offset + size, false)
            } else {
                (own_offset, true)
            };
            if let Some(h) = self.block_hash(sib_offset, size)? {
                path.push((sib_is_left, h));
            }
            size *= 2;
        }

        Ok(Receipt {
            index,
            max_index: self.end_index(),
            root: self.root(),
            path,
        })
    }

    pub fn serialise(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u64(self.begin);
        w.write_u64(self.end);
        w.write_u64(self.peaks.len() as u64);
        for p in &self.peaks {
            w.write_u64(p.offset);
            w.write_u64(p.size);
            w.write_array(p.hash.as_bytes());
        }
        w.write_u64(self.leaves.len() as u64);
        for leaf in &self.leaves {
            w.write_array(leaf.as_bytes());
        }
        w.into_vec()
    }

    pub fn deserialise(data: &[u8]) -> Result<Self, HistoryError> {
        let mut r = RawReader::new(data);
        let begin = r.read_u64()?;
        let end = r.read_u64()?;
        let npeaks = r.read_u64()?;
        let mut peaks = Vec::with_capacity(npeaks as usize);
        for _ in 0..npeaks {
            let offset = r.read_u64()?;
            let size = r.read_u64()?;
            let hash = Hash::from(r.read_array::<32>()?);
            peaks.push(Peak { offset, size, hash });
        }
        let nleaves = r.read_u64()?;
        let mut leaves = VecDeque::with_capacity(nleaves as usize);
        for _ in 0..nleaves {
            leaves.push_back(Hash::from(r.read_array::<32>()?));
        }
        r.finish()?;
        Ok(Self {
            peaks,
            leaves,
            begin,
            end,
        })
    }
}

/// An audit path: sibling hashes from the leaf to the root, each tagged
/// with its side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub index: u64,
    pub max_index: u64,
    pub root: Hash,
    /// `(sibling_is_left, hash)` from bottom to top.
    pub path: Vec<(bool, Hash)>,
}

impl Receipt {
    /// Recompute the root from `leaf` and the path and compare.
    pub fn verify(&self, leaf: &Hash) -> bool {
        let mut cur = *leaf;
        for (is_left, sibling) in &self.path {
            cur = if *is_left {
                hash_node(sibling, &cur)
            } else {
                hash_node(&cur, sibling)
            };
        }
        cur == self.root
    }

    pub fn serialise(&self) -> Vec<u8> {
        let mut w = RawWriter::new();
        w.write_u64(self.index);
        w.write_u64(self.max_index);
        w.write_array(self.root.as_bytes());
        w.write_u64(self.path.len() as u64);
        for (is_left, h) in &self.path {
            w.write_bool(*is_left);
            w.write_array(h.as_bytes());
        }
        w.into_vec()
    }

    pub fn deserialise(data: &[u8]) -> Result<Self, HistoryError> {
        let mut r = RawReader::new(data);
        let index = r.read_u64()?;
        let max_index = r.read_u64()?;
        let root = Hash::from(r.read_array::<32>()?);
        let n = r.read_u64()?;
        let mut path = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let is_left = r.read_bool()?;
            let h = Hash::from(r.read_array::<32>()?);
            path.push((is_left, h));
        }
        r.finish()?;
        Ok(Self {
            index,
            max_index,
            root,
            path,
        })
    }
}
