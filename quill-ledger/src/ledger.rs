//! The ledger: an ordered set of chunk files in one directory
//!
//! The active chunk is always the last file in the write set. Committed
//! chunks leave the write set; reads on them go through a bounded cache
//! of reopened files.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::chunk::{last_idx_from_file_name, start_idx_from_file_name, LedgerFile};
use crate::LedgerError;

pub const DEFAULT_READ_CACHE_FILES: usize = 5;
const MAX_CHUNK_THRESHOLD: usize = u32::MAX as usize;

pub struct Ledger {
    dir: PathBuf,
    /// Open chunks, oldest first; the active chunk is last.
    files: Vec<LedgerFile>,
    /// Reopened committed chunks for reads, oldest first.
    read_cache: VecDeque<LedgerFile>,
    max_read_cache_files: usize,

    chunk_threshold: usize,
    last_idx: u64,
    committed_idx: u64,

    /// The next appended entry opens a new chunk.
    require_new_file: bool,
}

impl Ledger {
    pub fn open(dir: impl AsRef<Path>, chunk_threshold: usize) -> Result<Self, LedgerError> {
        Self::open_with_cache(dir, chunk_threshold, DEFAULT_READ_CACHE_FILES)
    }

    pub fn open_with_cache(
        dir: impl AsRef<Path>,
        chunk_threshold: usize,
        max_read_cache_files: usize,
    ) -> Result<Self, LedgerError> {
        if chunk_threshold == 0 || chunk_threshold > MAX_CHUNK_THRESHOLD {
            return Err(LedgerError::BadThreshold {
                got: chunk_threshold,
                max: MAX_CHUNK_THRESHOLD,
            });
        }

        let dir = dir.as_ref().to_path_buf();
        let mut ledger = Self {
            dir: dir.clone(),
            files: Vec::new(),
            read_cache: VecDeque::new(),
            max_read_cache_files,
            chunk_threshold,
            last_idx: 0,
            committed_idx: 0,
            require_new_file: true,
        };

        if dir.is_dir() {
            for dirent in fs::read_dir(&dir)? {
                let name = dirent?.file_name().to_string_lossy().into_owned();
                ledger.files.push(LedgerFile::open(&dir, &name)?);
            }
            ledger.files.sort_by_key(|f| f.last_idx());

            if let Some(latest) = ledger.files.last() {
                ledger.last_idx = latest.last_idx();
            }

            // Committed chunks leave the write set; the newest committed
            // chunk fixes the commit boundary.
            ledger.files.retain(|f| {
                if f.is_committed() {
                    ledger.committed_idx = ledger.committed_idx.max(f.last_idx());
                    false
                } else {
                    true
                }
            });

            // Keep appending to the last chunk only if it is still open.
            ledger.require_new_file = match ledger.files.last() {
                Some(f) => f.is_complete(),
                None => true,
            };

            debug!(
                last_idx = ledger.last_idx,
                committed_idx = ledger.committed_idx,
                files = ledger.files.len(),
                "recovered ledger directory"
            );
        } else {
            fs::create_dir_all(&dir)?;
        }

        Ok(ledger)
    }

    pub fn last_idx(&self) -> u64 {
        self.last_idx
    }

    pub fn committed_idx(&self) -> u64 {
        self.committed_idx
    }

    /// Restart appending from a known last index, used when resuming
    /// from a snapshot. Does not create any file.
    pub fn init(&mut self, idx: u64) {
        self.last_idx = idx;
    }

    /// Append a length-prefixed frame. The active chunk is sealed when
    /// this entry is committable and either a new chunk was forced or
    /// the chunk has reached the threshold.
    pub fn put_entry(
        &mut self,
        data: &[u8],
        committable: bool,
        force_chunk: bool,
    ) -> Result<u64, LedgerError> {
        if self.require_new_file {
            self.files.push(LedgerFile::create(&self.dir, self.last_idx + 1)?);
            self.require_new_file = false;
        }

        let file = self.files.last_mut().expect("active chunk exists");
        self.last_idx = file.write_entry(data, committable)?;

        trace!(
            idx = self.last_idx,
            committable,
            force_chunk,
            "ledger entry written"
        );

        if committable && (force_chunk || file.current_size() >= self.chunk_threshold as u64) {
            file.complete()?;
            self.require_new_file = true;
            trace!(next = self.last_idx + 1, "new ledger chunk will start");
        }

        Ok(self.last_idx)
    }

    /// Remove all entries above `idx`. May reopen the boundary chunk for
    /// writing.
    pub fn truncate(&mut self, idx: u64) -> Result<(), LedgerError> {
        debug!(idx, last_idx = self.last_idx, "ledger truncate");

        if idx >= self.last_idx || idx < self.committed_idx {
            return Ok(());
        }

        self.require_new_file = true;

        let mut kept = Vec::with_capacity(self.files.len());
        for mut file in self.files.drain(..) {
            if file.last_idx() <= idx {
                kept.push(file);
                continue;
            }
            // The boundary chunk truncates in place; later chunks are
            // deleted entirely.
            let truncate_to = if file.start_idx() <= idx {
                idx
            } else {
                file.start_idx() - 1
            };
            if !file.truncate(truncate_to)? {
                // Chunk survives: keep appending to it.
                self.require_new_file = false;
                kept.push(file);
            }
        }
        self.files = kept;
        self.last_idx = idx;
        Ok(())
    }

    /// Advance the durable commit boundary to `idx`: seal and rename
    /// every chunk wholly below it.
    pub fn commit(&mut self, idx: u64) -> Result<(), LedgerError> {
        debug!(idx, last_idx = self.last_idx, "ledger commit");

        if idx <= self.committed_idx {
            return Ok(());
        }

        let mut kept = Vec::with_capacity(self.files.len());
        for mut file in self.files.drain(..) {
            let commit_idx = file.last_idx().min(idx);
            if file.commit(commit_idx)? {
                // Committed chunks leave the write set.
                continue;
            }
            kept.push(file);
        }
        self.files = kept;
        self.committed_idx = idx;
        Ok(())
    }

    /// Read the entry appended at `idx`.
    pub fn get_entry(&mut self, idx: u64) -> Result<Option<Vec<u8>>, LedgerError> {
        if idx == 0 || idx > self.last_idx {
            return Ok(None);
        }
        for file in self.files.iter_mut().rev() {
            if file.contains(idx) {
                return file.read_entry(idx);
            }
        }
        match self.cached_file_for(idx)? {
            Some(file) => file.read_entry(idx),
            None => Ok(None),
        }
    }

    /// Read the framed entries covering `from..=to`, concatenated across
    /// chunk boundaries. Used by consensus catch-up.
    pub fn read_framed_entries(&mut self, from: u64, to: u64) -> Result<Option<Vec<u8>>, LedgerError> {
        if from == 0 || to > self.last_idx || to < from {
            return Ok(None);
        }

        let mut out = Vec::new();
        let mut idx = from;
        while idx <= to {
            let framed = {
                let mut in_write_set = false;
                let mut res = None;
                for file in self.files.iter_mut().rev() {
                    if file.contains(idx) {
                        let chunk_to = file.last_idx().min(to);
                        res = file.read_framed_entries(idx, chunk_to)?.map(|v| (v, chunk_to));
                        in_write_set = true;
                        break;
                    }
                }
                if !in_write_set {
                    match self.cached_file_for(idx)? {
                        Some(file) => {
                            let chunk_to = file.last_idx().min(to);
                            file.read_framed_entries(idx, chunk_to)?.map(|v| (v, chunk_to))
                        }
                        None => None,
                    }
                } else {
                    res
                }
            };

            match framed {
                Some((bytes, chunk_to)) => {
                    out.extend_from_slice(&bytes);
                    idx = chunk_to + 1;
                }
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    }

    /// Find (or reopen into the cache) the committed chunk holding `idx`.
    fn cached_file_for(&mut self, idx: u64) -> Result<Option<&mut LedgerFile>, LedgerError> {
        if idx == 0 {
            return Ok(None);
        }

        if let Some(pos) = self.read_cache.iter().position(|f| f.contains(idx)) {
            return Ok(self.read_cache.get_mut(pos));
        }

        // Reopen the chunk with the greatest start index at or below idx.
        let mut best: Option<(u64, String)> = None;
        for dirent in fs::read_dir(&self.dir)? {
            let name = dirent?.file_name().to_string_lossy().into_owned();
            let Ok(start) = start_idx_from_file_name(&name) else {
                continue;
            };
            if start > idx {
                continue;
            }
            if let Some(last) = last_idx_from_file_name(&name) {
                if last < idx {
                    continue;
                }
            }
            if best.as_ref().map(|(s, _)| start > *s).unwrap_or(true) {
                best = Some((start, name));
            }
        }

        let Some((_, name)) = best else {
            return Ok(None);
        };
        let file = LedgerFile::open(&self.dir, &name)?;
        if !file.contains(idx) {
            return Ok(None);
        }
        if self.read_cache.len() >= self.max_read_cache_files {
            self.read_cache.pop_front();
        }
        self.read_cache.push_back(file);
        Ok(self.read_cache.back_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(n: usize) -> Vec<u8> {
        vec![b'x'; n]
    }

    #[test]
    fn contiguous_indices_from_one() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 1000).unwrap();
        assert_eq!(ledger.put_entry(b"a", false, false).unwrap(), 1);
        assert_eq!(ledger.put_entry(b"b", false, false).unwrap(), 2);
        assert_eq!(ledger.last_idx(), 2);
        assert_eq!(ledger.get_entry(1).unwrap().unwrap(), b"a");
        assert!(ledger.get_entry(0).unwrap().is_none());
        assert!(ledger.get_entry(3).unwrap().is_none());
    }

    #[test]
    fn chunk_boundary_on_committable_over_threshold() {
        // Threshold 100, entries 20 bytes (24 framed). Entries 1..=4
        // non-committable, entry 5 committable: still chunk 1 (sealed
        // at 5). Entry 6 opens chunk 2.
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 100).unwrap();
        for _ in 0..4 {
            ledger.put_entry(&entry(20), false, false).unwrap();
        }
        ledger.put_entry(&entry(20), true, false).unwrap();
        assert_eq!(ledger.put_entry(&entry(20), true, false).unwrap(), 6);

        ledger.commit(6).unwrap();
        assert!(dir.path().join("ledger_1-5.committed").exists());
        // Chunk 2 opened at entry 6 and is still active.
        assert!(dir.path().join("ledger_6").exists());
        assert_eq!(ledger.committed_idx(), 6);
    }

    #[test]
    fn non_committable_entries_never_seal() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 50).unwrap();
        for _ in 0..10 {
            ledger.put_entry(&entry(20), false, false).unwrap();
        }
        // Well past the threshold, still one chunk.
        assert!(dir.path().join("ledger_1").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn forced_chunk_seals_at_committable() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 1_000_000).unwrap();
        ledger.put_entry(b"a", true, false).unwrap();
        ledger.put_entry(b"b", true, true).unwrap();
        ledger.put_entry(b"c", true, false).unwrap();

        ledger.commit(3).unwrap();
        assert!(dir.path().join("ledger_1-2.committed").exists());
        // Entry 3 sits in the still-active chunk opened by the force.
        assert!(dir.path().join("ledger_3").exists());
    }

    #[test]
    fn truncate_and_rewrite() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 1000).unwrap();
        for i in 1..=5u8 {
            ledger.put_entry(&[i], false, false).unwrap();
        }
        ledger.truncate(3).unwrap();
        assert_eq!(ledger.last_idx(), 3);
        assert!(ledger.get_entry(4).unwrap().is_none());

        assert_eq!(ledger.put_entry(&[42], false, false).unwrap(), 4);
        assert_eq!(ledger.get_entry(4).unwrap().unwrap(), vec![42]);
    }

    #[test]
    fn truncate_to_zero_empties_ledger() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 1000).unwrap();
        ledger.put_entry(b"a", false, false).unwrap();
        ledger.put_entry(b"b", false, false).unwrap();
        ledger.truncate(0).unwrap();
        assert_eq!(ledger.last_idx(), 0);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        assert_eq!(ledger.put_entry(b"fresh", false, false).unwrap(), 1);
    }

    #[test]
    fn committed_chunks_are_readable() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open_with_cache(dir.path(), 10, 2).unwrap();
        for i in 0..6u8 {
            ledger.put_entry(&[i; 20], true, false).unwrap();
        }
        ledger.commit(6).unwrap();

        // All chunks are committed and gone from the write set; reads
        // come back through the cache.
        for i in 1..=6u64 {
            assert_eq!(
                ledger.get_entry(i).unwrap().unwrap(),
                vec![(i - 1) as u8; 20]
            );
        }
    }

    #[test]
    fn framed_range_spans_chunks() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), 10).unwrap();
        for i in 0..4u8 {
            ledger.put_entry(&[i; 8], true, false).unwrap();
        }

        let framed = ledger.read_framed_entries(1, 4).unwrap().unwrap();
        let mut cursor = crate::frame::FrameCursor::new(&framed);
        for i in 0..4u8 {
            assert_eq!(cursor.next_entry().unwrap(), &[i; 8]);
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn recovery_resumes_writing() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), 1000).unwrap();
            for i in 1..=3u8 {
                ledger.put_entry(&[i], false, false).unwrap();
            }
        }
        let mut ledger = Ledger::open(dir.path(), 1000).unwrap();
        assert_eq!(ledger.last_idx(), 3);
        assert_eq!(ledger.put_entry(&[4], false, false).unwrap(), 4);
        assert_eq!(ledger.get_entry(2).unwrap().unwrap(), vec![2]);
    }

    #[test]
    fn recovery_after_commit() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), 10).unwrap();
            for i in 0..4u8 {
                ledger.put_entry(&[i; 8], true, false).unwrap();
            }
            ledger.commit(2).unwrap();
        }
        let mut ledger = Ledger::open(dir.path(), 10).unwrap();
        assert_eq!(ledger.last_idx(), 4);
        assert_eq!(ledger.committed_idx(), 2);
        // Truncation below the commit boundary is refused.
        ledger.truncate(1).unwrap();
        assert_eq!(ledger.last_idx(), 4);
    }
}
