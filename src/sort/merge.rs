//! Tournament-Tree Merging
//!
//! [`MergeEngine`] merges N sorted record streams through a winner tree:
//! an integer array of length P (N rounded up to a power of two) where the
//! slots `P/2..P` hold the winners of adjacent reader pairs, each level
//! above aggregates the level below, and slot 1 names the reader holding
//! the global minimum. Advancing costs one reader step plus `log2 P`
//! comparisons along the leaf-to-root path. A reader at end-of-stream
//! loses every comparison; ties go to the lower reader index, which keeps
//! the merge stable over the level-0 spill order.
//!
//! [`IncrMerger`] bounds disk usage for multi-level merges: instead of
//! materialising a child engine's full output it refills a capped region
//! of a temp file on demand. Single-threaded it rewrites one region in
//! place; with workers it alternates two temp files, populating the next
//! while the current is being read, and swaps on exhaustion.

use super::error::{SortError, SortResult};
use super::pma::{varint_len, PageWriter, PmaReader};
use super::record::{KeyComparator, UnpackedRecord};
use super::vfs::TempHandle;
use std::cmp::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace};

/// Maximum readers merged by one engine; deeper inputs get a tree of
/// engines connected by incremental mergers
pub(crate) const MERGE_FANIN: usize = 16;

// ============================================================================
// Tournament tree
// ============================================================================

pub(crate) struct MergeEngine {
    readers: Vec<PmaReader>,
    /// Winner slots; `tree[1]` is the root, `tree[0]` unused
    tree: Vec<usize>,
    cmp: Arc<dyn KeyComparator>,
    scratch: UnpackedRecord,
    /// `(reader, serial)` currently unpacked in the scratch; comparisons
    /// against the same record skip the re-unpack
    scratch_holds: Option<(usize, u64)>,
}

impl MergeEngine {
    pub(crate) fn new(readers: Vec<PmaReader>, cmp: Arc<dyn KeyComparator>) -> Self {
        let p = readers.len().max(2).next_power_of_two();
        let scratch = cmp.new_scratch();
        MergeEngine {
            readers,
            tree: vec![0; p],
            cmp,
            scratch,
            scratch_holds: None,
        }
    }

    /// Prime every reader with its first record and build the tree
    pub(crate) fn init(&mut self) -> SortResult<()> {
        for reader in &mut self.readers {
            reader.next()?;
        }
        let p = self.tree.len();
        for i in (p / 2..p).rev() {
            let a = 2 * i - p;
            self.tree[i] = self.winner(a, a + 1);
        }
        for i in (1..p / 2).rev() {
            self.tree[i] = self.winner(self.tree[2 * i], self.tree[2 * i + 1]);
        }
        self.take_scratch_err()?;
        trace!(readers = self.readers.len(), "merge engine primed");
        Ok(())
    }

    /// Key of the current minimum, if any stream still has records
    pub(crate) fn key(&self) -> Option<&[u8]> {
        self.readers.get(self.tree[1]).and_then(PmaReader::key)
    }

    /// Reader index currently at the root
    pub(crate) fn current_reader(&self) -> usize {
        self.tree[1]
    }

    /// Step past the current minimum. `Ok(false)` once every stream is dry.
    pub(crate) fn advance(&mut self) -> SortResult<bool> {
        let r = self.tree[1];
        if self.readers.get(r).and_then(PmaReader::key).is_none() {
            return Ok(false);
        }
        self.readers[r].next()?;
        if self.scratch_holds.map_or(false, |(idx, _)| idx == r) {
            self.scratch_holds = None;
        }

        // recompute the path from r's leaf up to the root
        let p = self.tree.len();
        let mut i = (p + r) / 2;
        self.tree[i] = self.winner(r, r ^ 1);
        i /= 2;
        while i >= 1 {
            self.tree[i] = self.winner(self.tree[2 * i], self.tree[2 * i + 1]);
            i /= 2;
        }
        self.take_scratch_err()?;
        Ok(self.key().is_some())
    }

    /// Smaller-keyed of two reader indices; EOF loses, ties go low
    fn winner(&mut self, a: usize, b: usize) -> usize {
        let ka = self.readers.get(a).and_then(PmaReader::key).is_some();
        let kb = self.readers.get(b).and_then(PmaReader::key).is_some();
        match (ka, kb) {
            (false, false) => a.min(b),
            (true, false) => a,
            (false, true) => b,
            (true, true) => {
                let serial_b = self.readers[b].serial();
                let (left_first, rhs, rhs_tag) = (a, b, (b, serial_b));
                // split the borrows: keys from readers, mutation on scratch
                let Self {
                    readers,
                    cmp,
                    scratch,
                    scratch_holds,
                    ..
                } = self;
                let left = readers[left_first].key().expect("checked non-EOF");
                let right = readers[rhs].key().expect("checked non-EOF");
                if *scratch_holds != Some(rhs_tag) {
                    cmp.populate(scratch, right);
                    *scratch_holds = Some(rhs_tag);
                }
                match cmp.compare_with(scratch, left) {
                    Ordering::Greater => b,
                    Ordering::Less => a,
                    Ordering::Equal => a.min(b),
                }
            }
        }
    }

    fn take_scratch_err(&mut self) -> SortResult<()> {
        match self.scratch.err.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeEngine")
            .field("readers", &self.readers.len())
            .field("root", &self.tree.get(1))
            .finish()
    }
}

// ============================================================================
// Incremental merger
// ============================================================================

type PopulateResult = SortResult<(MergeEngine, u64, bool)>;

enum IncrMode {
    /// One backing region, rewritten in place between reads
    Single { file: TempHandle },
    /// Two alternating temp files; `next` is filled in the background
    /// while `cur` is read
    Threaded {
        cur: TempHandle,
        next: TempHandle,
        bg: Option<JoinHandle<PopulateResult>>,
    },
}

/// Bounded-region refill adapter between a child [`MergeEngine`] and the
/// [`PmaReader`] that consumes it
pub(crate) struct IncrMerger {
    child: Option<MergeEngine>,
    cap: u64,
    page_size: usize,
    mode: IncrMode,
}

impl IncrMerger {
    pub(crate) fn new_single(
        child: MergeEngine,
        file: TempHandle,
        cap: u64,
        page_size: usize,
    ) -> Self {
        IncrMerger {
            child: Some(child),
            cap,
            page_size,
            mode: IncrMode::Single { file },
        }
    }

    pub(crate) fn new_threaded(
        child: MergeEngine,
        cur: TempHandle,
        next: TempHandle,
        cap: u64,
        page_size: usize,
    ) -> Self {
        IncrMerger {
            child: Some(child),
            cap,
            page_size,
            mode: IncrMode::Threaded {
                cur,
                next,
                bg: None,
            },
        }
    }

    /// Handle the consuming reader should start on
    pub(crate) fn current_handle(&self) -> &TempHandle {
        match &self.mode {
            IncrMode::Single { file } => file,
            IncrMode::Threaded { cur, .. } => cur,
        }
    }

    /// Produce the next readable region, or `None` when the child engine
    /// is exhausted. Joining the populate worker happens here, before the
    /// file swap, so the reader never observes a half-written region.
    pub(crate) fn next_region(&mut self) -> SortResult<Option<(TempHandle, u64, u64)>> {
        let in_flight = match &mut self.mode {
            IncrMode::Threaded { bg, .. } => bg.take(),
            IncrMode::Single { .. } => None,
        };

        if let Some(handle) = in_flight {
            let (child, bytes, child_eof) =
                handle.join().map_err(|_| SortError::WorkerPanic)??;
            if let IncrMode::Threaded { cur, next, .. } = &mut self.mode {
                std::mem::swap(cur, next);
            }
            if bytes == 0 {
                return Ok(None);
            }
            if !child_eof {
                self.child = Some(child);
                self.spawn_populate();
            }
            return Ok(Some((self.current_handle().clone(), 0, bytes)));
        }

        // synchronous fill: single mode always, threaded mode on first use
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        let file = self.current_handle().clone();
        let (bytes, child_eof) = populate_region(&mut child, &file, self.cap, self.page_size)?;
        if bytes == 0 {
            return Ok(None);
        }
        if !child_eof {
            self.child = Some(child);
            self.spawn_populate();
        }
        Ok(Some((file, 0, bytes)))
    }

    /// Move the child into a worker that fills the `next` file
    fn spawn_populate(&mut self) {
        let IncrMode::Threaded { next, bg, .. } = &mut self.mode else {
            return;
        };
        let Some(mut child) = self.child.take() else {
            return;
        };
        let file = next.clone();
        let cap = self.cap;
        let page_size = self.page_size;
        let handle = std::thread::spawn(move || {
            let (bytes, eof) = populate_region(&mut child, &file, cap, page_size)?;
            Ok((child, bytes, eof))
        });
        *bg = Some(handle);
        debug!("spawned populate worker for merge region");
    }
}

impl Drop for IncrMerger {
    fn drop(&mut self) {
        if let IncrMode::Threaded { bg, .. } = &mut self.mode {
            if let Some(handle) = bg.take() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for IncrMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncrMerger")
            .field("cap", &self.cap)
            .field("threaded", &matches!(self.mode, IncrMode::Threaded { .. }))
            .finish()
    }
}

/// Drain records from `child` into the region file until `cap` is reached
/// or the child runs dry. Returns bytes written and the child-EOF flag.
/// The region holds at least one record even if that record alone
/// overshoots the cap.
fn populate_region(
    child: &mut MergeEngine,
    file: &TempHandle,
    cap: u64,
    page_size: usize,
) -> SortResult<(u64, bool)> {
    let mut writer = PageWriter::new(file.clone(), 0, page_size);
    let mut child_eof = false;
    loop {
        let rec_len = match child.key() {
            None => {
                child_eof = true;
                break;
            }
            Some(k) => k.len(),
        };
        let rec_size = (varint_len(rec_len as u64) + rec_len) as u64;
        if writer.bytes_written() > 0 && writer.bytes_written() + rec_size > cap {
            break;
        }
        if let Some(key) = child.key() {
            writer.write_varint(key.len() as u64);
            writer.write(key);
        }
        child.advance()?;
    }
    let end = writer.finish()?;
    Ok((end, child_eof))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::pma::write_pma;
    use crate::sort::record::{encode_key, SortField, TypedKeyComparator};
    use crate::sort::vfs::{StdTempStore, TempStore};

    fn int_key(v: i64) -> Vec<u8> {
        encode_key(&[SortField::Int(v)])
    }

    fn pma_of(values: &[i64]) -> PmaReader {
        let file = StdTempStore.open_temp().unwrap();
        let keys: Vec<Vec<u8>> = values.iter().map(|v| int_key(*v)).collect();
        write_pma(&file, 0, 512, keys.iter().map(Vec::as_slice)).unwrap();
        PmaReader::open_pma(file, 0, 512).unwrap()
    }

    fn drain(engine: &mut MergeEngine) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(key) = engine.key() {
            match crate::sort::record::decode_key(key, 1).unwrap()[0] {
                SortField::Int(v) => out.push(v),
                ref f => panic!("unexpected field {f:?}"),
            }
            if !engine.advance().unwrap() {
                break;
            }
        }
        out
    }

    #[test]
    fn test_two_way_merge() {
        let cmp = Arc::new(TypedKeyComparator::new(1));
        let readers = vec![pma_of(&[1, 4, 7]), pma_of(&[2, 3, 9])];
        let mut engine = MergeEngine::new(readers, cmp);
        engine.init().unwrap();
        assert_eq!(drain(&mut engine), vec![1, 2, 3, 4, 7, 9]);
    }

    #[test]
    fn test_merge_with_empty_and_uneven_streams() {
        let cmp = Arc::new(TypedKeyComparator::new(1));
        let readers = vec![
            pma_of(&[]),
            pma_of(&[5]),
            pma_of(&[1, 2, 3, 4]),
            pma_of(&[6, 8]),
            pma_of(&[]),
        ];
        let mut engine = MergeEngine::new(readers, cmp);
        engine.init().unwrap();
        assert_eq!(drain(&mut engine), vec![1, 2, 3, 4, 5, 6, 8]);
    }

    #[test]
    fn test_root_names_global_minimum_after_each_advance() {
        let cmp = Arc::new(TypedKeyComparator::new(1));
        let readers = vec![pma_of(&[2, 10, 11]), pma_of(&[1, 12]), pma_of(&[3, 4, 5])];
        let mut engine = MergeEngine::new(readers, cmp.clone());
        engine.init().unwrap();

        let mut scratch = cmp.new_scratch();
        loop {
            let Some(root_key) = engine.key().map(<[u8]>::to_vec) else {
                break;
            };
            for r in 0..engine.readers.len() {
                if let Some(other) = engine.readers[r].key() {
                    assert_ne!(
                        cmp.compare(&mut scratch, &root_key, other),
                        Ordering::Greater,
                        "root is not the minimum"
                    );
                }
            }
            if !engine.advance().unwrap() {
                break;
            }
        }
    }

    #[test]
    fn test_tie_breaks_to_lower_reader() {
        let cmp = Arc::new(TypedKeyComparator::new(1));
        let readers = vec![pma_of(&[7, 7]), pma_of(&[7])];
        let mut engine = MergeEngine::new(readers, cmp);
        engine.init().unwrap();
        // first two records must come from reader 0
        assert_eq!(engine.current_reader(), 0);
        engine.advance().unwrap();
        assert_eq!(engine.current_reader(), 0);
        engine.advance().unwrap();
        assert_eq!(engine.current_reader(), 1);
    }

    #[test]
    fn test_incremental_merger_single_mode() {
        let cmp = Arc::new(TypedKeyComparator::new(1));
        let child = {
            let readers = vec![pma_of(&[1, 3, 5, 7, 9]), pma_of(&[2, 4, 6, 8, 10])];
            let mut e = MergeEngine::new(readers, cmp.clone());
            e.init().unwrap();
            e
        };
        // tiny cap forces many refills
        let region = StdTempStore.open_temp().unwrap();
        let incr = IncrMerger::new_single(child, region, 8, 512);
        let reader = PmaReader::from_incr(Box::new(incr), 512);

        let mut engine = MergeEngine::new(vec![reader], cmp);
        engine.init().unwrap();
        assert_eq!(drain(&mut engine), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn test_incremental_merger_threaded_mode() {
        let cmp = Arc::new(TypedKeyComparator::new(1));
        let child = {
            let readers = vec![pma_of(&[1, 4, 7, 10]), pma_of(&[2, 5, 8]), pma_of(&[3, 6, 9])];
            let mut e = MergeEngine::new(readers, cmp.clone());
            e.init().unwrap();
            e
        };
        let cur = StdTempStore.open_temp().unwrap();
        let next = StdTempStore.open_temp().unwrap();
        let incr = IncrMerger::new_threaded(child, cur, next, 8, 512);
        let reader = PmaReader::from_incr(Box::new(incr), 512);

        let mut engine = MergeEngine::new(vec![reader], cmp);
        engine.init().unwrap();
        assert_eq!(drain(&mut engine), (1..=10).collect::<Vec<i64>>());
    }
}
