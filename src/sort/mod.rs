//! # External Merge Sorter
//!
//! Ordered-stream abstraction for result volumes that outgrow memory. The
//! lifecycle is strict:
//!
//! ```text
//! new -> write* -> rewind -> (rowkey | advance | compare)* -> reset/drop
//! ```
//!
//! Records accumulate in memory until a spill threshold is crossed, then
//! each run is sorted (64-bin merge) and written to a temp file as a PMA.
//! `rewind` merges every run through a tournament tree; above a fan-in of
//! 16 the tree becomes hierarchical, with incremental mergers refilling
//! bounded file regions on demand. With `worker_threads > 0`, spills are
//! dispatched round-robin to background workers (the sorter itself is the
//! final, foreground subtask) and upper-level merge regions are populated
//! concurrently with reading.
//!
//! Errors are sticky: after the first failure every call re-surfaces the
//! same error until [`Sorter::reset`]. Dropping the sorter joins all
//! outstanding workers and releases every temp file.

pub mod error;
mod memsort;
mod merge;
mod pma;
pub mod record;
pub mod vfs;

pub use error::{SortError, SortResult};
pub use record::{
    decode_key, encode_key, KeyComparator, SortField, TypedKeyComparator, UnpackedRecord,
};
pub use vfs::{StdTempStore, TempHandle, TempStore};

use crate::budget::MemoryBudget;
use crate::config::SorterConfig;
use memsort::merge_sort;
use merge::{IncrMerger, MergeEngine, MERGE_FANIN};
use pma::{varint_len, write_pma, PmaReader};
use std::cmp::Ordering;
use std::mem;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

// ============================================================================
// Record storage
// ============================================================================

/// One buffered record: its own allocation, or a span of the bulk arena.
/// A sorter uses exactly one of the two regimes, never both.
#[derive(Debug)]
pub(crate) enum StoredRecord {
    Heap(Box<[u8]>),
    Arena { offset: u32, len: u32 },
}

pub(crate) fn record_bytes<'a>(record: &'a StoredRecord, arena: &'a [u8]) -> &'a [u8] {
    match record {
        StoredRecord::Heap(b) => b,
        StoredRecord::Arena { offset, len } => {
            &arena[*offset as usize..(*offset + *len) as usize]
        }
    }
}

// ============================================================================
// Subtasks
// ============================================================================

/// Outcome of one spill: the PMA span appended to the subtask's file
type FlushOutput = SortResult<(u64, u64)>;

/// One spill lane. Each subtask owns its temp file exclusively; a worker
/// thread touches only the subtask it was handed.
#[derive(Default)]
struct SortSubtask {
    file: Option<TempHandle>,
    file_len: u64,
    pmas: Vec<(u64, u64)>,
    worker: Option<JoinHandle<FlushOutput>>,
}

/// Everything a flush needs, moved into the worker by value
struct FlushJob {
    records: Vec<StoredRecord>,
    arena: Option<Vec<u8>>,
    cmp: Arc<dyn KeyComparator>,
    file: TempHandle,
    start: u64,
    page_size: usize,
    budget: Arc<MemoryBudget>,
    charged: usize,
}

fn run_flush(job: FlushJob) -> FlushOutput {
    let FlushJob {
        records,
        arena,
        cmp,
        file,
        start,
        page_size,
        budget,
        charged,
    } = job;
    let arena_ref: &[u8] = arena.as_deref().unwrap_or(&[]);
    let mut scratch = cmp.new_scratch();

    let sorted = merge_sort(records, |a, b| {
        cmp.compare(
            &mut scratch,
            record_bytes(a, arena_ref),
            record_bytes(b, arena_ref),
        )
    });
    let result = match scratch.err.take() {
        Some(e) => Err(e),
        None => write_pma(
            &file,
            start,
            page_size,
            sorted.iter().map(|r| record_bytes(r, arena_ref)),
        )
        .map(|end| (start, end)),
    };
    budget.release(charged);
    result
}

// ============================================================================
// The sorter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Writing,
    Reading,
}

/// Where reads come from after rewind
enum ReadHead {
    /// Nothing ever spilled: serve straight from the sorted list
    Mem {
        records: Vec<StoredRecord>,
        arena: Option<Vec<u8>>,
        pos: usize,
    },
    Merge(MergeEngine),
}

/// External merge sorter over opaque, host-compared record keys
pub struct Sorter {
    cfg: SorterConfig,
    cmp: Arc<dyn KeyComparator>,
    n_key_fields: usize,
    temp_store: Arc<dyn TempStore>,
    budget: Arc<MemoryBudget>,

    phase: Phase,
    list: Vec<StoredRecord>,
    list_bytes: usize,
    arena: Option<Vec<u8>>,
    subtasks: Vec<SortSubtask>,
    rr_next: usize,
    spilled: bool,
    reader: Option<ReadHead>,
    scratch: UnpackedRecord,
    err: Option<SortError>,
}

impl Sorter {
    /// Create a sorter for keys of `n_key_fields` fields, owned by one
    /// cursor of the virtual machine
    pub fn new(cfg: &SorterConfig, cmp: Arc<dyn KeyComparator>, n_key_fields: usize) -> Self {
        let workers = cfg.effective_workers();
        let scratch = cmp.new_scratch();
        let budget = Arc::new(MemoryBudget::new(cfg.memory_limit));
        Sorter {
            cfg: cfg.clone(),
            cmp,
            n_key_fields,
            temp_store: Arc::new(StdTempStore),
            budget,
            phase: Phase::Writing,
            list: Vec::new(),
            list_bytes: 0,
            arena: cfg.bulk_arena.then(Vec::new),
            subtasks: (0..=workers).map(|_| SortSubtask::default()).collect(),
            rr_next: 0,
            spilled: false,
            reader: None,
            scratch,
            err: None,
        }
    }

    /// Replace the default temp-file factory
    pub fn with_temp_store(mut self, store: Arc<dyn TempStore>) -> Self {
        self.temp_store = store;
        self
    }

    /// Share a memory budget with the rest of the engine
    pub fn with_budget(mut self, budget: Arc<MemoryBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Spilled-run count so far (for tests and statistics)
    pub fn spill_count(&self) -> usize {
        self.subtasks.iter().map(|s| s.pmas.len()).sum()
    }

    fn check_err(&self) -> SortResult<()> {
        match &self.err {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn fail<T>(&mut self, e: SortError) -> SortResult<T> {
        tracing::warn!(error = %e, "sorter entering sticky error state");
        self.err = Some(e.clone());
        Err(e)
    }

    // ------------------------------------------------------------------
    // Write phase
    // ------------------------------------------------------------------

    /// Append one record key
    pub fn write(&mut self, record: &[u8]) -> SortResult<()> {
        self.check_err()?;
        if self.phase != Phase::Writing {
            return self.fail(SortError::Misuse("write after rewind"));
        }
        if record.is_empty() {
            return self.fail(SortError::Misuse("empty record"));
        }
        let n_req = record.len() + varint_len(record.len() as u64);

        // spill before accepting the record that would overflow the run
        let must_flush = if self.arena.is_some() {
            let used = self.arena.as_ref().map_or(0, Vec::len);
            !self.list.is_empty() && used + n_req > self.cfg.max_pma_bytes
        } else {
            !self.list.is_empty()
                && (self.list_bytes + n_req > self.cfg.max_pma_bytes
                    || (self.list_bytes + n_req > self.cfg.min_pma_bytes
                        && self.budget.nearly_full()))
        };
        if must_flush {
            if let Err(e) = self.enqueue_flush(false) {
                return self.fail(e);
            }
        }

        match &mut self.arena {
            Some(arena) => {
                let offset = arena.len() as u32;
                arena.extend_from_slice(record);
                self.list.push(StoredRecord::Arena {
                    offset,
                    len: record.len() as u32,
                });
            }
            None => {
                self.list.push(StoredRecord::Heap(record.into()));
            }
        }
        self.list_bytes += n_req;
        self.budget.charge(n_req);
        Ok(())
    }

    /// Sort and spill the buffered list as one PMA. With workers
    /// configured, the job goes to an idle worker slot round-robin; if
    /// none is idle (or `foreground` is set) the calling thread does the
    /// flush itself on the foreground subtask.
    fn enqueue_flush(&mut self, foreground: bool) -> SortResult<()> {
        if self.list.is_empty() {
            return Ok(());
        }
        let records = mem::take(&mut self.list);
        let arena = self.arena.take();
        if self.cfg.bulk_arena {
            self.arena = Some(Vec::new());
        }
        let charged = mem::take(&mut self.list_bytes);
        self.spilled = true;

        let n_workers = self.subtasks.len() - 1;
        let slot = if foreground || n_workers == 0 {
            None
        } else {
            let order = (0..n_workers).map(|k| (self.rr_next + k) % n_workers);
            order
                .clone()
                .find(|&i| self.subtasks[i].worker.is_none())
                .or_else(|| {
                    // a finished worker can be joined without blocking
                    order.clone().find(|&i| {
                        self.subtasks[i]
                            .worker
                            .as_ref()
                            .is_some_and(JoinHandle::is_finished)
                    })
                })
        };
        if let Some(idx) = slot {
            self.join_worker(idx)?;
        }

        let idx = slot.unwrap_or(n_workers);
        if self.subtasks[idx].file.is_none() {
            match self.temp_store.open_temp() {
                Ok(file) => self.subtasks[idx].file = Some(file),
                Err(e) => {
                    self.budget.release(charged);
                    return Err(e.into());
                }
            }
        }
        let subtask = &mut self.subtasks[idx];
        let Some(file) = subtask.file.clone() else {
            self.budget.release(charged);
            return Err(SortError::Misuse("subtask file missing"));
        };
        let job = FlushJob {
            records,
            arena,
            cmp: Arc::clone(&self.cmp),
            file,
            start: subtask.file_len,
            page_size: self.cfg.page_size,
            budget: Arc::clone(&self.budget),
            charged,
        };
        debug!(
            subtask = idx,
            bytes = charged,
            background = slot.is_some(),
            "spilling sorted run"
        );

        if slot.is_some() {
            subtask.worker = Some(std::thread::spawn(move || run_flush(job)));
            self.rr_next = (idx + 1) % n_workers;
            Ok(())
        } else {
            let (start, end) = run_flush(job)?;
            let subtask = &mut self.subtasks[idx];
            subtask.pmas.push((start, end));
            subtask.file_len = end;
            Ok(())
        }
    }

    /// Collect one worker's output. Blocking.
    fn join_worker(&mut self, idx: usize) -> SortResult<()> {
        let Some(handle) = self.subtasks[idx].worker.take() else {
            return Ok(());
        };
        let (start, end) = handle.join().map_err(|_| SortError::WorkerPanic)??;
        let subtask = &mut self.subtasks[idx];
        subtask.pmas.push((start, end));
        subtask.file_len = end;
        Ok(())
    }

    /// Join every outstanding worker, highest index first
    fn join_all_workers(&mut self) -> SortResult<()> {
        let mut first_err = None;
        for idx in (0..self.subtasks.len()).rev() {
            if let Err(e) = self.join_worker(idx) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Read phase
    // ------------------------------------------------------------------

    /// Terminate the write phase and position on the first record.
    /// Returns `true` when the sorter holds no records at all.
    pub fn rewind(&mut self) -> SortResult<bool> {
        self.check_err()?;
        if self.phase != Phase::Writing {
            return self.fail(SortError::Misuse("rewind outside the write phase"));
        }
        if self.cmp.field_count() != self.n_key_fields {
            let e = SortError::SchemaMismatch {
                sorter: self.n_key_fields,
                comparator: self.cmp.field_count(),
            };
            return self.fail(e);
        }

        if !self.spilled {
            // everything fits: sort in place and read from memory
            let records = mem::take(&mut self.list);
            let arena = self.arena.take();
            let arena_ref: &[u8] = arena.as_deref().unwrap_or(&[]);
            let cmp = Arc::clone(&self.cmp);
            let mut scratch = cmp.new_scratch();
            let sorted = merge_sort(records, |a, b| {
                cmp.compare(
                    &mut scratch,
                    record_bytes(a, arena_ref),
                    record_bytes(b, arena_ref),
                )
            });
            if let Some(e) = scratch.err.take() {
                return self.fail(e);
            }
            let eof = sorted.is_empty();
            self.reader = Some(ReadHead::Mem {
                records: sorted,
                arena,
                pos: 0,
            });
            self.phase = Phase::Reading;
            return Ok(eof);
        }

        // final run spills on the calling thread, then workers are joined
        // highest-index first so the foreground lane settles last
        if let Err(e) = self.enqueue_flush(true) {
            return self.fail(e);
        }
        if let Err(e) = self.join_all_workers() {
            return self.fail(e);
        }

        let mut specs = Vec::new();
        for subtask in &self.subtasks {
            if let Some(file) = &subtask.file {
                for &(start, end) in &subtask.pmas {
                    specs.push((file.clone(), start, end));
                }
            }
        }
        debug!(pmas = specs.len(), "building merge tree");

        let engine = match self.build_merge_tree(specs) {
            Ok(engine) => engine,
            Err(e) => return self.fail(e),
        };
        let eof = engine.key().is_none();
        self.reader = Some(ReadHead::Merge(engine));
        self.phase = Phase::Reading;
        Ok(eof)
    }

    /// Stack merge engines until the reader count fits one tournament
    /// tree. Depth grows with log16 of the PMA count.
    fn build_merge_tree(&self, specs: Vec<(TempHandle, u64, u64)>) -> SortResult<MergeEngine> {
        let page_size = self.cfg.page_size;
        let threaded = self.cfg.effective_workers() > 0;
        let region_cap = (self.cfg.max_pma_bytes as u64).max(16 * page_size as u64);

        let mut readers = Vec::with_capacity(specs.len());
        for (file, start, _end) in specs {
            readers.push(PmaReader::open_pma(file, start, page_size)?);
        }

        while readers.len() > MERGE_FANIN {
            let mut grouped = Vec::with_capacity(readers.len().div_ceil(MERGE_FANIN));
            let mut iter = readers.into_iter();
            loop {
                let group: Vec<PmaReader> = iter.by_ref().take(MERGE_FANIN).collect();
                if group.is_empty() {
                    break;
                }
                let mut child = MergeEngine::new(group, Arc::clone(&self.cmp));
                child.init()?;
                let incr = if threaded {
                    IncrMerger::new_threaded(
                        child,
                        self.temp_store.open_temp()?,
                        self.temp_store.open_temp()?,
                        region_cap,
                        page_size,
                    )
                } else {
                    IncrMerger::new_single(
                        child,
                        self.temp_store.open_temp()?,
                        region_cap,
                        page_size,
                    )
                };
                grouped.push(PmaReader::from_incr(Box::new(incr), page_size));
            }
            readers = grouped;
        }

        let mut engine = MergeEngine::new(readers, Arc::clone(&self.cmp));
        engine.init()?;
        Ok(engine)
    }

    /// Step to the next record. `Ok(false)` at end of stream.
    pub fn advance(&mut self) -> SortResult<bool> {
        self.check_err()?;
        match &mut self.reader {
            None => self.fail(SortError::Misuse("advance before rewind")),
            Some(ReadHead::Mem { records, pos, .. }) => {
                if *pos < records.len() {
                    *pos += 1;
                }
                Ok(*pos < records.len())
            }
            Some(ReadHead::Merge(engine)) => match engine.advance() {
                Ok(more) => Ok(more),
                Err(e) => self.fail(e),
            },
        }
    }

    /// Current record key, valid until the next [`Sorter::advance`]
    pub fn rowkey(&self) -> SortResult<&[u8]> {
        self.check_err()?;
        match &self.reader {
            None => Err(SortError::Misuse("rowkey before rewind")),
            Some(ReadHead::Mem {
                records,
                arena,
                pos,
            }) => records
                .get(*pos)
                .map(|r| record_bytes(r, arena.as_deref().unwrap_or(&[])))
                .ok_or(SortError::Misuse("rowkey at end of stream")),
            Some(ReadHead::Merge(engine)) => engine
                .key()
                .ok_or(SortError::Misuse("rowkey at end of stream")),
        }
    }

    /// Three-valued comparison of the current sorter key against a caller
    /// key, ignoring the last `ignore_trailing` key fields. A sorter key
    /// containing any NULL among the compared fields sorts below the
    /// caller key no matter what the caller holds.
    pub fn compare(&mut self, key: &[u8], ignore_trailing: usize) -> SortResult<Ordering> {
        self.check_err()?;
        let n_fields = self.n_key_fields.saturating_sub(ignore_trailing);
        let sorter_key: &[u8] = match &self.reader {
            None => return Err(SortError::Misuse("compare before rewind")),
            Some(ReadHead::Mem {
                records,
                arena,
                pos,
            }) => match records.get(*pos) {
                Some(r) => record_bytes(r, arena.as_deref().unwrap_or(&[])),
                None => return Err(SortError::Misuse("compare at end of stream")),
            },
            Some(ReadHead::Merge(engine)) => match engine.key() {
                Some(k) => k,
                None => return Err(SortError::Misuse("compare at end of stream")),
            },
        };
        if self.cmp.contains_null(sorter_key, n_fields) {
            return Ok(Ordering::Less);
        }
        let ord = self
            .cmp
            .compare_prefix(&mut self.scratch, sorter_key, key, n_fields);
        match self.scratch.err.take() {
            Some(e) => {
                self.err = Some(e.clone());
                Err(e)
            }
            None => Ok(ord),
        }
    }

    /// Return to the write phase, dropping all buffered and spilled state.
    /// Always runs to completion; clears any sticky error.
    pub fn reset(&mut self) {
        for idx in (0..self.subtasks.len()).rev() {
            if let Some(handle) = self.subtasks[idx].worker.take() {
                let _ = handle.join();
            }
        }
        let workers = self.subtasks.len() - 1;
        self.subtasks = (0..=workers).map(|_| SortSubtask::default()).collect();
        self.budget.release(self.list_bytes);
        self.list = Vec::new();
        self.list_bytes = 0;
        self.arena = self.cfg.bulk_arena.then(Vec::new);
        self.reader = None;
        self.rr_next = 0;
        self.spilled = false;
        self.phase = Phase::Writing;
        self.err = None;
    }
}

impl Drop for Sorter {
    fn drop(&mut self) {
        // release resources regardless of error state
        for idx in (0..self.subtasks.len()).rev() {
            if let Some(handle) = self.subtasks[idx].worker.take() {
                let _ = handle.join();
            }
        }
        self.budget.release(self.list_bytes);
    }
}

impl std::fmt::Debug for Sorter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sorter")
            .field("phase", &self.phase)
            .field("buffered", &self.list.len())
            .field("spilled_pmas", &self.spill_count())
            .field("error", &self.err)
            .finish()
    }
}
