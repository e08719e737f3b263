//! PMA Spill Format
//!
//! A PMA (packed memory array) is one sorted run on disk:
//!
//! ```text
//! [varint total-byte-count] ([varint record-length][record bytes])*
//! ```
//!
//! The leading varint counts every byte after itself, per-record length
//! varints included. Several PMAs may be appended end-to-end in one temp
//! file; readers are told their start offset.
//!
//! [`PageWriter`] coalesces writes into page-sized blocks and carries a
//! sticky error: after the first failure all writes are discarded and the
//! error surfaces at [`PageWriter::finish`]. [`PmaReader`] serves records
//! out of an aligned page buffer when they fit and copies boundary
//! straddlers into a growing side allocation.

use super::error::{SortError, SortResult};
use super::merge::IncrMerger;
use super::vfs::TempHandle;

// ============================================================================
// Varints
// ============================================================================

/// Low-7-bits-first varint append
pub(crate) fn push_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

/// Encoded size of `v`
pub(crate) fn varint_len(v: u64) -> usize {
    let mut n = 1;
    let mut v = v >> 7;
    while v != 0 {
        n += 1;
        v >>= 7;
    }
    n
}

pub(crate) enum VarintParse {
    Complete(u64, usize),
    /// The slice ended mid-varint
    NeedMore,
    /// More than ten bytes of continuation: not a varint
    Malformed,
}

pub(crate) fn parse_varint(bytes: &[u8]) -> VarintParse {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().enumerate() {
        if i >= 10 {
            return VarintParse::Malformed;
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return VarintParse::Complete(value, i + 1);
        }
    }
    if bytes.len() >= 10 {
        VarintParse::Malformed
    } else {
        VarintParse::NeedMore
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Page-coalescing positioned writer with a sticky error
pub(crate) struct PageWriter {
    file: TempHandle,
    start: u64,
    offset: u64,
    buf: Vec<u8>,
    page_size: usize,
    err: Option<SortError>,
}

impl PageWriter {
    pub(crate) fn new(file: TempHandle, start: u64, page_size: usize) -> Self {
        let page_size = page_size.max(512);
        PageWriter {
            file,
            start,
            offset: start,
            buf: Vec::with_capacity(page_size),
            page_size,
            err: None,
        }
    }

    pub(crate) fn write(&mut self, mut data: &[u8]) {
        if self.err.is_some() {
            return;
        }
        while !data.is_empty() {
            let room = self.page_size - self.buf.len();
            let take = room.min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == self.page_size {
                self.flush_block();
            }
        }
    }

    pub(crate) fn write_varint(&mut self, v: u64) {
        let mut tmp = Vec::with_capacity(10);
        push_varint(&mut tmp, v);
        self.write(&tmp);
    }

    fn flush_block(&mut self) {
        if let Err(e) = self.file.write_all_at(&self.buf, self.offset) {
            self.err = Some(e.into());
        }
        self.offset += self.buf.len() as u64;
        self.buf.clear();
    }

    /// Bytes accepted so far, including any still buffered
    pub(crate) fn bytes_written(&self) -> u64 {
        self.offset - self.start + self.buf.len() as u64
    }

    /// Flush the short tail and surface any sticky error.
    /// Returns the file offset one past the last byte written.
    pub(crate) fn finish(mut self) -> SortResult<u64> {
        if !self.buf.is_empty() && self.err.is_none() {
            self.flush_block();
        }
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.offset),
        }
    }
}

/// Serialize one sorted run as a PMA at `start`; returns the end offset
pub(crate) fn write_pma<'a>(
    file: &TempHandle,
    start: u64,
    page_size: usize,
    records: impl Iterator<Item = &'a [u8]> + Clone,
) -> SortResult<u64> {
    let total: u64 = records
        .clone()
        .map(|r| (varint_len(r.len() as u64) + r.len()) as u64)
        .sum();
    let mut writer = PageWriter::new(file.clone(), start, page_size);
    writer.write_varint(total);
    for record in records {
        writer.write_varint(record.len() as u64);
        writer.write(record);
    }
    writer.finish()
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug)]
enum Current {
    None,
    /// Record fully inside the page buffer
    Window { start: usize, len: usize },
    /// Record copied into the side allocation
    Spill(usize),
}

/// Streaming reader over one PMA, one incremental-merge region sequence,
/// or one raw record region
pub(crate) struct PmaReader {
    file: TempHandle,
    pos: u64,
    eof: u64,
    page_size: usize,
    buf: Vec<u8>,
    buf_start: u64,
    buf_len: usize,
    spill: Vec<u8>,
    cur: Current,
    serial: u64,
    incr: Option<Box<IncrMerger>>,
}

impl PmaReader {
    /// Open a reader on the PMA whose header varint sits at `start`
    pub(crate) fn open_pma(file: TempHandle, start: u64, page_size: usize) -> SortResult<Self> {
        let mut reader = PmaReader {
            file,
            pos: start,
            eof: u64::MAX,
            page_size: page_size.max(512),
            buf: Vec::new(),
            buf_start: 0,
            buf_len: 0,
            spill: Vec::new(),
            cur: Current::None,
            serial: 0,
            incr: None,
        };
        let total = reader.read_varint()?;
        reader.eof = reader.pos + total;
        Ok(reader)
    }

    /// Reader fed by an incremental merger; regions are fetched on demand
    pub(crate) fn from_incr(incr: Box<IncrMerger>, page_size: usize) -> Self {
        let file = incr.current_handle().clone();
        PmaReader {
            file,
            pos: 0,
            eof: 0,
            page_size: page_size.max(512),
            buf: Vec::new(),
            buf_start: 0,
            buf_len: 0,
            spill: Vec::new(),
            cur: Current::None,
            serial: 0,
            incr: None,
        }
        .with_incr(incr)
    }

    fn with_incr(mut self, incr: Box<IncrMerger>) -> Self {
        self.incr = Some(incr);
        self
    }

    /// Advance to the next record. `Ok(false)` at end of stream.
    pub(crate) fn next(&mut self) -> SortResult<bool> {
        while self.pos >= self.eof {
            let Some(incr) = self.incr.as_mut() else {
                self.cur = Current::None;
                return Ok(false);
            };
            match incr.next_region()? {
                Some((handle, start, end)) => {
                    self.file = handle;
                    self.pos = start;
                    self.eof = end;
                    self.buf_len = 0; // window belongs to the old region
                }
                None => {
                    self.cur = Current::None;
                    return Ok(false);
                }
            }
        }

        let len = self.read_varint()? as usize;
        if len == 0 || self.pos + len as u64 > self.eof {
            return Err(SortError::Corrupt("record length overruns its run"));
        }

        let avail = self.ensure_window()?;
        if avail >= len {
            self.cur = Current::Window {
                start: (self.pos - self.buf_start) as usize,
                len,
            };
            self.pos += len as u64;
        } else {
            // straddles the page boundary: gather into the side allocation
            self.spill.clear();
            self.spill.reserve(len);
            while self.spill.len() < len {
                let avail = self.ensure_window()?;
                let take = avail.min(len - self.spill.len());
                let off = (self.pos - self.buf_start) as usize;
                self.spill.extend_from_slice(&self.buf[off..off + take]);
                self.pos += take as u64;
            }
            self.cur = Current::Spill(len);
        }
        self.serial += 1;
        Ok(true)
    }

    /// Current record, valid until the next call to [`PmaReader::next`]
    pub(crate) fn key(&self) -> Option<&[u8]> {
        match self.cur {
            Current::None => None,
            Current::Window { start, len } => Some(&self.buf[start..start + len]),
            Current::Spill(len) => Some(&self.spill[..len]),
        }
    }

    /// Monotonic counter identifying the current record, used by the merge
    /// engine to skip redundant scratch unpacking
    pub(crate) fn serial(&self) -> u64 {
        self.serial
    }

    /// Bytes available at `pos` inside the page buffer, refilling if empty
    fn ensure_window(&mut self) -> SortResult<usize> {
        let in_window =
            self.pos >= self.buf_start && self.pos < self.buf_start + self.buf_len as u64;
        if !in_window {
            let aligned = self.pos - self.pos % self.page_size as u64;
            if self.buf.len() != self.page_size {
                self.buf.resize(self.page_size, 0);
            }
            self.buf_len = self.file.read_at(&mut self.buf, aligned)?;
            self.buf_start = aligned;
            if self.pos >= self.buf_start + self.buf_len as u64 {
                return Err(SortError::Corrupt("spill file shorter than its header"));
            }
        }
        let window_end = self.buf_start + self.buf_len as u64;
        Ok((window_end.min(self.eof) - self.pos) as usize)
    }

    fn read_varint(&mut self) -> SortResult<u64> {
        let avail = self.ensure_window()?;
        let off = (self.pos - self.buf_start) as usize;
        let slice_end = off + avail.min(10);
        match parse_varint(&self.buf[off..slice_end]) {
            VarintParse::Complete(v, n) => {
                self.pos += n as u64;
                Ok(v)
            }
            VarintParse::Malformed => Err(SortError::Corrupt("malformed varint")),
            VarintParse::NeedMore => {
                // the varint straddles the page boundary: one byte at a time
                let mut value = 0u64;
                for i in 0..10 {
                    if self.ensure_window()? == 0 {
                        return Err(SortError::Corrupt("varint overruns its run"));
                    }
                    let b = self.buf[(self.pos - self.buf_start) as usize];
                    self.pos += 1;
                    value |= u64::from(b & 0x7f) << (7 * i);
                    if b & 0x80 == 0 {
                        return Ok(value);
                    }
                }
                Err(SortError::Corrupt("malformed varint"))
            }
        }
    }
}

impl std::fmt::Debug for PmaReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmaReader")
            .field("pos", &self.pos)
            .field("eof", &self.eof)
            .field("serial", &self.serial)
            .field("incremental", &self.incr.is_some())
            .finish()
    }
}
