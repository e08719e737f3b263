//! Temp-File Provision
//!
//! The sorter never names its spill files: it asks a [`TempStore`] for
//! anonymous temp files and addresses them by offset. [`TempHandle`] is a
//! cheaply cloneable positioned-I/O wrapper, so several readers can walk
//! different regions of one file without coordination, and a handle can be
//! moved into a worker thread while the owner keeps its own clone.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

/// Factory for sorter spill files
pub trait TempStore: Send + Sync {
    /// Open a fresh anonymous temp file. The file is expected to be
    /// unlinked already, so dropping the last handle releases the storage.
    fn open_temp(&self) -> io::Result<TempHandle>;
}

/// Default temp store backed by the system temp directory
#[derive(Debug, Clone, Default)]
pub struct StdTempStore;

impl TempStore for StdTempStore {
    fn open_temp(&self) -> io::Result<TempHandle> {
        Ok(TempHandle::from_file(tempfile::tempfile()?))
    }
}

/// Shared handle to one spill file; all I/O is positioned
#[derive(Debug, Clone)]
pub struct TempHandle {
    file: Arc<File>,
}

impl TempHandle {
    pub fn from_file(file: File) -> Self {
        TempHandle {
            file: Arc::new(file),
        }
    }

    /// Read up to `buf.len()` bytes at `offset`; short only at end of file
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(done)
    }

    /// Write all of `buf` at `offset`
    pub fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    /// Drop file contents, keeping the handle usable
    pub fn truncate(&self) -> io::Result<()> {
        self.file.set_len(0)
    }
}
