//! One flat file per parity level: create/resize/read/write/sync.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::SyncError;

/// A single parity level's backing file.
///
/// Grounded on the teacher's seek-then-write idiom for its block stream,
/// with a buffered-write path in the style of `perf::WriteBuffer` for the
/// common case of writing one strip at a time.
pub struct ParityHandle {
    path: PathBuf,
    file: File,
    strip_size: u32,
}

impl ParityHandle {
    /// Open (creating if necessary) the parity file at `path`, sized to
    /// hold `strip_size`-byte strips.
    pub fn open(path: impl Into<PathBuf>, strip_size: u32, mode: u32) -> Result<Self, SyncError> {
        let path = path.into();
        let file = open_with_mode(&path, mode)
            .map_err(|e| SyncError::Fatal(format!("parity: open {}: {e}", path.display())))?;
        Ok(ParityHandle { path, file, strip_size })
    }

    /// Grow (or shrink) the file so it holds exactly `strips` strips.
    /// A failed resize is always fatal: a parity file shorter than the
    /// array it's supposed to cover can silently corrupt every subsequent
    /// read at the tail offsets.
    pub fn resize(&mut self, strips: u32) -> Result<(), SyncError> {
        let len = strips as u64 * self.strip_size as u64;
        self.file
            .set_len(len)
            .map_err(|e| SyncError::Fatal(format!("parity: resize {}: {e}", self.path.display())))
    }

    /// Classify a raw I/O error the same way the engine does for data
    /// reads: only the transient `EIO` class is retried per-offset, every
    /// other kind (including a seek failure) escalates straight to fatal.
    fn classify(&self, offset: u32, e: std::io::Error) -> SyncError {
        let fault = crate::errors::IoFault::classify(e);
        if fault.is_eio() {
            SyncError::IoTransient { offset, source: fault }
        } else {
            SyncError::Fatal(format!("parity I/O at {} offset {offset}: {fault}", self.path.display()))
        }
    }

    pub fn read_strip(&mut self, offset: u32, out: &mut [u8]) -> Result<(), SyncError> {
        debug_assert_eq!(out.len(), self.strip_size as usize);
        let pos = offset as u64 * self.strip_size as u64;
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| self.classify(offset, e))?;
        let mut read = 0;
        while read < out.len() {
            match self.file.read(&mut out[read..]) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.classify(offset, e)),
            }
        }
        for b in out[read..].iter_mut() {
            *b = 0;
        }
        Ok(())
    }

    pub fn write_strip(&mut self, offset: u32, data: &[u8]) -> Result<(), SyncError> {
        debug_assert_eq!(data.len(), self.strip_size as usize);
        let pos = offset as u64 * self.strip_size as u64;
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| self.classify(offset, e))?;
        self.file.write_all(data).map_err(|e| self.classify(offset, e))
    }

    /// Durability barrier: all writes issued before this call are on
    /// stable storage once it returns. Must be called on every level
    /// before the metadata snapshot that depends on them is written.
    pub fn sync(&self) -> Result<(), SyncError> {
        self.file
            .sync_all()
            .map_err(|e| SyncError::Fatal(format!("parity: fsync {}: {e}", self.path.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .mode(mode)
        .open(path)
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_strip_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ParityHandle::open(dir.path().join("parity.0"), 8, 0o600).unwrap();
        h.resize(4).unwrap();
        h.write_strip(2, &[9u8; 8]).unwrap();
        h.sync().unwrap();

        let mut out = [0u8; 8];
        h.read_strip(2, &mut out).unwrap();
        assert_eq!(out, [9u8; 8]);
    }

    #[test]
    fn unwritten_strip_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = ParityHandle::open(dir.path().join("parity.0"), 4, 0o600).unwrap();
        h.resize(2).unwrap();
        let mut out = [1u8; 4];
        h.read_strip(0, &mut out).unwrap();
        assert_eq!(out, [0u8; 4]);
    }
}
