//! Per-file data access: open, stat-check against what metadata last
//! recorded, bounded reads with short-read zero-fill, close.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::content::FileRecord;
use crate::errors::{IoFault, SyncError};

/// Metadata snapshot taken at `open` time, compared against the tracked
/// `FileRecord` to detect concurrent modification before trusting any read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatSnapshot {
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub inode: u64,
}

impl StatSnapshot {
    pub fn matches(&self, rec: &FileRecord) -> bool {
        self.size == rec.size
            && self.mtime_sec == rec.mtime_sec
            && self.mtime_nsec == rec.mtime_nsec
            && self.inode == rec.inode
    }
}

#[cfg(unix)]
fn stat_snapshot(file: &File) -> std::io::Result<StatSnapshot> {
    use std::os::unix::fs::MetadataExt;
    let m = file.metadata()?;
    Ok(StatSnapshot {
        size: m.size(),
        mtime_sec: m.mtime(),
        mtime_nsec: m.mtime_nsec() as u32,
        inode: m.ino(),
    })
}

#[cfg(not(unix))]
fn stat_snapshot(file: &File) -> std::io::Result<StatSnapshot> {
    let m = file.metadata()?;
    let mtime = m
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .unwrap_or_default();
    Ok(StatSnapshot {
        size: m.len(),
        mtime_sec: mtime.as_secs() as i64,
        mtime_nsec: mtime.subsec_nanos(),
        inode: 0,
    })
}

/// A handle on one open data file, bound to the stat snapshot taken at
/// open time so every subsequent read can be checked for a concurrent
/// modification without re-statting.
pub struct DataHandle {
    file: File,
    pub snapshot: StatSnapshot,
}

impl DataHandle {
    /// Open `path` and classify any failure: `NotFound`/`Permission` map to
    /// a concurrent-modification fault (the file disappeared or its
    /// permissions changed out from under the sync), everything else is
    /// the transient-I/O or fatal classes `IoFault::classify` assigns.
    pub fn open(path: &Path) -> Result<Self, IoFault> {
        let file = File::open(path).map_err(IoFault::classify)?;
        let snapshot = stat_snapshot(&file).map_err(IoFault::classify)?;
        Ok(DataHandle { file, snapshot })
    }

    /// Check the handle's snapshot against the metadata last recorded for
    /// this file; a mismatch means the file changed between when it was
    /// scanned and when this handle was opened.
    pub fn check_unchanged(&self, rec: &FileRecord, offset: u32) -> Result<(), SyncError> {
        if self.snapshot.matches(rec) {
            Ok(())
        } else {
            Err(SyncError::Concurrent {
                offset,
                reason: "file size/mtime/inode changed since scan".into(),
            })
        }
    }

    /// Read exactly `block_size` bytes starting at `offset * block_size`,
    /// zero-filling any bytes past end-of-file (the final, partial block of
    /// a file still occupies a whole block slot).
    pub fn read_block(&mut self, offset: u32, block_size: u32, out: &mut [u8]) -> Result<(), IoFault> {
        debug_assert_eq!(out.len(), block_size as usize);
        use std::io::{Seek, SeekFrom};
        let pos = offset as u64 * block_size as u64;
        self.file.seek(SeekFrom::Start(pos)).map_err(IoFault::classify)?;

        let mut read_total = 0usize;
        while read_total < out.len() {
            match self.file.read(&mut out[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IoFault::classify(e)),
            }
        }
        for b in out[read_total..].iter_mut() {
            *b = 0;
        }
        Ok(())
    }
}
