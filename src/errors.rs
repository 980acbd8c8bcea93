//! Fault taxonomy and the per-run error ledger.
//!
//! The taxonomy is ordered by severity, matching the policy table: `Fatal`
//! aborts the whole run; `IoTransient` and `SilentData` are retried/recovered
//! in place; `Concurrent` skips just the offending block.

use std::io;
use thiserror::Error;

/// Classification of an I/O failure on a data or parity file.
///
/// Mirrors the `{Io, NotFound, Permission, Other, Fatal}` tagged type called
/// for by the arena re-architecture: the original `errno` is kept only for
/// diagnostics (`Display`), never matched on beyond these four kinds.
#[derive(Debug, Error)]
pub enum IoFault {
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    #[error("not found: {0}")]
    NotFound(#[source] io::Error),
    #[error("permission denied: {0}")]
    Permission(#[source] io::Error),
    #[error("unexpected error: {0}")]
    Other(#[source] io::Error),
}

impl IoFault {
    /// Classify a raw `io::Error` the way `DataHandle::open`/`read` must.
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => IoFault::NotFound(err),
            io::ErrorKind::PermissionDenied => IoFault::Permission(err),
            _ if is_eio(&err) => IoFault::Io(err),
            _ => IoFault::Other(err),
        }
    }

    /// True if this is the transient `EIO` class (data/parity read or write
    /// below the configured retry limit), as opposed to `NotFound`/
    /// `Permission` (concurrent modification) or `Other` (always fatal).
    pub fn is_eio(&self) -> bool {
        matches!(self, IoFault::Io(_))
    }
}

#[cfg(unix)]
fn is_eio(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc_eio())
}

#[cfg(unix)]
fn libc_eio() -> i32 {
    5 // EIO on Linux and most unices; stable ABI constant, not worth a libc dep.
}

#[cfg(not(unix))]
fn is_eio(_err: &io::Error) -> bool {
    false
}

/// The five fault kinds from the error handling design, one per table row.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Abort the sync entirely: `EIO` on close, any I/O on metadata, `EIO`
    /// past the retry limit, a resize failure, or a RAID precondition
    /// violation.
    #[error("fatal: {0}")]
    Fatal(String),

    /// `EIO` on data or parity read/write below the retry limit: offset
    /// marked bad, engine continues with the next offset.
    #[error("transient I/O error at offset {offset}: {source}")]
    IoTransient {
        offset: u32,
        #[source]
        source: IoFault,
    },

    /// Hash mismatch on a `BLK` block: attempt in-memory recovery first.
    #[error("silent data corruption at offset {offset}")]
    SilentData { offset: u32 },

    /// Stat/size/mtime/inode mismatch, `ENOENT`, `EACCES`, or a hash
    /// mismatch on a `REP` block: skip the block, tell the user to re-sync.
    #[error("concurrent modification at offset {offset}: {reason}")]
    Concurrent { offset: u32, reason: String },

    /// Silent corruption was successfully reconstructed in memory; parity is
    /// rewritten but the offset stays marked bad so the next run re-verifies.
    #[error("recovered silent corruption at offset {offset}")]
    Recovered { offset: u32 },
}

/// Accumulates the four run-wide counters plus a user-visible summary,
/// mirroring `RecoveryReport::summary()`'s formatting style.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorLedger {
    pub file_error: u32,
    pub io_error: u32,
    pub silent_error: u32,
    pub fatal: u32,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file_error(&mut self) {
        self.file_error += 1;
    }

    pub fn record_io_error(&mut self) {
        self.io_error += 1;
    }

    pub fn record_silent_error(&mut self) {
        self.silent_error += 1;
    }

    pub fn record_fatal(&mut self) {
        self.fatal += 1;
    }

    /// Success iff all four counters are zero, unless `expect_recoverable`
    /// inverts the table for self-testing.
    pub fn is_success(&self, expect_recoverable: bool) -> bool {
        let clean = self.file_error == 0
            && self.io_error == 0
            && self.silent_error == 0
            && self.fatal == 0;
        if expect_recoverable {
            !clean
        } else {
            clean
        }
    }

    pub fn total(&self) -> u32 {
        self.file_error + self.io_error + self.silent_error + self.fatal
    }

    /// User-visible summary, in the same spirit as the teacher's
    /// `RecoveryReport::summary()`.
    pub fn user_summary(&self) -> String {
        if self.total() == 0 {
            "Everything OK".to_owned()
        } else {
            format!(
                "{} file error(s), {} io error(s), {} data error(s), {} fatal error(s) — \
                 run `status` to list bad blocks, then `fix` to recover",
                self.file_error, self.io_error, self.silent_error, self.fatal,
            )
        }
    }
}
