//! # parisync — sync core of a snapshot-style parity array
//!
//! Guarantees:
//! - every block's state (`EMPTY`/`BLK`/`CHG`/`REP`/`DELETED`) accurately
//!   reflects whether its parity contribution is current
//! - silent on-disk corruption on up to `L` data strips is detected via a
//!   keyed content hash and repaired in place from surviving parity
//! - a crash at any point leaves the array recoverable from the last
//!   successful autosave; no torn mix of new data and old parity
//! - online operation, multi-writer metadata access, byte-level change
//!   tracking, and encryption are out of scope — see `Config`/`Options`

pub mod autosave;
pub mod config;
pub mod content;
pub mod engine;
pub mod errors;
pub mod handle;
pub mod hash;
pub mod hash_pass;
pub mod parity;
pub mod raid;

// Flat re-exports for the most common types.
pub use autosave::Autosaver;
pub use config::{Config, Options};
pub use content::{
    ArrayState, Block, BlockState, ContentStore, Disk, DiskId, FileId, FileRecord, InfoArray,
    InfoEntry, JsonContentStore, FILE_IS_COPY,
};
pub use engine::{SyncEngine, SyncOutcome};
pub use errors::{ErrorLedger, IoFault, SyncError};
pub use handle::DataHandle;
pub use hash::{HashKey, Hasher, HASH_SIZE};
pub use hash_pass::{HashPass, HashPassOutcome};
pub use parity::ParityHandle;
pub use raid::RaidCodec;
