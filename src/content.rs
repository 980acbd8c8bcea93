//! The metadata arena: disks, files, and blocks addressed by index rather
//! than by pointer or back-reference, plus its on-disk persistence.
//!
//! A `Block` only ever needs to know which file owns it and at what
//! position; a `FileRecord` only ever needs to know which disk it lives on.
//! Both are expressed as plain index newtypes into `ArrayState`'s arenas,
//! replacing the cyclic back-references a pointer-based model would need.

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};
use uuid::Uuid;

use crate::errors::SyncError;
use crate::hash::{Digest, HASH_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub usize);

/// One data disk: a name for display and the number of blocks it
/// currently spans (its files' blocks are addressed through `BlockIndex`,
/// not stored here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub mount_point: String,
}

/// A `FileRecord`'s copy-on-rename bit: set when a file is known to be a
/// byte-identical copy of another tracked file, letting a rename be
/// recognized without a full re-hash.
pub const FILE_IS_COPY: u32 = 0x01;

/// One tracked file: which disk it lives on, its size, mtime, and inode at
/// last sync, plus a bitset of flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub disk: DiskId,
    pub path: String,
    pub size: u64,
    pub mtime_sec: i64,
    pub mtime_nsec: u32,
    pub inode: u64,
    pub flags: u32,
}

impl FileRecord {
    pub fn is_copy(&self) -> bool {
        self.flags & FILE_IS_COPY != 0
    }
}

/// The block state machine: exactly the five states a block can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    /// No file currently occupies this position.
    Empty,
    /// Stable: hash verified against parity as of the last sync.
    Blk,
    /// Changed since the last sync: content hash not yet trusted.
    Chg,
    /// Replaced: file identity changed (rename/copy) but content may match
    /// a hash carried over from the old identity.
    Rep,
    /// Marked for removal: still occupies the slot until parity is updated
    /// to no longer depend on it.
    Deleted,
}

/// One block slot within a file's block run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub file: FileId,
    /// Block index within the owning file, independent of this slot's
    /// absolute array offset — a renamed or moved file keeps its blocks'
    /// relative positions even if its first occupied offset changes.
    pub file_pos: u32,
    pub state: BlockState,
    #[serde(with = "hash_as_hex")]
    pub hash: Digest,
}

mod hash_as_hex {
    use super::{Digest, HASH_SIZE};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Digest, s: S) -> Result<S::Ok, S::Error> {
        hex::encode(d).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Digest, D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != HASH_SIZE {
            return Err(serde::de::Error::custom("wrong hash length"));
        }
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

/// Per-offset run metadata, one entry per row of the parity array,
/// independent of which disk/file occupies that row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InfoEntry {
    /// Unix timestamp of the last successful sync touching this offset.
    pub last_sync_time: i64,
    /// Set when a fault was recorded at this offset and never cleared by a
    /// clean re-verify; carried across runs until resolved.
    pub bad: bool,
    /// Set to force a content re-hash on the next hash pass regardless of
    /// the block's state.
    pub rehash: bool,
    /// Set for the duration of one run once this offset has been
    /// successfully synced, to avoid re-processing it within the same run.
    pub justsynced: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InfoArray {
    pub entries: Vec<InfoEntry>,
}

impl InfoArray {
    pub fn with_len(len: usize) -> Self {
        InfoArray {
            entries: vec![InfoEntry::default(); len],
        }
    }

    pub fn get(&self, offset: u32) -> InfoEntry {
        self.entries.get(offset as usize).copied().unwrap_or_default()
    }

    pub fn mark_bad(&mut self, offset: u32) {
        if let Some(e) = self.entries.get_mut(offset as usize) {
            e.bad = true;
        }
    }

    pub fn clear_bad(&mut self, offset: u32) {
        if let Some(e) = self.entries.get_mut(offset as usize) {
            e.bad = false;
        }
    }

    pub fn mark_synced(&mut self, offset: u32, when: i64) {
        if let Some(e) = self.entries.get_mut(offset as usize) {
            e.last_sync_time = when;
            e.justsynced = true;
        }
    }

    pub fn reset_justsynced(&mut self) {
        for e in self.entries.iter_mut() {
            e.justsynced = false;
        }
    }
}

/// The full in-memory array: arenas for disks and files, the per-disk
/// block runs, and the shared per-offset info array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayState {
    /// Stable identity for this array, independent of its content path —
    /// distinguishes one array's metadata snapshot from another's the same
    /// way the teacher's `SuperblockHeader::archive_uuid` identifies one
    /// archive, generated once and never reassigned.
    pub archive_id: Uuid,
    pub block_size: u32,
    pub blockmax: u32,
    pub disks: Vec<Disk>,
    pub files: Vec<FileRecord>,
    /// `blocks[disk.0]` is that disk's block run, indexed by offset.
    pub blocks: Vec<Vec<Block>>,
    pub info: InfoArray,
}

impl ArrayState {
    pub fn new(block_size: u32, disks: Vec<Disk>) -> Self {
        let n = disks.len();
        ArrayState {
            archive_id: Uuid::new_v4(),
            block_size,
            blockmax: 0,
            disks,
            files: Vec::new(),
            blocks: vec![Vec::new(); n],
            info: InfoArray::default(),
        }
    }

    pub fn disk_count(&self) -> usize {
        self.disks.len()
    }

    /// Grow every disk's block run and the shared info array to `blockmax`,
    /// padding new slots with `Empty`/default entries.
    pub fn grow_to(&mut self, blockmax: u32) {
        if blockmax <= self.blockmax {
            return;
        }
        for run in self.blocks.iter_mut() {
            run.resize_with(blockmax as usize, || Block {
                file: FileId(usize::MAX),
                file_pos: 0,
                state: BlockState::Empty,
                hash: [0u8; HASH_SIZE],
            });
        }
        self.info.entries.resize(blockmax as usize, InfoEntry::default());
        self.blockmax = blockmax;
    }
}

/// Persistence boundary for an `ArrayState`: abstracted so an alternate
/// format (or a test double) can stand in without touching the engine.
pub trait ContentStore {
    fn load(&self) -> Result<ArrayState, SyncError>;
    fn save(&self, state: &ArrayState) -> Result<(), SyncError>;
}

/// Length-prefixed JSON body with a CRC32 trailer, the same defensive shape
/// as the teacher's fixed-header-plus-CRC32-trailer framing: verify the
/// checksum before trusting the parse, so a half-written file is detected
/// as corrupt rather than silently truncated-parsed.
pub struct JsonContentStore {
    pub path: std::path::PathBuf,
}

impl JsonContentStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        JsonContentStore { path: path.into() }
    }
}

impl ContentStore for JsonContentStore {
    fn load(&self) -> Result<ArrayState, SyncError> {
        let mut file = std::fs::File::open(&self.path)
            .map_err(|e| SyncError::Fatal(format!("content: open {}: {e}", self.path.display())))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| SyncError::Fatal(format!("content: read {}: {e}", self.path.display())))?;

        if buf.len() < 8 {
            return Err(SyncError::Fatal("content: truncated metadata file".into()));
        }
        let (header, rest) = buf.split_at(4);
        let body_len = u32::from_le_bytes(header.try_into().unwrap()) as usize;
        if rest.len() < body_len + 4 {
            return Err(SyncError::Fatal("content: truncated metadata body".into()));
        }
        let (body, trailer) = rest.split_at(body_len);
        let stored_crc = u32::from_le_bytes(trailer[..4].try_into().unwrap());
        let actual_crc = crc32fast::hash(body);
        if stored_crc != actual_crc {
            return Err(SyncError::Fatal(
                "content: CRC mismatch, metadata file is corrupt".into(),
            ));
        }

        serde_json::from_slice(body)
            .map_err(|e| SyncError::Fatal(format!("content: malformed metadata JSON: {e}")))
    }

    fn save(&self, state: &ArrayState) -> Result<(), SyncError> {
        let body = serde_json::to_vec(state)
            .map_err(|e| SyncError::Fatal(format!("content: serialize metadata: {e}")))?;
        let crc = crc32fast::hash(&body);

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp_path).map_err(|e| {
                SyncError::Fatal(format!("content: create {}: {e}", tmp_path.display()))
            })?;
            write_framed(&mut f, &body, crc)
                .map_err(|e| SyncError::Fatal(format!("content: write metadata: {e}")))?;
            f.sync_all()
                .map_err(|e| SyncError::Fatal(format!("content: fsync metadata: {e}")))?;
        }
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| SyncError::Fatal(format!("content: rename metadata into place: {e}")))?;
        Ok(())
    }
}

fn write_framed<W: Write>(w: &mut W, body: &[u8], crc: u32) -> io::Result<()> {
    w.write_u32::<LittleEndian>(body.len() as u32)?;
    w.write_all(body)?;
    w.write_u32::<LittleEndian>(crc)?;
    Ok(())
}
