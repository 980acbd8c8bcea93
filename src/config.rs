//! Run configuration: everything the sync engine consumes as input,
//! separate from the state it discovers on disk.

/// Top-level knobs for one sync run.
///
/// Grouped the way the teacher's `PackOptions` is: a flat struct of
/// primitives with a `Default` impl, no builder.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of one block, the unit the array is striped in.
    pub block_size: u32,

    /// Number of parity levels (`L`). `0` disables parity entirely.
    pub level: u32,

    /// Current hash key and seed, combined by [`crate::hash::Hasher`].
    pub hash_key: Vec<u8>,
    pub hash_seed: Vec<u8>,

    /// Previous key/seed pair, kept to validate hashes carried over from a
    /// prior run whose key has since been rotated.
    pub prev_hash_key: Vec<u8>,
    pub prev_hash_seed: Vec<u8>,

    /// Permission bits applied to newly created parity files.
    pub file_mode: u32,

    /// Byte threshold that triggers an autosave barrier.
    pub autosave: u64,

    pub opt: Options,
}

/// Secondary switches, mostly test hooks or rarely-touched behavior
/// overrides — kept apart from `Config`'s main fields the way the teacher
/// separates `PackOptions`'s common fields from its advanced ones.
#[derive(Debug, Clone)]
pub struct Options {
    /// Hash every unchanged `BLK` block before syncing, not only `CHG` ones.
    pub prehash: bool,

    /// Skip self-test/self-consistency checks that are expensive relative
    /// to their expected yield.
    pub skip_self: bool,

    /// Skip `fallocate`-style pre-sizing of parity files before writing.
    pub skip_fallocate: bool,

    /// Force a full re-hash of every block regardless of its current state.
    pub force_full: bool,

    /// Test-only hook: force an autosave exactly at this offset, in place of
    /// the byte-count trigger.
    pub force_autosave_at: Option<u32>,

    /// Maximum number of transient I/O errors tolerated before a run is
    /// escalated to fatal.
    pub io_error_limit: u32,

    /// Self-test hook: invert `ErrorLedger::is_success` so a deliberately
    /// broken fixture is expected to report errors.
    pub expect_recoverable: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            prehash: false,
            skip_self: false,
            skip_fallocate: false,
            force_full: false,
            force_autosave_at: None,
            io_error_limit: 0,
            expect_recoverable: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            block_size: 256 * 1024,
            level: 1,
            hash_key: Vec::new(),
            hash_seed: Vec::new(),
            prev_hash_key: Vec::new(),
            prev_hash_seed: Vec::new(),
            file_mode: 0o600,
            autosave: 0,
            opt: Options::default(),
        }
    }
}

impl Config {
    /// Number of full blocks that fit in `size` bytes, rounding up for a
    /// trailing partial block — matches the spec's `blockmax` computation.
    pub fn blocks_for_size(&self, size: u64) -> u32 {
        let bs = self.block_size as u64;
        ((size + bs - 1) / bs) as u32
    }
}
