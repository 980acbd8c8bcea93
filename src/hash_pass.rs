//! Optional pre-phase: compute/verify hashes of `CHG` blocks by reading
//! data only, before any parity is touched, so an I/O failure here aborts
//! the whole sync up front rather than partway through a parity rewrite.

use std::collections::HashMap;

use crate::content::{ArrayState, Block, BlockState, DiskId};
use crate::errors::{ErrorLedger, IoFault};
use crate::handle::DataHandle;
use crate::hash::{HashKey, Hasher};

pub struct HashPass<'a> {
    hasher: &'a Hasher,
    block_size: u32,
}

/// Outcome of running the pre-phase: whether the caller may proceed into
/// the sync phase at all.
pub struct HashPassOutcome {
    pub skip_sync: bool,
    pub blocks_hashed: u32,
}

impl<'a> HashPass<'a> {
    pub fn new(hasher: &'a Hasher, block_size: u32) -> Self {
        HashPass { hasher, block_size }
    }

    /// Run the pre-phase over `[blockstart, blockmax)`, mutating `state`
    /// in place and folding counters into `ledger`.
    pub fn run(
        &self,
        state: &mut ArrayState,
        blockstart: u32,
        ledger: &mut ErrorLedger,
    ) -> HashPassOutcome {
        let mut open_handles: HashMap<(DiskId, usize), DataHandle> = HashMap::new();
        let mut blocks_hashed = 0;

        for i in blockstart..state.blockmax {
            for d in 0..state.disk_count() {
                let disk = DiskId(d);
                let needs_hash = {
                    let b = &state.blocks[d][i as usize];
                    b.state == BlockState::Chg
                };
                if !needs_hash {
                    continue;
                }

                let file_id = state.blocks[d][i as usize].file.0;
                if file_id == usize::MAX {
                    continue;
                }
                let rec = state.files[file_id].clone();
                let path = std::path::PathBuf::from(&rec.path);

                let handle = match open_handles.entry((disk, file_id)) {
                    std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                    std::collections::hash_map::Entry::Vacant(e) => match DataHandle::open(&path) {
                        Ok(h) => e.insert(h),
                        Err(fault) => {
                            if is_concurrent_fault(&fault) {
                                ledger.record_file_error();
                                continue;
                            }
                            ledger.record_io_error();
                            return HashPassOutcome {
                                skip_sync: true,
                                blocks_hashed,
                            };
                        }
                    },
                };

                if handle.check_unchanged(&rec, i).is_err() {
                    ledger.record_file_error();
                    continue;
                }

                let mut buf = vec![0u8; self.block_size as usize];
                let block_offset = state.blocks[d][i as usize].file_pos;
                match handle.read_block(block_offset, self.block_size, &mut buf) {
                    Ok(()) => {}
                    Err(fault) if is_concurrent_fault(&fault) => {
                        ledger.record_file_error();
                        continue;
                    }
                    Err(_) => {
                        ledger.record_io_error();
                        return HashPassOutcome {
                            skip_sync: true,
                            blocks_hashed,
                        };
                    }
                }

                let info = state.info.get(i);
                let key = if info.rehash { HashKey::Previous } else { HashKey::Current };
                let digest = self.hasher.hash(key, &buf);

                let b: &mut Block = &mut state.blocks[d][i as usize];
                b.hash = digest;
                b.state = BlockState::Rep;
                blocks_hashed += 1;
            }
        }

        HashPassOutcome {
            skip_sync: false,
            blocks_hashed,
        }
    }
}

fn is_concurrent_fault(fault: &IoFault) -> bool {
    matches!(fault, IoFault::NotFound(_) | IoFault::Permission(_))
}
