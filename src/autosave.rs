//! Periodic durability barrier: fsync every parity file, then snapshot
//! metadata, so a crash mid-run never loses more than one autosave
//! interval's worth of work.

/// Tracks bytes written since the last checkpoint and decides when the
/// engine must pause to fsync + snapshot.
pub struct Autosaver {
    limit: u64,
    force_at: Option<u32>,
    written_since_save: u64,
}

impl Autosaver {
    pub fn new(limit: u64, force_at: Option<u32>) -> Self {
        Autosaver {
            limit,
            force_at,
            written_since_save: 0,
        }
    }

    pub fn note_progress(&mut self, bytes: u64) {
        self.written_since_save += bytes;
    }

    /// True when either the byte-count threshold was crossed with enough
    /// blocks remaining to make an autosave worthwhile, or the test hook
    /// `force_autosave_at` names this offset.
    pub fn should_trigger(&self, offset: u32, remaining_blocks: u32) -> bool {
        if self.force_at == Some(offset) {
            return true;
        }
        if self.limit == 0 {
            return false;
        }
        self.written_since_save >= self.limit && remaining_blocks as u64 >= self.limit
    }

    pub fn reset(&mut self) {
        self.written_since_save = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn force_at_overrides_byte_threshold() {
        let a = Autosaver::new(0, Some(5));
        assert!(a.should_trigger(5, 100));
        assert!(!a.should_trigger(4, 100));
    }

    #[test]
    fn byte_threshold_needs_enough_remaining_blocks() {
        let mut a = Autosaver::new(10, None);
        a.note_progress(10);
        assert!(!a.should_trigger(0, 2));
        assert!(a.should_trigger(0, 20));
    }
}
