//! End-to-end sync scenarios over tempfile-backed disks, covering the
//! universal invariants and the `D=2, L=1, block_size=4` literal scenarios.

use parisync::{
    ArrayState, Block, BlockState, Config, ContentStore, Disk, FileId, FileRecord, HashPass,
    Hasher, JsonContentStore, ParityHandle, RaidCodec, SyncEngine,
};
use std::fs;
use std::path::Path;

const BLOCK_SIZE: u32 = 4;

struct Fixture {
    _dir: tempfile::TempDir,
    config: Config,
    hasher: Hasher,
    raid: RaidCodec,
    parity: Vec<ParityHandle>,
    store: JsonContentStore,
    state: ArrayState,
}

fn stat_of(path: &Path) -> (u64, i64, u32, u64) {
    use std::os::unix::fs::MetadataExt;
    let m = fs::metadata(path).unwrap();
    (m.size(), m.mtime(), m.mtime_nsec() as u32, m.ino())
}

/// Build a two-data-disk, one-parity-level array with file `a` on disk 0
/// and file `b` on disk 1, both state `BLK`, parity consistent with their
/// current content — the S1 baseline, reused and mutated by later tests.
fn clean_fixture(content_a: &[u8], content_b: &[u8]) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path_a = dir.path().join("a");
    let path_b = dir.path().join("b");
    fs::write(&path_a, content_a).unwrap();
    fs::write(&path_b, content_b).unwrap();

    let (size_a, mtime_a, nsec_a, ino_a) = stat_of(&path_a);
    let (size_b, mtime_b, nsec_b, ino_b) = stat_of(&path_b);

    let mut state = ArrayState::new(
        BLOCK_SIZE,
        vec![
            Disk { name: "disk0".into(), mount_point: dir.path().to_string_lossy().into() },
            Disk { name: "disk1".into(), mount_point: dir.path().to_string_lossy().into() },
        ],
    );
    state.files.push(FileRecord {
        disk: parisync::DiskId(0),
        path: path_a.to_string_lossy().into(),
        size: size_a,
        mtime_sec: mtime_a,
        mtime_nsec: nsec_a,
        inode: ino_a,
        flags: 0,
    });
    state.files.push(FileRecord {
        disk: parisync::DiskId(1),
        path: path_b.to_string_lossy().into(),
        size: size_b,
        mtime_sec: mtime_b,
        mtime_nsec: nsec_b,
        inode: ino_b,
        flags: 0,
    });
    state.grow_to(1);

    let config = Config { block_size: BLOCK_SIZE, level: 1, ..Config::default() };
    let hasher = Hasher::new(&config.hash_key, &config.hash_seed, &config.prev_hash_key, &config.prev_hash_seed);
    let raid = RaidCodec::new(2, 1);

    let hash_a = hasher.hash(parisync::HashKey::Current, content_a);
    let hash_b = hasher.hash(parisync::HashKey::Current, content_b);
    state.blocks[0][0] = Block { file: FileId(0), file_pos: 0, state: BlockState::Blk, hash: hash_a };
    state.blocks[1][0] = Block { file: FileId(1), file_pos: 0, state: BlockState::Blk, hash: hash_b };

    let parity_path = dir.path().join("parity.0");
    let mut handle = ParityHandle::open(&parity_path, BLOCK_SIZE, 0o600).unwrap();
    handle.resize(1).unwrap();
    let strips = raid.gen(&[content_a, content_b]).unwrap();
    handle.write_strip(0, &strips[0]).unwrap();
    handle.sync().unwrap();

    let content_path = dir.path().join("content.bin");
    let store = JsonContentStore::new(&content_path);
    store.save(&state).unwrap();

    Fixture { _dir: dir, config, hasher, raid, parity: vec![handle], store, state }
}

#[test]
fn s1_clean_blk_is_a_no_op() {
    let mut f = clean_fixture(b"AAAA", b"BBBB");
    let before = f.state.clone();

    let mut engine = SyncEngine::new(&f.config, &f.hasher, &f.raid, &mut f.parity, &f.store);
    let outcome = engine.sync(&mut f.state, 0, 1).unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.ledger.total(), 0);
    assert_eq!(before.blocks, f.state.blocks);
}

#[test]
fn s2_chg_block_triggers_parity_rewrite() {
    let mut f = clean_fixture(b"AAAA", b"BBBB");
    fs::write(f._dir.path().join("a"), b"CCCC").unwrap();
    let (size, mtime, nsec, ino) = stat_of(&f._dir.path().join("a"));
    f.state.files[0].size = size;
    f.state.files[0].mtime_sec = mtime;
    f.state.files[0].mtime_nsec = nsec;
    f.state.files[0].inode = ino;
    f.state.blocks[0][0].state = BlockState::Chg;

    let mut engine = SyncEngine::new(&f.config, &f.hasher, &f.raid, &mut f.parity, &f.store);
    let outcome = engine.sync(&mut f.state, 0, 1).unwrap();

    assert!(outcome.success);
    assert_eq!(f.state.blocks[0][0].state, BlockState::Blk);
    assert_eq!(f.state.blocks[0][0].hash, f.hasher.hash(parisync::HashKey::Current, b"CCCC"));

    let mut strip = [0u8; BLOCK_SIZE as usize];
    f.parity[0].read_strip(0, &mut strip).unwrap();
    let expected = f.raid.gen(&[b"CCCC", b"BBBB"]).unwrap();
    assert_eq!(&strip[..], &expected[0][..]);
}

#[test]
fn s3_silent_corruption_is_recovered() {
    let mut f = clean_fixture(b"AAAA", b"BBBB");
    // Corrupt disk0's bytes on disk without updating its recorded hash:
    // the stored BLK hash still claims "AAAA" happened.
    fs::write(f._dir.path().join("a"), b"ZZZZ").unwrap();

    let mut engine = SyncEngine::new(&f.config, &f.hasher, &f.raid, &mut f.parity, &f.store);
    let outcome = engine.sync(&mut f.state, 0, 1).unwrap();

    assert_eq!(outcome.ledger.silent_error, 1);
    assert!(f.state.info.get(0).bad);

    // Parity is rewritten from the reconstructed buffer even though its
    // value is unchanged from before the corruption.
    let mut strip = [0u8; BLOCK_SIZE as usize];
    f.parity[0].read_strip(0, &mut strip).unwrap();
    let expected = f.raid.gen(&[b"AAAA", b"BBBB"]).unwrap();
    assert_eq!(&strip[..], &expected[0][..]);
}

#[test]
fn s4_concurrent_modification_is_flagged_and_skipped() {
    let mut f = clean_fixture(b"AAAA", b"BBBB");
    // Grow the file without updating the recorded stat: simulates a write
    // racing the scan that produced the metadata snapshot.
    fs::write(f._dir.path().join("a"), b"AAAAAAAA").unwrap();

    let mut engine = SyncEngine::new(&f.config, &f.hasher, &f.raid, &mut f.parity, &f.store);
    let outcome = engine.sync(&mut f.state, 0, 1).unwrap();

    assert!(outcome.ledger.file_error >= 1);
    assert!(!outcome.success);

    let mut strip = [0u8; BLOCK_SIZE as usize];
    f.parity[0].read_strip(0, &mut strip).unwrap();
    let original = f.raid.gen(&[b"AAAA", b"BBBB"]).unwrap();
    assert_eq!(&strip[..], &original[0][..]);
}

#[test]
fn double_failure_is_recovered_with_two_parity_levels() {
    let dir = tempfile::tempdir().unwrap();
    let contents: [&[u8]; 3] = [b"AAAA", b"BBBB", b"CCCC"];
    let paths: Vec<_> = ["a", "b", "c"].iter().map(|n| dir.path().join(n)).collect();
    for (p, c) in paths.iter().zip(contents.iter()) {
        fs::write(p, c).unwrap();
    }

    let mut state = ArrayState::new(
        BLOCK_SIZE,
        (0..3)
            .map(|i| Disk { name: format!("disk{i}"), mount_point: dir.path().to_string_lossy().into() })
            .collect(),
    );
    for (i, p) in paths.iter().enumerate() {
        let (size, mtime, nsec, ino) = stat_of(p);
        state.files.push(FileRecord {
            disk: parisync::DiskId(i),
            path: p.to_string_lossy().into(),
            size,
            mtime_sec: mtime,
            mtime_nsec: nsec,
            inode: ino,
            flags: 0,
        });
    }
    state.grow_to(1);

    let config = Config { block_size: BLOCK_SIZE, level: 2, ..Config::default() };
    let hasher = Hasher::new(&config.hash_key, &config.hash_seed, &config.prev_hash_key, &config.prev_hash_seed);
    let raid = RaidCodec::new(3, 2);

    for (i, c) in contents.iter().enumerate() {
        let hash = hasher.hash(parisync::HashKey::Current, c);
        state.blocks[i][0] = Block { file: FileId(i), file_pos: 0, state: BlockState::Blk, hash };
    }

    let strips = raid.gen(&contents).unwrap();
    let mut parity = Vec::new();
    for (l, strip) in strips.iter().enumerate() {
        let mut h = ParityHandle::open(dir.path().join(format!("parity.{l}")), BLOCK_SIZE, 0o600).unwrap();
        h.resize(1).unwrap();
        h.write_strip(0, strip).unwrap();
        h.sync().unwrap();
        parity.push(h);
    }

    let store = JsonContentStore::new(dir.path().join("content.bin"));
    store.save(&state).unwrap();

    // Corrupt two of the three data disks in place; their recorded BLK
    // hashes still reflect the original content.
    fs::write(&paths[0], b"ZZZZ").unwrap();
    fs::write(&paths[1], b"YYYY").unwrap();

    let mut engine = SyncEngine::new(&config, &hasher, &raid, &mut parity, &store);
    let outcome = engine.sync(&mut state, 0, 1).unwrap();

    assert_eq!(outcome.ledger.silent_error, 2);
    assert!(state.info.get(0).bad);
}

#[test]
fn s5_prehash_verifies_chg_before_sync_touches_parity() {
    let mut f = clean_fixture(b"AAAA", b"BBBB");
    fs::write(f._dir.path().join("a"), b"CCCC").unwrap();
    let (size, mtime, nsec, ino) = stat_of(&f._dir.path().join("a"));
    f.state.files[0].size = size;
    f.state.files[0].mtime_sec = mtime;
    f.state.files[0].mtime_nsec = nsec;
    f.state.files[0].inode = ino;
    f.state.blocks[0][0].state = BlockState::Chg;

    let mut prehash_ledger = parisync::ErrorLedger::new();
    let pass = HashPass::new(&f.hasher, BLOCK_SIZE);
    let outcome = pass.run(&mut f.state, 0, &mut prehash_ledger);

    assert!(!outcome.skip_sync);
    assert_eq!(outcome.blocks_hashed, 1);
    assert_eq!(f.state.blocks[0][0].state, BlockState::Rep);
    assert_eq!(f.state.blocks[0][0].hash, f.hasher.hash(parisync::HashKey::Current, b"CCCC"));

    // The hash pass never touched parity: it's still consistent with the
    // pre-change content until the sync phase actually runs.
    let mut strip = [0u8; BLOCK_SIZE as usize];
    f.parity[0].read_strip(0, &mut strip).unwrap();
    let original = f.raid.gen(&[b"AAAA", b"BBBB"]).unwrap();
    assert_eq!(&strip[..], &original[0][..]);

    // Now the sync phase sees a REP block with an already-verified hash:
    // it matches the on-disk content, so no further reconciliation needed,
    // but parity is still stale (REP has invalid parity) so it's rewritten.
    let mut engine = SyncEngine::new(&f.config, &f.hasher, &f.raid, &mut f.parity, &f.store);
    let sync_outcome = engine.sync(&mut f.state, 0, 1).unwrap();

    assert!(sync_outcome.success);
    assert_eq!(f.state.blocks[0][0].state, BlockState::Blk);
    f.parity[0].read_strip(0, &mut strip).unwrap();
    let updated = f.raid.gen(&[b"CCCC", b"BBBB"]).unwrap();
    assert_eq!(&strip[..], &updated[0][..]);
}

#[test]
fn sync_engine_runs_prehash_itself_when_configured() {
    // Unlike `s5_prehash_verifies_chg_before_sync_touches_parity`, this
    // drives `config.opt.prehash` through `SyncEngine::sync` directly,
    // without calling `HashPass` by hand, the way `main.rs`'s `--prehash`
    // flag does.
    let mut f = clean_fixture(b"AAAA", b"BBBB");
    fs::write(f._dir.path().join("a"), b"CCCC").unwrap();
    let (size, mtime, nsec, ino) = stat_of(&f._dir.path().join("a"));
    f.state.files[0].size = size;
    f.state.files[0].mtime_sec = mtime;
    f.state.files[0].mtime_nsec = nsec;
    f.state.files[0].inode = ino;
    f.state.blocks[0][0].state = BlockState::Chg;
    f.config.opt.prehash = true;

    let mut engine = SyncEngine::new(&f.config, &f.hasher, &f.raid, &mut f.parity, &f.store);
    let outcome = engine.sync(&mut f.state, 0, 1).unwrap();

    assert!(outcome.success);
    assert_eq!(f.state.blocks[0][0].state, BlockState::Blk);
    assert_eq!(f.state.blocks[0][0].hash, f.hasher.hash(parisync::HashKey::Current, b"CCCC"));

    let mut strip = [0u8; BLOCK_SIZE as usize];
    f.parity[0].read_strip(0, &mut strip).unwrap();
    let updated = f.raid.gen(&[b"CCCC", b"BBBB"]).unwrap();
    assert_eq!(&strip[..], &updated[0][..]);
}

#[test]
fn s6_autosave_fires_at_forced_offset_and_persists_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let blockmax = 10u32;
    let contents_a: Vec<u8> = (0..blockmax).flat_map(|_| *b"AAAA").collect();
    let contents_b: Vec<u8> = (0..blockmax).flat_map(|_| *b"BBBB").collect();
    let path_a = dir.path().join("a");
    let path_b = dir.path().join("b");
    fs::write(&path_a, &contents_a).unwrap();
    fs::write(&path_b, &contents_b).unwrap();

    let (size_a, mtime_a, nsec_a, ino_a) = stat_of(&path_a);
    let (size_b, mtime_b, nsec_b, ino_b) = stat_of(&path_b);

    let mut state = ArrayState::new(
        BLOCK_SIZE,
        vec![
            Disk { name: "disk0".into(), mount_point: dir.path().to_string_lossy().into() },
            Disk { name: "disk1".into(), mount_point: dir.path().to_string_lossy().into() },
        ],
    );
    state.files.push(FileRecord {
        disk: parisync::DiskId(0),
        path: path_a.to_string_lossy().into(),
        size: size_a,
        mtime_sec: mtime_a,
        mtime_nsec: nsec_a,
        inode: ino_a,
        flags: 0,
    });
    state.files.push(FileRecord {
        disk: parisync::DiskId(1),
        path: path_b.to_string_lossy().into(),
        size: size_b,
        mtime_sec: mtime_b,
        mtime_nsec: nsec_b,
        inode: ino_b,
        flags: 0,
    });
    state.grow_to(blockmax);

    let mut config = Config { block_size: BLOCK_SIZE, level: 1, ..Config::default() };
    config.opt.force_autosave_at = Some(5);
    let hasher = Hasher::new(&config.hash_key, &config.hash_seed, &config.prev_hash_key, &config.prev_hash_seed);
    let raid = RaidCodec::new(2, 1);

    // Every block is CHG: a full initial sync.
    for i in 0..blockmax {
        state.blocks[0][i as usize] = Block { file: FileId(0), file_pos: i, state: BlockState::Chg, hash: [0u8; 16] };
        state.blocks[1][i as usize] = Block { file: FileId(1), file_pos: i, state: BlockState::Chg, hash: [0u8; 16] };
    }

    let parity_path = dir.path().join("parity.0");
    let mut handle = ParityHandle::open(&parity_path, BLOCK_SIZE, 0o600).unwrap();
    handle.resize(blockmax).unwrap();
    let mut parity = vec![handle];

    let content_path = dir.path().join("content.bin");
    let store = JsonContentStore::new(&content_path);
    store.save(&state).unwrap();

    let mut engine = SyncEngine::new(&config, &hasher, &raid, &mut parity, &store);
    let outcome = engine.sync(&mut state, 0, blockmax).unwrap();
    assert!(outcome.success);
    // The full run completed in memory: every offset reached BLK.
    for i in 0..blockmax {
        assert_eq!(state.blocks[0][i as usize].state, BlockState::Blk);
    }

    // But the forced autosave at offset 5 is the only point the run wrote
    // metadata to disk (the run's own final `sync()` durabilizes parity,
    // not metadata — the caller snapshots that separately, as `main.rs`
    // does after every `sync()` call). A crash right after offset 5 would
    // leave exactly that prefix consistent on disk.
    let reloaded = store.load().unwrap();
    assert_eq!(reloaded.blockmax, blockmax);
    for i in 0..=5 {
        assert_eq!(reloaded.blocks[0][i as usize].state, BlockState::Blk, "offset {i} should be durable");
    }
    for i in 6..blockmax {
        assert_eq!(reloaded.blocks[0][i as usize].state, BlockState::Chg, "offset {i} not yet autosaved");
    }
}
