use clap::{Parser, Subcommand};
use parisync::{Config, ContentStore, Hasher, JsonContentStore, ParityHandle, RaidCodec, SyncEngine};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "parisync", version = "1.0.0", about = "Sync core for a snapshot-style parity array")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring parity into consistency with the current contents of the data disks
    Sync {
        manifest: PathBuf,
        /// Hash CHG blocks before touching parity
        #[arg(long)]
        prehash: bool,
        /// Test hook: force an autosave at this offset
        #[arg(long)]
        force_autosave_at: Option<u32>,
        #[arg(long, default_value = "0")]
        io_error_limit: u32,
    },
    /// Report bad blocks recorded by the last sync
    Status {
        manifest: PathBuf,
    },
}

/// On-disk description of one array: wired together here rather than by
/// the engine, which only ever sees `Config` + `ArrayState` + open handles.
#[derive(Deserialize)]
struct Manifest {
    content_path: PathBuf,
    parity_paths: Vec<PathBuf>,
    block_size: u32,
    #[serde(default)]
    hash_key: String,
    #[serde(default)]
    hash_seed: String,
    #[serde(default)]
    prev_hash_key: String,
    #[serde(default)]
    prev_hash_seed: String,
    #[serde(default)]
    autosave: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        // ── Sync ─────────────────────────────────────────────────────────────
        Commands::Sync { manifest, prehash, force_autosave_at, io_error_limit } => {
            let m = load_manifest(&manifest)?;
            let store = JsonContentStore::new(&m.content_path);
            let mut state = store.load()?;

            let mut config = Config {
                block_size: m.block_size,
                level: m.parity_paths.len() as u32,
                hash_key: m.hash_key.into_bytes(),
                hash_seed: m.hash_seed.into_bytes(),
                prev_hash_key: m.prev_hash_key.into_bytes(),
                prev_hash_seed: m.prev_hash_seed.into_bytes(),
                autosave: m.autosave,
                ..Config::default()
            };
            config.opt.prehash = prehash;
            config.opt.force_autosave_at = force_autosave_at;
            config.opt.io_error_limit = io_error_limit;

            let hasher = Hasher::new(&config.hash_key, &config.hash_seed, &config.prev_hash_key, &config.prev_hash_seed);
            let raid = RaidCodec::new(state.disk_count(), m.parity_paths.len());

            let mut parity_handles: Vec<ParityHandle> = m
                .parity_paths
                .iter()
                .map(|p| ParityHandle::open(p, config.block_size, config.file_mode))
                .collect::<Result<_, _>>()?;
            for h in parity_handles.iter_mut() {
                h.resize(state.blockmax)?;
            }

            let success = {
                let mut engine = SyncEngine::new(&config, &hasher, &raid, &mut parity_handles, &store);
                let outcome = engine.sync(&mut state, 0, state.blockmax)?;
                println!("── sync complete ────────────────────────────────────────");
                println!("  blocks processed: {}", state.blockmax);
                println!("  {}", outcome.ledger.user_summary());
                outcome.success
            };
            store.save(&state)?;
            if !success {
                std::process::exit(1);
            }
        }

        // ── Status ───────────────────────────────────────────────────────────
        Commands::Status { manifest } => {
            let m = load_manifest(&manifest)?;
            let store = JsonContentStore::new(&m.content_path);
            let state = store.load()?;

            let bad: Vec<u32> = (0..state.blockmax)
                .filter(|&i| state.info.get(i).bad)
                .collect();

            println!("── array status ─────────────────────────────────────────");
            println!("  archive id:   {}", state.archive_id);
            println!("  disks:        {}", state.disk_count());
            println!("  blockmax:     {}", state.blockmax);
            println!("  bad offsets:  {}", bad.len());
            for i in bad.iter().take(20) {
                println!("    [{i}]");
            }
            if bad.len() > 20 {
                println!("    ... and {} more", bad.len() - 20);
            }
        }
    }

    Ok(())
}

fn load_manifest(path: &PathBuf) -> Result<Manifest, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
