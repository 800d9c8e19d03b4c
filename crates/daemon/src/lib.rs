//! `chunksnapd`: the copy-on-write block snapshot store daemon.
//!
//! [`config`] resolves CLI flags and an optional config file into
//! [`config::Settings`]; [`format`] lays down a fresh store for
//! `--format`; [`server::Server`] runs the control-socket event loop,
//! dispatching each decoded request through [`dispatch::handle`] against
//! a [`chunksnap_storage::Engine`] and a [`locktable::LockTable`].

pub mod config;
pub mod dispatch;
pub mod error;
pub mod format;
pub mod locktable;
pub mod server;
pub mod session;

use std::path::Path;

use chunksnap_fs_utils::BlockDevice;
use chunksnap_journal::{Journal, Options as JournalOptions};
use chunksnap_storage::{Engine, Superblock, SB_SECTOR};

use config::Settings;

/// Opens the devices named in `settings`, reads the existing superblock,
/// and recovers or formats the journal depending on whether the
/// superblock's busy flag was left set by an unclean shutdown.
pub fn open_engine(settings: &Settings) -> anyhow::Result<Engine> {
    let metadata_device = BlockDevice::open(&settings.metadata_device)?;
    let origin_device = BlockDevice::open(&settings.origin_device)?;
    let snapshot_device = BlockDevice::open(&settings.snapshot_device)?;

    let mut sb_bytes = vec![0u8; settings.chunk_size];
    metadata_device.read_at(&mut sb_bytes, SB_SECTOR << 9)?;
    let mut sb = Superblock::from_bytes(&sb_bytes)?;

    let was_dirty = sb.busy;
    sb.busy = true;

    let journal_opts = JournalOptions { chunk_size: settings.chunk_size, journal_size: sb.journal_size };
    let journal = if was_dirty {
        tracing::warn!("superblock was left busy, recovering journal");
        Journal::recover(journal_opts, sb.journal_base.0, &metadata_device)?
    } else {
        Journal::format(journal_opts, sb.journal_base.0)
    };

    let engine = Engine::new(sb, metadata_device, origin_device, snapshot_device, journal);
    engine.write_superblock()?;
    Ok(engine)
}

/// Installs a `tracing` subscriber writing to stderr, honoring
/// `RUST_LOG` (`info` by default).
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Starts serving `settings.socket` until a shutdown signal or
/// `SHUTDOWN_SERVER` request arrives.
pub fn run(settings: &Settings) -> anyhow::Result<()> {
    let engine = open_engine(settings)?;
    let server = server::Server::new(engine, settings.snaplock_hash_bits, Path::new(&settings.socket.0))?;
    server.run()?;
    Ok(())
}
