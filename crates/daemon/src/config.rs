//! CLI flags plus an optional TOML config file; flags win over the file.

use std::path::{Path, PathBuf};

use chunksnap_paths::{ControlSocketPath, MetadataDevicePath, OriginDevicePath, SnapshotDataDevicePath, StoreDir};
use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Debug, Parser)]
#[command(name = "chunksnapd", version, about = "Copy-on-write block snapshot store daemon")]
pub struct Cli {
    /// Directory holding this instance's control socket, lock file and
    /// default config file.
    #[arg(long, default_value = "/var/lib/chunksnapd")]
    pub store_dir: PathBuf,

    /// TOML config file; overridden field-by-field by any CLI flag given.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initializes a fresh superblock, bitmap regions and empty root leaf
    /// on the metadata device, then exits.
    Format {
        #[command(flatten)]
        overrides: Overrides,
    },
}

#[derive(Debug, Clone, Default, clap::Args)]
pub struct Overrides {
    #[arg(long)]
    pub metadata_device: Option<PathBuf>,
    #[arg(long)]
    pub snapshot_device: Option<PathBuf>,
    #[arg(long)]
    pub origin_device: Option<PathBuf>,
    #[arg(long)]
    pub socket: Option<PathBuf>,
    #[arg(long)]
    pub chunk_size: Option<usize>,
    #[arg(long)]
    pub journal_size: Option<u64>,
    #[arg(long)]
    pub snaplock_hash_bits: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct FileConfig {
    metadata_device: Option<PathBuf>,
    snapshot_device: Option<PathBuf>,
    origin_device: Option<PathBuf>,
    socket: Option<PathBuf>,
    chunk_size: Option<usize>,
    journal_size: Option<u64>,
    snaplock_hash_bits: Option<u8>,
}

/// Fully resolved settings for one daemon instance, after merging the
/// config file (if any) with CLI overrides.
#[derive(Debug, Clone)]
pub struct Settings {
    pub store_dir: StoreDir,
    pub metadata_device: MetadataDevicePath,
    pub snapshot_device: SnapshotDataDevicePath,
    pub origin_device: OriginDevicePath,
    pub socket: ControlSocketPath,
    pub chunk_size: usize,
    pub journal_size: u64,
    pub snaplock_hash_bits: u8,
}

const DEFAULT_CHUNK_SIZE: usize = 4096;
const DEFAULT_JOURNAL_SIZE: u64 = 256;
const DEFAULT_SNAPLOCK_HASH_BITS: u8 = 8;

fn load_file_config(path: &Path) -> anyhow::Result<FileConfig> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

pub fn resolve(store_dir: PathBuf, config_path: Option<PathBuf>, overrides: Overrides) -> anyhow::Result<Settings> {
    let store_dir = StoreDir(store_dir);
    let config_path = config_path.unwrap_or_else(|| store_dir.config_file());
    let file = load_file_config(&config_path)?;

    let metadata_device = overrides
        .metadata_device
        .or(file.metadata_device)
        .ok_or_else(|| anyhow::anyhow!("--metadata-device is required (CLI flag or config file)"))?;
    let origin_device = overrides
        .origin_device
        .or(file.origin_device)
        .ok_or_else(|| anyhow::anyhow!("--origin-device is required (CLI flag or config file)"))?;
    let snapshot_device = overrides.snapshot_device.or(file.snapshot_device).unwrap_or_else(|| metadata_device.clone());
    let socket = overrides.socket.or(file.socket).unwrap_or_else(|| store_dir.default_socket().0);

    Ok(Settings {
        metadata_device: MetadataDevicePath(metadata_device),
        origin_device: OriginDevicePath(origin_device),
        snapshot_device: SnapshotDataDevicePath(snapshot_device),
        socket: ControlSocketPath(socket),
        chunk_size: overrides.chunk_size.or(file.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE),
        journal_size: overrides.journal_size.or(file.journal_size).unwrap_or(DEFAULT_JOURNAL_SIZE),
        snaplock_hash_bits: overrides
            .snaplock_hash_bits
            .or(file.snaplock_hash_bits)
            .unwrap_or(DEFAULT_SNAPLOCK_HASH_BITS),
        store_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win_over_file_defaults() {
        let file = FileConfig {
            metadata_device: Some(PathBuf::from("/dev/from-file")),
            chunk_size: Some(1024),
            ..Default::default()
        };
        let overrides = Overrides {
            metadata_device: Some(PathBuf::from("/dev/from-cli")),
            origin_device: Some(PathBuf::from("/dev/origin")),
            ..Default::default()
        };
        let metadata_device = overrides.metadata_device.clone().or(file.metadata_device.clone()).unwrap();
        assert_eq!(metadata_device, PathBuf::from("/dev/from-cli"));
        assert_eq!(overrides.chunk_size.or(file.chunk_size), Some(1024));
    }

    #[test]
    fn missing_required_device_is_an_error() {
        let store_dir = PathBuf::from("/tmp/chunksnapd-test-missing");
        let result = resolve(store_dir, None, Overrides::default());
        assert!(result.is_err());
    }
}
