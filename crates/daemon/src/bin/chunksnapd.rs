//! `chunksnapd`: runs the snapshot store daemon, or formats one with
//! `chunksnapd format`.

use clap::Parser;

use chunksnap_daemon::config::{Cli, Command};
use chunksnap_daemon::{config, format, run};
use chunksnap_fs_utils::LockFile;
use chunksnap_paths::StoreDir;

fn main() -> anyhow::Result<()> {
    chunksnap_daemon::init_logging();
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Format { overrides }) => {
            let settings = config::resolve(cli.store_dir, cli.config, overrides)?;
            format::run(&settings)
        }
        None => {
            let store_dir = StoreDir(cli.store_dir.clone());
            store_dir.create()?;
            let _lock = LockFile::acquire(&store_dir.lock_file())?;

            let settings = config::resolve(cli.store_dir, cli.config, cli.overrides)?;
            tracing::info!(socket = %settings.socket, "starting chunksnapd");
            run(&settings)
        }
    }
}
