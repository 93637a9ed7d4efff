//! Reconstructs tagged music files on demand by fusing stripped-audio
//! content files with freezetag metadata sidecars, served read-only
//! through a FUSE mount.

mod checksum;
mod checksum_store;
mod commands;
mod config;
mod freezetag;
mod freezetag_cache;
mod fuse_adapter;
mod index;
mod lru;
mod metadata;
mod read_pipeline;
mod watcher;

use std::process::ExitCode;

use clap::Parser;

fn main() -> ExitCode {
    let cli = commands::Cli::parse();

    let commands::Subcommands::Mount(mount_cli) = cli.subcommands;

    let default_level = if mount_cli.verbose { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::new().filter_level(default_level).parse_default_env().init();

    let result = commands::mount(mount_cli);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("freezefs: {e:#}");
            ExitCode::FAILURE
        }
    }
}
