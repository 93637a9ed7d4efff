//! `freezefs mount <source> <mountpoint>`: scan, watch, and serve a source
//! directory as a virtual tagged-file tree.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use crate::checksum_store::{self, ChecksumStore};
use crate::config::Config;
use crate::freezetag::JsonFreezetagLoader;
use crate::freezetag_cache::FreezetagCache;
use crate::fuse_adapter::{self, FreezeFs};
use crate::index::Index;
use crate::metadata::StubMetadataParser;
use crate::read_pipeline::ReadPipeline;
use crate::watcher::{self, SourceWatcher};

#[derive(Parser, Debug)]
pub struct Cli {
    /// Directory holding content files and freezetag sidecars.
    pub source: PathBuf,

    /// Where to mount the reconstructed virtual tree.
    pub mountpoint: PathBuf,

    /// Log verbosely (equivalent to RUST_LOG=debug for this crate).
    #[arg(short, long)]
    pub verbose: bool,

    /// Path (or directory) for the persistent checksum database. Defaults
    /// to the platform cache directory.
    #[arg(long = "db")]
    pub db: Option<PathBuf>,

    /// uid reported for every virtual file. Defaults to the mounting
    /// process's effective uid.
    #[arg(long)]
    pub uid: Option<u32>,

    /// gid reported for every virtual file. Defaults to the mounting
    /// process's effective gid.
    #[arg(long)]
    pub gid: Option<u32>,

    /// Run in the foreground instead of daemonizing.
    #[arg(short, long)]
    pub foreground: bool,
}

pub fn mount(cli: Cli) -> Result<()> {
    if !cli.source.is_dir() {
        bail!("source {} is not a directory", cli.source.display());
    }

    let config = Config {
        source: cli.source.clone(),
        mountpoint: cli.mountpoint.clone(),
        uid: cli.uid.unwrap_or_else(crate::config::current_uid),
        gid: cli.gid.unwrap_or_else(crate::config::current_gid),
        verbose: cli.verbose,
        foreground: cli.foreground,
        checksum_db_path: checksum_store::resolve_db_path(cli.db.as_deref()),
    };

    if cli.foreground {
        run_mount(config, None)
    } else {
        daemonize_and_mount(config)
    }
}

/// Build the index, run the initial scan, start the watcher, and serve
/// the mount. `Index` is shared via `Arc` between the watcher thread (which
/// mutates it on every filesystem event) and the read pipeline (which
/// queries it on every FUSE callback). `signal_fd`, if given, is written to
/// from FUSE's `init()` callback once the kernel has acknowledged the
/// mount — used by `daemonize_and_mount` to know when it's safe to return
/// control to the parent process.
fn run_mount(config: Config, signal_fd: Option<i32>) -> Result<()> {
    let store = ChecksumStore::open(&config.checksum_db_path)
        .with_context(|| format!("opening checksum db {}", config.checksum_db_path.display()))?;
    let freezetag_cache = FreezetagCache::new(Arc::new(JsonFreezetagLoader));
    let index = Arc::new(Index::new(store, freezetag_cache.clone(), Arc::new(StubMetadataParser)));

    log::info!("scanning {}", config.source.display());
    watcher::initial_scan(&config.source, &index).context("initial directory scan")?;
    index.flush_checksum_store().context("flushing checksum db")?;

    let _watcher = SourceWatcher::start(&config.source, Arc::clone(&index))
        .context("starting filesystem watcher")?;

    let pipeline = ReadPipeline::new(index, freezetag_cache, config.clone());
    let fs = match signal_fd {
        Some(fd) => FreezeFs::with_signal_fd(pipeline, fd),
        None => FreezeFs::new(pipeline),
    };

    let options = fuse_adapter::mount_options(&config.mountpoint);
    log::info!("mounting {} at {}", config.source.display(), config.mountpoint.display());
    fuser::mount2(fs, &config.mountpoint, &options).with_context(|| {
        format!(
            "mounting at {} (is the fuse kernel module loaded and libfuse/fusermount3 installed?)",
            config.mountpoint.display()
        )
    })?;

    Ok(())
}

/// Daemonize via fork + pipe handshake, the same shape as the teacher's
/// `cmd_fusemount`: the parent blocks on the pipe until the child's FUSE
/// `init()` callback fires (meaning the kernel has acknowledged the
/// mount), then exits 0. `fuser::mount2` blocks for the life of the mount,
/// so the signal must come from inside the callback, not after it returns.
fn daemonize_and_mount(config: Config) -> Result<()> {
    let mut pipe_fds = [0i32; 2];
    if unsafe { libc::pipe(pipe_fds.as_mut_ptr()) } != 0 {
        bail!("pipe() failed");
    }

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        bail!("fork() failed");
    }

    if pid > 0 {
        unsafe { libc::close(pipe_fds[1]) };
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(pipe_fds[0], buf.as_mut_ptr() as *mut _, 1) };
        unsafe { libc::close(pipe_fds[0]) };

        if n == 1 && buf[0] == 0 {
            return Ok(());
        }
        let mut status = 0i32;
        unsafe { libc::waitpid(pid, &mut status, 0) };
        bail!("FUSE mount failed in child process");
    }

    unsafe {
        libc::close(pipe_fds[0]);
        libc::setsid();
    }

    if let Err(e) = run_mount(config, Some(pipe_fds[1])) {
        log::error!("mount failed: {e}");
        std::process::exit(1);
    }
    std::process::exit(0);
}
