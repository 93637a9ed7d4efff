//! Mount-time configuration: the values read once at startup and threaded
//! through the read pipeline and FUSE adapter for the life of the mount.

use std::path::PathBuf;

/// Resolved configuration for a single mount. Distinct from the raw CLI
/// arguments in `commands::mount`, which may be partial (`Option`s with
/// process-default fallbacks still to apply).
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory being fused into a virtual tree.
    pub source: PathBuf,
    pub mountpoint: PathBuf,
    /// uid/gid reported for every virtual file; defaults to the mounting
    /// process's own ids.
    pub uid: u32,
    pub gid: u32,
    pub verbose: bool,
    pub foreground: bool,
    pub checksum_db_path: PathBuf,
}

impl Config {
    #[cfg(test)]
    pub fn for_test() -> Self {
        Config {
            source: PathBuf::from("/nonexistent-source"),
            mountpoint: PathBuf::from("/nonexistent-mountpoint"),
            uid: current_uid(),
            gid: current_gid(),
            verbose: false,
            foreground: true,
            checksum_db_path: std::env::temp_dir().join("freezefs-test.db"),
        }
    }
}

/// Effective uid of the mounting process, used as the default for virtual
/// files when `--uid` is not given.
pub fn current_uid() -> u32 {
    unsafe { libc::geteuid() }
}

pub fn current_gid() -> u32 {
    unsafe { libc::getegid() }
}
