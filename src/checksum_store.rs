//! Durable `(device, inode, mtime) -> checksum record` cache, so a restart
//! doesn't have to re-parse every unchanged content file.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::checksum::Checksum;
use crate::metadata::MetadataLayout;

/// Key identifying a content file's on-disk identity at the time it was
/// last parsed. Mtime is stored with whatever precision the host exposes
/// (whole seconds, via `st_mtime`); equality is bitwise on this tuple.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
    pub mtime: i64,
}

impl FileKey {
    pub fn of_metadata(meta: &fs::Metadata) -> Self {
        FileKey { dev: meta.dev(), ino: meta.ino(), mtime: meta.mtime() }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct CachedRecord {
    pub checksum: Checksum,
    pub stripped_metadata_layout: MetadataLayout,
}

/// Flat-file, JSON-serialized `(dev, ino, mtime) -> CachedRecord` map.
///
/// Loaded fully into memory on construction. Not internally locked: callers
/// serialize access via the index lock, per the concurrency contract.
pub struct ChecksumStore {
    path: PathBuf,
    records: HashMap<FileKey, CachedRecord>,
    dirty: bool,
}

impl ChecksumStore {
    /// Open (or create) the store at `path`. A missing or unreadable file
    /// starts an empty store rather than failing — a corrupt cache should
    /// never block a mount, only cost a re-parse.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating checksum db directory {}", parent.display()))?;
        }

        let records = match fs::read(&path) {
            Ok(data) if !data.is_empty() => {
                let entries: Vec<(FileKey, CachedRecord)> =
                    serde_json::from_slice(&data).unwrap_or_else(|e| {
                        log::warn!("checksum db at {} is corrupt ({e}), starting fresh", path.display());
                        Vec::new()
                    });
                entries.into_iter().collect()
            }
            _ => HashMap::new(),
        };

        Ok(ChecksumStore { path, records, dirty: false })
    }

    pub fn get(&self, key: FileKey) -> Option<&CachedRecord> {
        self.records.get(&key)
    }

    pub fn put(&mut self, key: FileKey, record: CachedRecord) {
        self.records.insert(key, record);
        self.dirty = true;
    }

    /// Make all prior writes durable. Writes to a temp file in the same
    /// directory and renames over the destination, so a crash mid-write
    /// never leaves a truncated or corrupt database behind.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        // serde_json map keys must be strings or primitives; `FileKey` is a
        // struct, so the on-disk form is a plain entry list instead of a map.
        let entries: Vec<(&FileKey, &CachedRecord)> = self.records.iter().collect();
        let data = serde_json::to_vec(&entries).context("serializing checksum db")?;
        let tmp_path = self.path.with_extension("db.tmp");
        fs::write(&tmp_path, &data)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), self.path.display()))?;

        self.dirty = false;
        Ok(())
    }
}

/// Default platform-user cache location: `<cache_dir>/freezefs/freezefs.db`.
/// If `db_path` names a directory, the default filename is appended.
pub fn resolve_db_path(db_path: Option<&Path>) -> PathBuf {
    match db_path {
        Some(p) if p.is_dir() => p.join("freezefs.db"),
        Some(p) => p.to_path_buf(),
        None => dirs_next::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("freezefs")
            .join("freezefs.db"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir()
                .join(format!("freezefs-checksum-store-{}-{}-{}", std::process::id(), name, ts));
            fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for TestTempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    fn sample_record() -> CachedRecord {
        CachedRecord {
            checksum: Checksum::of(b"abc"),
            stripped_metadata_layout: Vec::new(),
        }
    }

    #[test]
    fn get_is_pure_function_of_key() {
        let dir = TestTempDir::new("pure-key");
        let db = dir.path().join("freezefs.db");
        let mut store = ChecksumStore::open(&db).unwrap();

        let key = FileKey { dev: 1, ino: 2, mtime: 100 };
        store.put(key, sample_record());

        assert!(store.get(key).is_some());
        assert!(store.get(FileKey { dev: 1, ino: 2, mtime: 101 }).is_none());
        assert!(store.get(FileKey { dev: 1, ino: 3, mtime: 100 }).is_none());
        assert!(store.get(FileKey { dev: 2, ino: 2, mtime: 100 }).is_none());
    }

    #[test]
    fn survives_restart_after_flush() {
        let dir = TestTempDir::new("restart");
        let db = dir.path().join("freezefs.db");
        let key = FileKey { dev: 5, ino: 6, mtime: 7 };

        {
            let mut store = ChecksumStore::open(&db).unwrap();
            store.put(key, sample_record());
            store.flush().unwrap();
        }

        let store = ChecksumStore::open(&db).unwrap();
        assert_eq!(store.get(key).unwrap().checksum, Checksum::of(b"abc"));
    }

    #[test]
    fn missing_db_starts_empty() {
        let dir = TestTempDir::new("missing");
        let db = dir.path().join("does-not-exist.db");
        let store = ChecksumStore::open(&db).unwrap();
        assert!(store.get(FileKey { dev: 0, ino: 0, mtime: 0 }).is_none());
    }

    #[test]
    fn resolve_db_path_appends_default_filename_for_dir() {
        let dir = TestTempDir::new("resolve-dir");
        let resolved = resolve_db_path(Some(dir.path()));
        assert_eq!(resolved, dir.path().join("freezefs.db"));
    }

    #[test]
    fn resolve_db_path_uses_file_path_directly() {
        let explicit = PathBuf::from("/tmp/custom.db");
        assert_eq!(resolve_db_path(Some(&explicit)), explicit);
    }
}
