//! Freezetag sidecar records: the (out-of-scope) on-disk reader interface
//! plus a concrete JSON-backed implementation.
//!
//! A freezetag is a small record that, for a logical album "root", lists
//! for each member file its relative path, raw-content checksum, and the
//! metadata byte blocks needed to reconstruct the original tagged file.

use std::path::Path;

use anyhow::{Context, Result};

use crate::checksum::Checksum;
use crate::metadata::MetadataLayout;

/// One member file inside a freezetag's file list.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct FreezetagFile {
    /// Path relative to the freezetag's `root`.
    pub path: String,
    pub checksum: Checksum,
    pub metadata: MetadataLayout,
}

/// A fully parsed freezetag sidecar.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct FreezetagRecord {
    /// Relative path string; first path component of every virtual path
    /// this freezetag mounts under.
    pub root: String,
    pub files: Vec<FreezetagFile>,
}

/// Stateless function over a freezetag file: parse it into a structured
/// record. The concrete on-disk format is an external collaborator per
/// scope; this crate resolves it to JSON (see [`JsonFreezetagLoader`]).
pub trait FreezetagLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<FreezetagRecord>;
}

/// Default loader: a freezetag (`.ftag`) file is a JSON document shaped
/// like [`FreezetagRecord`].
pub struct JsonFreezetagLoader;

impl FreezetagLoader for JsonFreezetagLoader {
    fn load(&self, path: &Path) -> Result<FreezetagRecord> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading freezetag {}", path.display()))?;
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing freezetag {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: std::path::PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir()
                .join(format!("freezefs-freezetag-{}-{}-{}", std::process::id(), name, ts));
            std::fs::create_dir_all(&path).unwrap();
            Self { path }
        }

        fn path(&self) -> &std::path::Path {
            &self.path
        }
    }

    impl Drop for TestTempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn loads_well_formed_freezetag() {
        let dir = TestTempDir::new("load-ok");
        let ftag_path = dir.path().join("Album.ftag");
        let record = FreezetagRecord {
            root: "Album".to_string(),
            files: vec![FreezetagFile {
                path: "01.flac".to_string(),
                checksum: Checksum::of(b"content"),
                metadata: vec![crate::metadata::MetadataBlock {
                    offset: 0,
                    length: 4,
                    bytes: vec![1, 2, 3, 4],
                }],
            }],
        };
        std::fs::write(&ftag_path, serde_json::to_vec(&record).unwrap()).unwrap();

        let loaded = JsonFreezetagLoader.load(&ftag_path).unwrap();
        assert_eq!(loaded.root, "Album");
        assert_eq!(loaded.files.len(), 1);
        assert_eq!(loaded.files[0].path, "01.flac");
    }

    #[test]
    fn rejects_malformed_freezetag() {
        let dir = TestTempDir::new("load-bad");
        let ftag_path = dir.path().join("bad.ftag");
        std::fs::write(&ftag_path, b"not json").unwrap();

        assert!(JsonFreezetagLoader.load(&ftag_path).is_err());
    }
}
