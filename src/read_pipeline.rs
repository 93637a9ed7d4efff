//! The virtual-file read pipeline: splicing freezetag metadata bytes back
//! into a stripped content file's byte stream at open/read/release time.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt as UnixMetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::checksum::Checksum;
use crate::config::Config;
use crate::freezetag_cache::FreezetagCache;
use crate::index::Index;
use crate::metadata::{MetadataBlock, MetadataLayout};

/// Marker error for a lookup that found nothing live at the requested path
/// (no item, item not live, or no matching `FreezetagEntry`), distinct from
/// an I/O failure, so `fuse_adapter` can map it to `ENOENT` instead of
/// `EIO`.
#[derive(Debug)]
pub struct NotFoundError;

impl std::fmt::Display for NotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "not found")
    }
}

impl std::error::Error for NotFoundError {}

/// Stat response for a live virtual path: stat taken from the content
/// source, uid/gid overridden, size adjusted for the metadata splice.
#[derive(Clone, Debug)]
pub struct VirtualStat {
    pub size: u64,
    pub blocks: u64,
    pub atime: std::time::SystemTime,
    pub mtime: std::time::SystemTime,
    pub ctime: std::time::SystemTime,
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
}

/// An open virtual file: a content source plus the metadata to splice in.
///
/// Synthesizes bytes as though the original tagged file existed, without
/// ever materializing the full reconstruction: each read walks the
/// content's `stripped_metadata_layout` in offset order, alternately
/// passing raw content bytes through and inserting either the freezetag's
/// bytes for that block or a zero-filled placeholder of the same length.
pub struct VirtualFile {
    content: File,
    stripped_metadata_layout: MetadataLayout,
    /// `Some` only if the open was "frozen" (a matching freezetag record
    /// was found); its offsets take precedence over the content's own
    /// layout when the two disagree.
    frozen_metadata: Option<MetadataLayout>,
    freezetag_source_path: Option<PathBuf>,
}

impl VirtualFile {
    /// Read exactly `length` bytes starting at virtual `offset`, or fewer
    /// at EOF. `length`/`offset` are positions in the *reconstructed*
    /// (original, tagged) file's coordinate space.
    pub fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>> {
        let length = length as usize;
        let layout = self.effective_layout();
        let mut out = Vec::with_capacity(length);
        let mut virt_pos = offset;
        let remaining_after = |pos: u64| length.saturating_sub((pos - offset) as usize);

        for block in &layout {
            if virt_pos - offset >= length as u64 {
                break;
            }
            // Raw content runs between the previous block's end and this
            // block's start; `stripped_pos` tracks how far into the content
            // stream we are, which differs from `virt_pos` by the total
            // length of blocks already spliced in.
            let stripped_pos = virt_pos - self.splice_len_before(&layout, block.offset);

            if virt_pos < block.offset {
                let run_len = (block.offset - virt_pos).min(remaining_after(virt_pos) as u64);
                if run_len > 0 {
                    out.extend(self.read_content_at(stripped_pos, run_len as usize)?);
                    virt_pos += run_len;
                }
            }

            if virt_pos >= block.offset && virt_pos < block.offset + block.length {
                let into_block = virt_pos - block.offset;
                let want = ((block.length - into_block) as usize).min(remaining_after(virt_pos));
                out.extend(self.block_bytes(block, into_block as usize, want));
                virt_pos += want as u64;
            }
        }

        if (virt_pos - offset) < length as u64 {
            let stripped_pos = virt_pos - self.splice_len_before(&layout, u64::MAX);
            let want = remaining_after(virt_pos);
            out.extend(self.read_content_at(stripped_pos, want)?);
        }

        Ok(out)
    }

    fn effective_layout(&self) -> MetadataLayout {
        match &self.frozen_metadata {
            Some(frozen) => frozen.clone(),
            None => self.stripped_metadata_layout.clone(),
        }
    }

    /// Sum of block lengths whose offset is strictly before `virt_offset`,
    /// i.e. how much the stripped stream's position trails the virtual
    /// (reconstructed) position at that point.
    fn splice_len_before(&self, layout: &[MetadataBlock], virt_offset: u64) -> u64 {
        layout.iter().filter(|b| b.offset < virt_offset).map(|b| b.length).sum()
    }

    fn read_content_at(&mut self, pos: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        self.content.seek(SeekFrom::Start(pos)).context("seeking content file")?;
        let mut buf = vec![0u8; len];
        let mut read_total = 0;
        loop {
            let n = self.content.read(&mut buf[read_total..]).context("reading content file")?;
            if n == 0 {
                break;
            }
            read_total += n;
            if read_total == len {
                break;
            }
        }
        buf.truncate(read_total);
        Ok(buf)
    }

    /// Bytes for the slice `[skip, skip+want)` of a given block: the
    /// freezetag's bytes if this open is frozen, zero-filled otherwise.
    fn block_bytes(&self, block: &MetadataBlock, skip: usize, want: usize) -> Vec<u8> {
        if self.frozen_metadata.is_some() {
            let end = (skip + want).min(block.bytes.len());
            let start = skip.min(block.bytes.len());
            let mut v = block.bytes[start..end].to_vec();
            v.resize(want, 0);
            v
        } else {
            vec![0u8; want]
        }
    }
}

/// Handle-table entry: the open virtual file plus, if it pinned a
/// freezetag, which one (so `release` can drop the pin).
struct OpenHandle {
    file: VirtualFile,
}

/// Orchestrates stat/open/read/release against the `Index` and
/// `FreezetagCache`. `fh_map` is documented as FUSE-thread-only per the
/// concurrency model, so it is plain (unsynchronized) state behind a
/// `Mutex` only because `fuser::Filesystem`'s methods take `&self`.
pub struct ReadPipeline {
    index: Arc<Index>,
    freezetag_cache: FreezetagCache,
    config: Config,
    fh_map: Mutex<HashMap<u64, OpenHandle>>,
    next_fh: AtomicU64,
}

impl ReadPipeline {
    /// Shares `index` with the watcher (both hold an `Arc` to the same
    /// instance) rather than owning it outright.
    pub fn new(index: Arc<Index>, freezetag_cache: FreezetagCache, config: Config) -> Self {
        ReadPipeline {
            index,
            freezetag_cache,
            config,
            fh_map: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    /// Stat a live virtual path. Returns `None` for "not found" (no item,
    /// item not live, or no matching `FreezetagEntry`).
    pub fn stat(&self, path: &Path) -> Option<VirtualStat> {
        let (_, item) = self.index.lookup_item(path)?;
        if item.files.is_empty() || item.freezetags.is_empty() {
            return None;
        }
        let entry = item.freezetags.iter().find(|e| e.virtual_path == path)?;
        let content = &item.files[0];
        let meta = std::fs::metadata(&content.absolute_path).ok()?;

        let size = meta
            .size()
            .saturating_add(entry.frozen_metadata_total_len)
            .saturating_sub(content.stripped_metadata_total_len);

        Some(VirtualStat {
            size,
            blocks: (size + 511) / 512,
            atime: meta.accessed().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            ctime: std::time::UNIX_EPOCH + std::time::Duration::from_secs(meta.ctime().max(0) as u64),
            perm: 0o444,
            uid: self.config.uid,
            gid: self.config.gid,
        })
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        self.index.is_dir(path)
    }

    pub fn readdir(&self, path: &Path) -> Option<Vec<String>> {
        self.index.readdir(path)
    }

    /// Open a virtual path, returning a handle id for subsequent `read`/
    /// `release` calls.
    pub fn open(&self, path: &Path) -> Result<u64> {
        let (checksum, item) = self.index.lookup_item(path).ok_or(NotFoundError)?;
        if item.files.is_empty() {
            return Err(NotFoundError.into());
        }
        let content = item.files[0].clone();
        let entry = item
            .freezetags
            .iter()
            .find(|e| e.virtual_path == path)
            .ok_or(NotFoundError)?
            .clone();

        let target_path = strip_root(&entry.virtual_path);

        let frozen_metadata = if entry.frozen_metadata_total_len > 0 {
            let record = self.freezetag_cache.acquire(&entry.freezetag_source_path)?;
            let matching: Vec<_> = record
                .files
                .iter()
                .filter(|f| f.checksum == checksum)
                .collect();
            let exact = matching.iter().find(|f| f.path == target_path.to_string_lossy());
            match exact {
                Some(f) => Some(f.metadata.clone()),
                None => {
                    if !matching.is_empty() {
                        log::debug!(
                            "freezetag {} has checksum-only matches for {} with no exact path match",
                            entry.freezetag_source_path.display(),
                            path.display(),
                        );
                    }
                    self.freezetag_cache.release(&entry.freezetag_source_path);
                    None
                }
            }
        } else {
            None
        };

        let file = File::open(&content.absolute_path)
            .with_context(|| format!("opening content file {}", content.absolute_path.display()))?;

        let freezetag_source_path = if frozen_metadata.is_some() {
            Some(entry.freezetag_source_path.clone())
        } else {
            None
        };

        let virtual_file = VirtualFile {
            content: file,
            stripped_metadata_layout: content.stripped_metadata_layout,
            frozen_metadata,
            freezetag_source_path,
        };

        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.fh_map.lock().unwrap().insert(fh, OpenHandle { file: virtual_file });
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut guard = self.fh_map.lock().unwrap();
        let handle = guard.get_mut(&fh).ok_or_else(|| anyhow!("unknown file handle"))?;
        handle.file.read(offset, length)
    }

    pub fn release(&self, fh: u64) {
        let handle = self.fh_map.lock().unwrap().remove(&fh);
        if let Some(handle) = handle {
            if let Some(source) = handle.file.freezetag_source_path {
                self.freezetag_cache.release(&source);
            }
        }
    }
}

/// Strip the leading `/` and root component from a virtual path, giving
/// the path relative to the freezetag's root (matches `FreezetagFile::path`).
fn strip_root(virtual_path: &Path) -> PathBuf {
    virtual_path.components().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum_store::ChecksumStore;
    use crate::freezetag::{FreezetagFile, FreezetagLoader, FreezetagRecord};
    use crate::metadata::StubMetadataParser;
    use std::fs;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir()
                .join(format!("freezefs-read-pipeline-{}-{}-{}", std::process::id(), name, ts));
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

    struct FsFreezetagLoader;

    impl FreezetagLoader for FsFreezetagLoader {
        fn load(&self, path: &Path) -> Result<FreezetagRecord> {
            let data = fs::read(path).context("read")?;
            serde_json::from_slice(&data).context("parse")
        }
    }

    fn new_pipeline(dir: &Path) -> ReadPipeline {
        let store = ChecksumStore::open(dir.join("checksums.db")).unwrap();
        let cache = FreezetagCache::new(Arc::new(FsFreezetagLoader));
        let index = Arc::new(Index::new(store, cache.clone(), Arc::new(StubMetadataParser)));
        ReadPipeline::new(index, cache, Config::for_test())
    }

    fn write_freezetag(dir: &Path, name: &str, root: &str, path: &str, checksum: Checksum, metadata: MetadataLayout) -> PathBuf {
        let record = FreezetagRecord {
            root: root.to_string(),
            files: vec![FreezetagFile { path: path.to_string(), checksum, metadata }],
        };
        let p = dir.join(name);
        fs::write(&p, serde_json::to_vec(&record).unwrap()).unwrap();
        p
    }

    #[test]
    fn read_splices_metadata_block_into_stripped_content() {
        let dir = TestTempDir::new("splice");
        // Stripped content: "AAAA" + "CCCC" (8 bytes); original inserts
        // "BBBB" between them at stripped-content offset 4.
        let content_path = dir.path().join("a.flac");
        fs::write(&content_path, b"AAAACCCC").unwrap();
        let checksum = Checksum::of(b"AAAACCCC");

        let metadata = vec![MetadataBlock { offset: 4, length: 4, bytes: b"BBBB".to_vec() }];
        let ftag = write_freezetag(dir.path(), "Album.ftag", "Album", "01.flac", checksum, metadata);

        let pipeline = new_pipeline(dir.path());
        pipeline.index().add_content_file(&content_path);
        pipeline.index().add_freezetag(&ftag);

        let stat = pipeline.stat(Path::new("/Album/01.flac")).unwrap();
        assert_eq!(stat.size, 12);

        let fh = pipeline.open(Path::new("/Album/01.flac")).unwrap();
        let data = pipeline.read(fh, 0, 12).unwrap();
        assert_eq!(&data, b"AAAABBBBCCCC");
        pipeline.release(fh);
    }

    #[test]
    fn read_mid_splice_offset_returns_correct_window() {
        let dir = TestTempDir::new("mid-splice");
        let content_path = dir.path().join("a.flac");
        fs::write(&content_path, b"AAAACCCC").unwrap();
        let checksum = Checksum::of(b"AAAACCCC");
        let metadata = vec![MetadataBlock { offset: 4, length: 4, bytes: b"BBBB".to_vec() }];
        let ftag = write_freezetag(dir.path(), "Album.ftag", "Album", "01.flac", checksum, metadata);

        let pipeline = new_pipeline(dir.path());
        pipeline.index().add_content_file(&content_path);
        pipeline.index().add_freezetag(&ftag);

        let fh = pipeline.open(Path::new("/Album/01.flac")).unwrap();
        // Straddles the AAAA|BBBB boundary.
        let data = pipeline.read(fh, 2, 4).unwrap();
        assert_eq!(&data, b"AABB");
        pipeline.release(fh);
    }

    #[test]
    fn read_without_freezetag_metadata_zero_fills() {
        let dir = TestTempDir::new("zero-fill");
        let content_path = dir.path().join("a.flac");
        fs::write(&content_path, b"AAAACCCC").unwrap();
        let checksum = Checksum::of(b"AAAACCCC");
        // Freezetag entry with an empty metadata layout: open is never
        // "frozen" (frozen_metadata_total_len == 0), so nothing is pinned
        // and no splice happens; bytes pass straight through.
        let ftag = write_freezetag(dir.path(), "Album.ftag", "Album", "01.flac", checksum, Vec::new());

        let pipeline = new_pipeline(dir.path());
        pipeline.index().add_content_file(&content_path);
        pipeline.index().add_freezetag(&ftag);

        let fh = pipeline.open(Path::new("/Album/01.flac")).unwrap();
        let data = pipeline.read(fh, 0, 8).unwrap();
        assert_eq!(&data, b"AAAACCCC");
        pipeline.release(fh);
    }

    #[test]
    fn stat_on_non_live_item_returns_none() {
        let dir = TestTempDir::new("non-live");
        let checksum = Checksum::of(b"x");
        let ftag = write_freezetag(dir.path(), "Album.ftag", "Album", "01.flac", checksum, Vec::new());

        let pipeline = new_pipeline(dir.path());
        pipeline.index().add_freezetag(&ftag);

        assert!(pipeline.stat(Path::new("/Album/01.flac")).is_none());
    }
}
