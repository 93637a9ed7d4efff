//! Recursive filesystem watcher: translates `notify` events into `Index`
//! mutations on a dedicated drain thread.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as NotifyWatcher};

use crate::index::Index;

fn is_freezetag(path: &Path) -> bool {
    path.extension().map(|e| e.eq_ignore_ascii_case("ftag")).unwrap_or(false)
}

/// Owns the live `notify` watcher and its drain thread. Dropping this value
/// stops the watch (the drain thread exits once the channel's sender side,
/// held by the `notify::Watcher`, is dropped).
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
}

impl SourceWatcher {
    pub fn start(source: &Path, index: Arc<Index>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())
            .context("creating filesystem watcher")?;
        watcher
            .watch(source, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", source.display()))?;

        std::thread::spawn(move || {
            for event in rx {
                match event {
                    Ok(event) => dispatch(&index, &event),
                    Err(e) => log::warn!("filesystem watcher error: {e}"),
                }
            }
        });

        Ok(SourceWatcher { _watcher: watcher })
    }
}

fn dispatch(index: &Index, event: &Event) {
    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                on_created(index, path);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                on_deleted(index, path);
            }
        }
        EventKind::Modify(notify::event::ModifyKind::Name(_)) if event.paths.len() == 2 => {
            on_moved(index, &event.paths[0], &event.paths[1]);
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                on_deleted(index, path);
                on_created(index, path);
            }
        }
        _ => {}
    }
}

fn on_created(index: &Index, path: &Path) {
    if path.is_dir() {
        return;
    }
    if is_freezetag(path) {
        index.add_freezetag(path);
    } else {
        index.add_content_file(path);
    }
}

fn on_deleted(index: &Index, path: &Path) {
    if is_freezetag(path) {
        index.remove_freezetag(path);
    } else {
        index.remove_content_file(path);
    }
}

fn on_moved(index: &Index, src: &Path, dst: &Path) {
    if dst.is_dir() {
        return;
    }
    if is_freezetag(src) {
        index.rename_freezetag(src, dst);
    } else {
        index.rename_content_file(src, dst);
    }
}

/// Depth-first walk of `root`, yielding file paths in directory-sorted
/// order — used for the initial scan before the watcher takes over.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk_dir_into(root, &mut out)?;
    Ok(out)
}

fn walk_dir_into(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("reading directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut subdirs = Vec::new();
    for entry in entries {
        let path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                log::warn!("cannot stat {} during scan: {e}", path.display());
                continue;
            }
        };
        if file_type.is_dir() {
            subdirs.push(path);
        } else if file_type.is_file() {
            out.push(path);
        }
    }
    for subdir in subdirs {
        walk_dir_into(&subdir, out)?;
    }
    Ok(())
}

/// Initial scan: register every content file and freezetag under `source`,
/// freezetags second so every checksum they reference has a chance to
/// already be known (matching the original's single-pass ordering is not
/// required — `Index` mutators are commutative with respect to scan order
/// for this purpose, since a `FrozenItem` only becomes live once both
/// sides are present).
pub fn initial_scan(source: &Path, index: &Index) -> Result<()> {
    for path in walk_dir(source)? {
        if is_freezetag(&path) {
            continue;
        }
        index.add_content_file(&path);
    }
    for path in walk_dir(source)? {
        if is_freezetag(&path) {
            index.add_freezetag(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TestTempDir {
        path: PathBuf,
    }

    impl TestTempDir {
        fn new(name: &str) -> Self {
            let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
            let path = std::env::temp_dir()
                .join(format!("freezefs-watcher-{}-{}-{}", std::process::id(), name, ts));
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

    #[test]
    fn is_freezetag_matches_case_insensitively() {
        assert!(is_freezetag(Path::new("/a/Album.FTAG")));
        assert!(is_freezetag(Path::new("/a/Album.ftag")));
        assert!(!is_freezetag(Path::new("/a/Album.flac")));
    }

    #[test]
    fn walk_dir_visits_nested_files_in_sorted_order() {
        let dir = TestTempDir::new("walk");
        fs::create_dir_all(dir.path().join("b")).unwrap();
        fs::write(dir.path().join("a.flac"), b"1").unwrap();
        fs::write(dir.path().join("b/c.flac"), b"2").unwrap();
        fs::write(dir.path().join("z.flac"), b"3").unwrap();

        let found = walk_dir(dir.path()).unwrap();
        let names: Vec<_> = found.iter().map(|p| p.strip_prefix(dir.path()).unwrap().to_path_buf()).collect();
        assert_eq!(
            names,
            vec![PathBuf::from("a.flac"), PathBuf::from("b/c.flac"), PathBuf::from("z.flac")]
        );
    }
}
