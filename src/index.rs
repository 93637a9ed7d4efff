//! The index: three interlocking maps (virtual-path tree, checksum map,
//! absolute-path map) plus the freezetag reverse index, kept coherent under
//! live filesystem mutations.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::checksum::Checksum;
use crate::checksum_store::{CachedRecord, ChecksumStore, FileKey};
use crate::freezetag::{FreezetagFile, FreezetagRecord};
use crate::freezetag_cache::FreezetagCache;
use crate::metadata::{self, MetadataLayout, MetadataParser};

/// A physical content source: a stripped audio file with a known raw
/// checksum.
#[derive(Clone, Debug)]
pub struct ContentFileEntry {
    pub absolute_path: PathBuf,
    pub stripped_metadata_layout: MetadataLayout,
    pub stripped_metadata_total_len: u64,
}

/// One freezetag's claim on a virtual path for a given checksum.
#[derive(Clone, Debug)]
pub struct FreezetagEntry {
    pub freezetag_source_path: PathBuf,
    pub virtual_path: PathBuf,
    pub frozen_metadata_total_len: u64,
}

/// The fused index entry for one checksum: physical content sources plus
/// the freezetags that know how to re-tag them.
#[derive(Clone, Debug, Default)]
pub struct FrozenItem {
    pub freezetags: Vec<FreezetagEntry>,
    pub files: Vec<ContentFileEntry>,
}

impl FrozenItem {
    pub fn is_live(&self) -> bool {
        !self.freezetags.is_empty() && !self.files.is_empty()
    }

    fn is_dangling(&self) -> bool {
        self.freezetags.is_empty() && self.files.is_empty()
    }
}

enum PathNode {
    Dir(HashMap<OsString, PathNode>),
    Leaf(Checksum),
}

impl PathNode {
    fn new_dir() -> Self {
        PathNode::Dir(HashMap::new())
    }
}

fn components(path: &Path) -> Vec<OsString> {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_os_string()),
            _ => None,
        })
        .collect()
}

struct IndexState {
    path_tree: PathNode,
    checksum_map: HashMap<Checksum, FrozenItem>,
    absolute_path_map: HashMap<PathBuf, Checksum>,
    /// FreezetagSourcePath -> (virtual_root, [Checksum]).
    freezetag_map: HashMap<PathBuf, (PathBuf, Vec<Checksum>)>,
    /// Freezetags whose root collided with an already-mounted root.
    inactive_freezetags: Vec<(PathBuf, PathBuf)>,
    checksum_store: ChecksumStore,
}

/// The virtual-path tree, checksum map, and absolute-path map, plus their
/// mutators. Guarded by one process-wide mutex for the duration of every
/// operation (held for the full duration of mutators; briefly during
/// read-pipeline lookups).
pub struct Index {
    state: Mutex<IndexState>,
    freezetag_cache: FreezetagCache,
    metadata_parser: Arc<dyn MetadataParser>,
}

impl Index {
    pub fn new(
        checksum_store: ChecksumStore,
        freezetag_cache: FreezetagCache,
        metadata_parser: Arc<dyn MetadataParser>,
    ) -> Self {
        Index {
            state: Mutex::new(IndexState {
                path_tree: PathNode::new_dir(),
                checksum_map: HashMap::new(),
                absolute_path_map: HashMap::new(),
                freezetag_map: HashMap::new(),
                inactive_freezetags: Vec::new(),
                checksum_store,
            }),
            freezetag_cache,
            metadata_parser,
        }
    }

    pub fn flush_checksum_store(&self) -> Result<()> {
        self.state.lock().unwrap().checksum_store.flush()
    }

    // ---- Lookups (briefly hold the lock) ----

    /// Resolve a virtual path to its checksum and `FrozenItem` (a clone,
    /// cheap: a handful of small `Vec`s), if it names a leaf. Returns raw
    /// index state regardless of liveness; callers that must honor I4 (a
    /// non-live item is never exposed via getattr/readdir) check
    /// `FrozenItem::is_live` themselves, since some callers (e.g. an
    /// in-progress freezetag/content registration) legitimately want to
    /// see a not-yet-live entry.
    pub fn lookup_item(&self, path: &Path) -> Option<(Checksum, FrozenItem)> {
        let state = self.state.lock().unwrap();
        match resolve(&state.path_tree, path)? {
            ResolvedNode::Leaf(checksum) => {
                state.checksum_map.get(checksum).cloned().map(|item| (*checksum, item))
            }
            ResolvedNode::Dir => None,
        }
    }

    /// List a directory's live children (skips non-live items, per I4).
    pub fn readdir(&self, path: &Path) -> Option<Vec<String>> {
        let state = self.state.lock().unwrap();
        let node = resolve_node(&state.path_tree, path)?;
        match node {
            PathNode::Dir(children) => Some(
                children
                    .iter()
                    .filter(|(_, child)| match child {
                        PathNode::Dir(_) => true,
                        PathNode::Leaf(checksum) => {
                            state.checksum_map.get(checksum).map(FrozenItem::is_live).unwrap_or(false)
                        }
                    })
                    .map(|(name, _)| name.to_string_lossy().into_owned())
                    .collect(),
            ),
            PathNode::Leaf(_) => None,
        }
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        let state = self.state.lock().unwrap();
        matches!(resolve_node(&state.path_tree, path), Some(PathNode::Dir(_)))
    }

    // ---- Mutators ----

    /// Scan-or-watcher entrypoint: register a content file, consulting (and
    /// on miss, populating) the checksum store so unchanged files are never
    /// re-parsed across a restart.
    pub fn add_content_file(&self, absolute_path: &Path) {
        let meta = match fs::metadata(absolute_path) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("cannot stat content file {}: {e}", absolute_path.display());
                return;
            }
        };
        let key = FileKey::of_metadata(&meta);

        let mut state = self.state.lock().unwrap();
        let cached = state.checksum_store.get(key).cloned();

        let (checksum, layout) = if let Some(record) = cached {
            (record.checksum, record.stripped_metadata_layout)
        } else {
            let data = match fs::read(absolute_path) {
                Ok(d) => d,
                Err(e) => {
                    log::warn!("cannot read content file {}: {e}", absolute_path.display());
                    return;
                }
            };
            let parsed = match self.metadata_parser.parse(&data) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("cannot parse content file {}: {e}", absolute_path.display());
                    return;
                }
            };
            state.checksum_store.put(
                key,
                CachedRecord {
                    checksum: parsed.checksum,
                    stripped_metadata_layout: parsed.stripped_metadata_layout.clone(),
                },
            );
            (parsed.checksum, parsed.stripped_metadata_layout)
        };

        let total_len = metadata::total_len(&layout);
        let entry = ContentFileEntry {
            absolute_path: absolute_path.to_path_buf(),
            stripped_metadata_layout: layout,
            stripped_metadata_total_len: total_len,
        };

        state.checksum_map.entry(checksum).or_default().files.push(entry);
        state.absolute_path_map.insert(absolute_path.to_path_buf(), checksum);
    }

    pub fn remove_content_file(&self, absolute_path: &Path) {
        let mut state = self.state.lock().unwrap();
        let Some(checksum) = state.absolute_path_map.get(absolute_path).copied() else { return };

        if let Some(item) = state.checksum_map.get_mut(&checksum) {
            item.files.retain(|f| f.absolute_path != absolute_path);
        }
        dangling_cleanup(&mut state, checksum, None, Some(absolute_path));
    }

    pub fn rename_content_file(&self, src: &Path, dst: &Path) {
        let mut state = self.state.lock().unwrap();
        let Some(checksum) = state.absolute_path_map.remove(src) else { return };
        state.absolute_path_map.insert(dst.to_path_buf(), checksum);

        if let Some(item) = state.checksum_map.get_mut(&checksum) {
            for file in &mut item.files {
                if file.absolute_path == src {
                    file.absolute_path = dst.to_path_buf();
                }
            }
        }
    }

    /// Load and register a freezetag; on a root collision, defer to
    /// `inactive_freezetags` instead of overwriting the active claim (I3).
    pub fn add_freezetag(&self, source_path: &Path) {
        let record = match self.freezetag_cache.load_unpinned(source_path) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("cannot parse freezetag {}: {e}", source_path.display());
                return;
            }
        };

        let virtual_root = PathBuf::from("/").join(&record.root);

        let mut state = self.state.lock().unwrap();
        if resolve(&state.path_tree, &virtual_root).is_some() {
            log::warn!(
                "cannot mount {} at {}: path already mounted by another freezetag",
                source_path.display(),
                virtual_root.display(),
            );
            state.inactive_freezetags.push((virtual_root, source_path.to_path_buf()));
            return;
        }

        state.freezetag_map.insert(source_path.to_path_buf(), (virtual_root.clone(), Vec::new()));

        for file in &record.files {
            add_freezetag_file_entry(&mut state, source_path, &virtual_root, file);
        }
    }

    pub fn remove_freezetag(&self, source_path: &Path) {
        self.freezetag_cache.force_purge(source_path);

        let mut state = self.state.lock().unwrap();

        if let Some(pos) = state.inactive_freezetags.iter().position(|(_, p)| p == source_path) {
            state.inactive_freezetags.remove(pos);
            return;
        }

        let Some((root, checksums)) = state.freezetag_map.remove(source_path) else { return };

        for checksum in checksums {
            let virtual_path = {
                let Some(item) = state.checksum_map.get_mut(&checksum) else { continue };
                let removed_path = item
                    .freezetags
                    .iter()
                    .position(|e| e.freezetag_source_path == source_path)
                    .map(|i| item.freezetags.remove(i).virtual_path);
                removed_path
            };
            if let Some(virtual_path) = virtual_path {
                dangling_cleanup(&mut state, checksum, Some(&virtual_path), None);
            }
        }

        // Promote exactly one inactive freezetag targeting the same root.
        if let Some(pos) = state.inactive_freezetags.iter().position(|(r, _)| *r == root) {
            let (_, promoted_path) = state.inactive_freezetags.remove(pos);
            drop(state);
            self.add_freezetag(&promoted_path);
        }
    }

    pub fn rename_freezetag(&self, src: &Path, dst: &Path) {
        self.freezetag_cache.force_purge(src);

        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.inactive_freezetags.iter_mut().find(|(_, p)| p == src) {
            entry.1 = dst.to_path_buf();
            return;
        }

        let Some(mapping) = state.freezetag_map.remove(src) else { return };
        let checksums = mapping.1.clone();
        state.freezetag_map.insert(dst.to_path_buf(), mapping);

        for checksum in checksums {
            if let Some(item) = state.checksum_map.get_mut(&checksum) {
                for entry in &mut item.freezetags {
                    if entry.freezetag_source_path == src {
                        entry.freezetag_source_path = dst.to_path_buf();
                    }
                }
            }
        }
    }
}

fn add_freezetag_file_entry(
    state: &mut IndexState,
    source_path: &Path,
    virtual_root: &Path,
    file: &FreezetagFile,
) {
    let virtual_path = virtual_root.join(&file.path);
    let frozen_metadata_total_len = metadata::total_len(&file.metadata);

    let entry = FreezetagEntry {
        freezetag_source_path: source_path.to_path_buf(),
        virtual_path: virtual_path.clone(),
        frozen_metadata_total_len,
    };

    let item = state.checksum_map.entry(file.checksum).or_default();
    debug_assert!(
        !item.freezetags.iter().any(|e| e.virtual_path == virtual_path),
        "virtual path {} already claimed by another freezetag entry for this checksum",
        virtual_path.display(),
    );
    item.freezetags.push(entry);
    insert_leaf(&mut state.path_tree, &virtual_path, file.checksum);

    if let Some((_, checksums)) = state.freezetag_map.get_mut(source_path) {
        checksums.push(file.checksum);
    }
}

fn insert_leaf(root: &mut PathNode, path: &Path, checksum: Checksum) {
    let parts = components(path);
    let Some((last, dirs)) = parts.split_last() else { return };

    let mut node = root;
    for part in dirs {
        node = match node {
            PathNode::Dir(children) => children.entry(part.clone()).or_insert_with(PathNode::new_dir),
            PathNode::Leaf(_) => return,
        };
    }
    if let PathNode::Dir(children) = node {
        children.insert(last.clone(), PathNode::Leaf(checksum));
    }
}

enum ResolvedNode<'a> {
    Leaf(&'a Checksum),
    Dir,
}

fn resolve<'a>(root: &'a PathNode, path: &Path) -> Option<ResolvedNode<'a>> {
    match resolve_node(root, path)? {
        PathNode::Dir(_) => Some(ResolvedNode::Dir),
        PathNode::Leaf(c) => Some(ResolvedNode::Leaf(c)),
    }
}

fn resolve_node<'a>(root: &'a PathNode, path: &Path) -> Option<&'a PathNode> {
    let mut node = root;
    for part in components(path) {
        match node {
            PathNode::Dir(children) => node = children.get(&part)?,
            PathNode::Leaf(_) => return None,
        }
    }
    Some(node)
}

/// Remove now-dangling state after a content file or freezetag entry is
/// removed from a `FrozenItem`: drop the checksum map entry if both
/// collections are empty, prune empty path-tree branches, and drop the
/// absolute-path map entry if no file remains.
fn dangling_cleanup(
    state: &mut IndexState,
    checksum: Checksum,
    virtual_path: Option<&Path>,
    absolute_path: Option<&Path>,
) {
    let is_dangling = state.checksum_map.get(&checksum).map(FrozenItem::is_dangling).unwrap_or(false);

    if let Some(virtual_path) = virtual_path {
        let still_claimed = state
            .checksum_map
            .get(&checksum)
            .map(|item| item.freezetags.iter().any(|e| e.virtual_path == virtual_path))
            .unwrap_or(false);
        if !still_claimed {
            prune_empty_branches(&mut state.path_tree, virtual_path);
        }
    }

    if let Some(absolute_path) = absolute_path {
        let has_files = state
            .checksum_map
            .get(&checksum)
            .map(|item| !item.files.is_empty())
            .unwrap_or(false);
        if !has_files {
            state.absolute_path_map.remove(absolute_path);
        }
    }

    if is_dangling {
        state.checksum_map.remove(&checksum);
    }
}

/// Remove the leaf at `leaf_path` and prune any directory left empty by its
/// removal, all the way back up to (but not including) the root.
fn prune_empty_branches(root: &mut PathNode, leaf_path: &Path) {
    let parts = components(leaf_path);
    remove_and_prune(root, &parts);
}

fn remove_and_prune(root: &mut PathNode, parts: &[OsString]) -> bool {
    let Some((first, rest)) = parts.split_first() else { return false };

    let PathNode::Dir(children) = root else { return false };

    if rest.is_empty() {
        children.remove(first);
    } else {
        let remove_child = match children.get_mut(first) {
            Some(child) => remove_and_prune(child, rest),
            None => false,
        };
        if remove_child {
            children.remove(first);
        }
    }

    children.is_empty()
}
