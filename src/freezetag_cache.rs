//! The freezetag LRU plus its reference-counted pin table and keep-alive
//! scheduler: a "polite" cache that never evicts a freezetag with an open
//! handle, and lingers briefly after the last handle closes so a burst of
//! reads doesn't thrash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::freezetag::{FreezetagLoader, FreezetagRecord};
use crate::lru::PoliteLru;

pub const CACHE_CAPACITY: usize = 10;
pub const KEEPALIVE_SECONDS: u64 = 10;

struct RefEntry {
    open_count: i64,
    epoch: u64,
}

struct State {
    cache: PoliteLru<PathBuf, Arc<FreezetagRecord>>,
    refs: HashMap<PathBuf, RefEntry>,
}

/// Shared, lockable freezetag cache. Cloned handles share the same
/// underlying lock and maps (`Arc`-wrapped), so keep-alive timer threads
/// can reach back in after the scheduling call returns.
#[derive(Clone)]
pub struct FreezetagCache {
    state: Arc<Mutex<State>>,
    loader: Arc<dyn FreezetagLoader>,
}

impl FreezetagCache {
    pub fn new(loader: Arc<dyn FreezetagLoader>) -> Self {
        FreezetagCache {
            state: Arc::new(Mutex::new(State {
                cache: PoliteLru::new(CACHE_CAPACITY),
                refs: HashMap::new(),
            })),
            loader,
        }
    }

    /// Load (or fetch from cache) the freezetag at `path`, incrementing its
    /// open_count pin and (re)scheduling its keep-alive timer. Call
    /// `release` exactly once per successful `acquire` call.
    pub fn acquire(&self, path: &Path) -> Result<Arc<FreezetagRecord>> {
        let mut guard = self.state.lock().unwrap();
        let path_buf = path.to_path_buf();

        guard.refs.entry(path_buf.clone()).or_insert(RefEntry { open_count: 0, epoch: 0 }).open_count += 1;

        let loader = self.loader.clone();
        let pin_snapshot = open_count_snapshot(&guard.refs);
        let record = guard
            .cache
            .get_or_insert_with(
                &path_buf,
                || loader.load(path).map(Arc::new),
                |k| snapshot_can_purge(&pin_snapshot, k),
            )
            .map(|v| v.clone());

        let record = match record {
            Ok(r) => r,
            Err(e) => {
                // Roll back the pin we just took; the loader produced no entry.
                if let Some(entry) = guard.refs.get_mut(&path_buf) {
                    entry.open_count -= 1;
                }
                return Err(e);
            }
        };

        drop(guard);
        self.schedule_keepalive(&path_buf);
        Ok(record)
    }

    /// Load without taking a pin — used when a freezetag has no metadata to
    /// splice in (spec: `frozen_metadata_total_len == 0`) so no handle-level
    /// reference is needed, but the record must still be parsed once (e.g.
    /// during `add_freezetag`'s initial scan).
    pub fn load_unpinned(&self, path: &Path) -> Result<Arc<FreezetagRecord>> {
        let mut guard = self.state.lock().unwrap();
        let path_buf = path.to_path_buf();
        let loader = self.loader.clone();
        let pin_snapshot = open_count_snapshot(&guard.refs);
        let record = guard
            .cache
            .get_or_insert_with(&path_buf, || loader.load(path).map(Arc::new), |k| snapshot_can_purge(&pin_snapshot, k))
            .map(|v| v.clone());
        drop(guard);
        if record.is_ok() {
            self.schedule_keepalive(&path_buf);
        }
        record
    }

    /// Decrement the pin taken by a matching `acquire`, and (re)schedule a
    /// keep-alive purge.
    pub fn release(&self, path: &Path) {
        let mut guard = self.state.lock().unwrap();
        if let Some(entry) = guard.refs.get_mut(path) {
            entry.open_count -= 1;
        }
        drop(guard);
        self.schedule_keepalive(path);
    }

    /// Immediately remove `path` regardless of pin state — used when the
    /// backing freezetag file has moved or been deleted, so stale decoded
    /// state never outlives the file it came from.
    pub fn force_purge(&self, path: &Path) {
        let mut guard = self.state.lock().unwrap();
        guard.cache.remove(&path.to_path_buf());
        guard.refs.remove(path);
    }

    fn schedule_keepalive(&self, path: &Path) {
        let mut guard = self.state.lock().unwrap();
        let entry = guard.refs.entry(path.to_path_buf()).or_insert(RefEntry { open_count: 0, epoch: 0 });
        entry.epoch += 1;
        let my_epoch = entry.epoch;
        drop(guard);

        let state = self.state.clone();
        let path_buf = path.to_path_buf();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(KEEPALIVE_SECONDS));
            let mut guard = state.lock().unwrap();
            let still_current = guard.refs.get(&path_buf).map(|e| e.epoch) == Some(my_epoch);
            if !still_current {
                // Superseded by a newer acquire/release; this timer is stale.
                return;
            }
            let purgeable = guard.refs.get(&path_buf).map(|e| e.open_count <= 0).unwrap_or(true);
            if purgeable {
                guard.cache.remove(&path_buf);
                guard.refs.remove(&path_buf);
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().unwrap().cache.len()
    }

    #[cfg(test)]
    fn contains(&self, path: &Path) -> bool {
        self.state.lock().unwrap().cache.contains(&path.to_path_buf())
    }
}

/// Snapshot of pin state taken while the lock is held, so the LRU's
/// `can_purge` closure doesn't need to borrow `refs` at the same time the
/// LRU itself is mutably borrowed.
fn open_count_snapshot(refs: &HashMap<PathBuf, RefEntry>) -> HashMap<PathBuf, i64> {
    refs.iter().map(|(k, v)| (k.clone(), v.open_count)).collect()
}

fn snapshot_can_purge(snapshot: &HashMap<PathBuf, i64>, key: &PathBuf) -> bool {
    match snapshot.get(key) {
        None => true,
        Some(&count) => count <= 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freezetag::FreezetagFile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl FreezetagLoader for CountingLoader {
        fn load(&self, path: &Path) -> Result<FreezetagRecord> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(FreezetagRecord {
                root: path.to_string_lossy().into_owned(),
                files: vec![FreezetagFile {
                    path: "x".into(),
                    checksum: crate::checksum::Checksum::of(b"x"),
                    metadata: Vec::new(),
                }],
            })
        }
    }

    #[test]
    fn acquire_pins_entry_against_eviction_pressure() {
        let loader = Arc::new(CountingLoader { loads: AtomicUsize::new(0) });
        let cache = FreezetagCache::new(loader);

        let pinned_path = PathBuf::from("/a.ftag");
        let _record = cache.acquire(&pinned_path).unwrap();

        for i in 0..(CACHE_CAPACITY + 5) {
            let _ = cache.acquire(&PathBuf::from(format!("/other-{i}.ftag")));
            cache.release(&PathBuf::from(format!("/other-{i}.ftag")));
        }

        assert!(cache.contains(&pinned_path), "pinned freezetag must survive eviction pressure");
        assert!(cache.len() <= CACHE_CAPACITY + 1);
    }

    #[test]
    fn force_purge_removes_regardless_of_pin() {
        let loader = Arc::new(CountingLoader { loads: AtomicUsize::new(0) });
        let cache = FreezetagCache::new(loader);
        let path = PathBuf::from("/a.ftag");
        let _record = cache.acquire(&path).unwrap();

        cache.force_purge(&path);

        assert!(!cache.contains(&path));
    }

    #[test]
    fn acquire_reuses_cached_entry() {
        let loader = Arc::new(CountingLoader { loads: AtomicUsize::new(0) });
        let cache = FreezetagCache::new(loader.clone());
        let path = PathBuf::from("/a.ftag");

        cache.acquire(&path).unwrap();
        cache.release(&path);
        cache.acquire(&path).unwrap();
        cache.release(&path);

        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }
}
