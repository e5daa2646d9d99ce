use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use lru::LruCache;
use parking_lot::Mutex;

use super::entry::CacheEntry;

/// Entries stored under one key, one per negotiated variant (plus any
/// still being fetched).
#[derive(Default)]
pub(crate) struct VariantList {
    pub(super) entries: tokio::sync::Mutex<Vec<Arc<CacheEntry>>>,
}

/// In-memory view of the cache. Resident keys are capped by an LRU; a key
/// that falls out is rebuilt from disk on its next lookup. Live entries are
/// tracked weakly by data path so a reconstruction never duplicates an entry
/// some task still holds.
pub(crate) struct Registry {
    keys: Mutex<LruCache<String, Arc<VariantList>>>,
    live: Mutex<HashMap<PathBuf, Weak<CacheEntry>>>,
}

impl Registry {
    pub(crate) fn new(max_keys: NonZeroUsize) -> Self {
        Self {
            keys: Mutex::new(LruCache::new(max_keys)),
            live: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn variants(&self, key: &str) -> Arc<VariantList> {
        let mut keys = self.keys.lock();
        if let Some(list) = keys.get(key) {
            return list.clone();
        }
        let list = Arc::new(VariantList::default());
        keys.put(key.to_string(), list.clone());
        list
    }

    pub(crate) fn track(&self, entry: &Arc<CacheEntry>) {
        self.live
            .lock()
            .insert(entry.path().to_path_buf(), Arc::downgrade(entry));
    }

    pub(crate) fn live(&self, path: &Path) -> Option<Arc<CacheEntry>> {
        self.live.lock().get(path).and_then(Weak::upgrade)
    }

    /// Drops the handle for `entry`'s path unless a newer entry took it.
    pub(crate) fn forget(&self, entry: &Arc<CacheEntry>) {
        let mut live = self.live.lock();
        if let Some(existing) = live.get(entry.path())
            && existing.ptr_eq(&Arc::downgrade(entry))
        {
            live.remove(entry.path());
        }
    }

    /// Strong handles to every entry still alive. Dead handles are pruned.
    pub(crate) fn live_entries(&self) -> Vec<Arc<CacheEntry>> {
        let mut live = self.live.lock();
        let mut entries = Vec::with_capacity(live.len());
        live.retain(|_, weak| match weak.upgrade() {
            Some(entry) => {
                entries.push(entry);
                true
            }
            None => false,
        });
        entries
    }

    #[cfg(test)]
    pub(crate) fn resident_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::cache::key::CacheKey;
    use http::{HeaderMap, Uri};

    fn entry(path: &str) -> Arc<CacheEntry> {
        let uri: Uri = "http://example.com/a".parse().unwrap();
        let key = CacheKey::from_uri(&uri).unwrap();
        CacheEntry::pending(key, uri, PathBuf::from(path), HeaderMap::new(), None)
    }

    #[test]
    fn resident_keys_are_capped() {
        let registry = Registry::new(NonZeroUsize::new(2).unwrap());
        let first = registry.variants("a");
        registry.variants("b");
        registry.variants("c");
        assert_eq!(registry.resident_keys(), 2);
        assert!(!Arc::ptr_eq(&first, &registry.variants("a")));
    }

    #[test]
    fn live_handles_are_weak() {
        let registry = Registry::new(NonZeroUsize::new(4).unwrap());
        let kept = entry("/tmp/k.0");
        registry.track(&kept);
        registry.track(&entry("/tmp/k.1"));
        assert!(registry.live(Path::new("/tmp/k.0")).is_some());
        assert!(registry.live(Path::new("/tmp/k.1")).is_none());
        assert_eq!(registry.live_entries().len(), 1);
    }

    #[test]
    fn forget_leaves_newer_entry_for_same_path() {
        let registry = Registry::new(NonZeroUsize::new(4).unwrap());
        let old = entry("/tmp/k.0");
        let new = entry("/tmp/k.0");
        registry.track(&old);
        registry.track(&new);
        registry.forget(&old);
        assert!(registry.live(Path::new("/tmp/k.0")).is_some());
        registry.forget(&new);
        assert!(registry.live(Path::new("/tmp/k.0")).is_none());
    }
}
