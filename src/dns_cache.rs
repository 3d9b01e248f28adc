use crate::dns::DnsMessage;
use hashlink::LruCache;
use std::sync::{Arc, Mutex, MutexGuard};

/// Bounded cache of decoded DNS responses keyed by query name. Insertion
/// replaces any prior entry for the same key; when `auto_delete` is set the
/// oldest entry is evicted once the configured capacity is reached.
///
/// All access goes through [`ResponseCache::with_lock`], so the lock is
/// released on every exit path.
pub struct ResponseCache {
    label: String,
    max_size: usize,
    auto_delete: bool,
    inner: Mutex<LruCache<String, Arc<DnsMessage>>>,
}

impl ResponseCache {
    pub fn new(label: &str, max_size: usize, auto_delete: bool) -> Self {
        let inner = if auto_delete && max_size > 0 {
            LruCache::new(max_size)
        } else {
            LruCache::new_unbounded()
        };
        Self {
            label: label.to_string(),
            max_size,
            auto_delete,
            inner: Mutex::new(inner),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn auto_delete(&self) -> bool {
        self.auto_delete
    }

    fn guard(&self) -> MutexGuard<'_, LruCache<String, Arc<DnsMessage>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with the cache locked for the whole read-modify sequence.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut LruCache<String, Arc<DnsMessage>>) -> R) -> R {
        let mut guard = self.guard();
        f(&mut guard)
    }

    pub fn set(&self, key: String, response: Arc<DnsMessage>) {
        self.with_lock(|cache| {
            cache.insert(key, response);
        });
    }

    pub fn get(&self, key: &str) -> Option<Arc<DnsMessage>> {
        self.with_lock(|cache| cache.get(key).cloned())
    }

    /// Removes one entry; reports whether the key was present, so the
    /// administrative surface can return a not-found status.
    pub fn remove(&self, key: &str) -> bool {
        self.with_lock(|cache| cache.remove(key).is_some())
    }

    pub fn clear(&self) {
        self.with_lock(|cache| cache.clear());
    }

    pub fn len(&self) -> usize {
        self.with_lock(|cache| cache.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
