//! Concurrency wrapper over the LRU engine.

use parking_lot::Mutex;

use crate::byteview::ByteView;
use crate::lru::LruCache;

/// Mutex-guarded LRU holding [`ByteView`] values.
///
/// The LRU itself is created lazily on the first insert so an unused group
/// costs nothing beyond the configured budget.
pub(crate) struct ConcurrentCache {
    max_bytes: usize,
    inner: Mutex<Option<LruCache<ByteView>>>,
}

impl ConcurrentCache {
    pub(crate) fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            inner: Mutex::new(None),
        }
    }

    pub(crate) fn insert(&self, key: &str, value: ByteView) {
        let mut inner = self.inner.lock();
        inner
            .get_or_insert_with(|| LruCache::new(self.max_bytes))
            .insert(key, value);
    }

    pub(crate) fn get(&self, key: &str) -> Option<ByteView> {
        let mut inner = self.inner.lock();
        inner.as_mut()?.get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |lru| lru.len())
    }
}
