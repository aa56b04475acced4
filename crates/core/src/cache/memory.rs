//! In-memory image cache with a byte budget and LRU eviction.

use lru::LruCache;
use parking_lot::Mutex;

use super::key::ResourceKey;
use crate::asset::Asset;

/// Bounded in-memory cache of decoded images.
///
/// The sum of `Asset::encoded_len` over all entries never exceeds
/// `max_bytes`. All operations take a single lock.
#[derive(Debug)]
pub struct MemoryCache {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    lru: LruCache<ResourceKey, Asset>,
    bytes_in_use: usize,
    max_bytes: usize,
}

impl Inner {
    fn evict_to_budget(&mut self) -> usize {
        let mut evicted = 0;
        while self.bytes_in_use > self.max_bytes {
            match self.lru.pop_lru() {
                Some((_key, removed)) => {
                    self.bytes_in_use = self.bytes_in_use.saturating_sub(removed.encoded_len());
                    evicted += 1;
                }
                None => break,
            }
        }
        evicted
    }
}

impl MemoryCache {
    pub fn new(max_bytes: usize) -> Self {
        Self { inner: Mutex::new(Inner { lru: LruCache::unbounded(), bytes_in_use: 0, max_bytes }) }
    }

    /// Look up an image, marking it most recently used.
    pub fn get(&self, key: &ResourceKey) -> Option<Asset> {
        self.inner.lock().lru.get(key).cloned()
    }

    /// Insert or replace an image, evicting least recently used entries
    /// until the budget holds.
    ///
    /// An image larger than the whole budget is dropped, and so is any
    /// previous entry under the same key.
    pub fn put(&self, key: ResourceKey, asset: Asset) {
        let mut inner = self.inner.lock();
        let size = asset.encoded_len();

        if size > inner.max_bytes {
            tracing::debug!(key = %key, size, max_bytes = inner.max_bytes, "image exceeds memory budget, not cached");
            if let Some(stale) = inner.lru.pop(&key) {
                inner.bytes_in_use = inner.bytes_in_use.saturating_sub(stale.encoded_len());
            }
            return;
        }

        if let Some(previous) = inner.lru.put(key, asset) {
            inner.bytes_in_use = inner.bytes_in_use.saturating_sub(previous.encoded_len());
        }
        inner.bytes_in_use += size;

        let evicted = inner.evict_to_budget();
        if evicted > 0 {
            tracing::debug!(evicted, bytes_in_use = inner.bytes_in_use, "evicted images from memory cache");
        }
    }

    pub fn remove(&self, key: &ResourceKey) -> Option<Asset> {
        let mut inner = self.inner.lock();
        let removed = inner.lru.pop(key)?;
        inner.bytes_in_use = inner.bytes_in_use.saturating_sub(removed.encoded_len());
        Some(removed)
    }

    /// Drop every entry.
    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.lru.clear();
        inner.bytes_in_use = 0;
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.inner.lock().lru.contains(key)
    }

    pub fn max_bytes(&self) -> usize {
        self.inner.lock().max_bytes
    }

    /// Change the budget. Shrinking evicts immediately.
    pub fn set_max_bytes(&self, max_bytes: usize) {
        let mut inner = self.inner.lock();
        inner.max_bytes = max_bytes;
        inner.evict_to_budget();
    }

    /// Sum of the encoded sizes of all cached images.
    pub fn size_bytes(&self) -> usize {
        self.inner.lock().bytes_in_use
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
