//! Process-wide cache with LRU eviction and per-fingerprint single-flight
//! (spec §5): "a process-wide in-memory cache with LRU eviction sized by a
//! configured byte budget; the cache guarantees at-most-one concurrent build
//! per fingerprint via a per-key single-flight latch."
//!
//! The single-flight guarantee comes from `tokio::sync::OnceCell`: every
//! concurrent caller for the same fingerprint awaits the same cell, so the
//! builder future genuinely runs once no matter how many callers race for it.
//! `lru::LruCache` (grounded in the `surrealdb` example's dependency on the
//! same crate) tracks recency; eviction walks from the back until the
//! configured byte budget is satisfied again.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tokio::sync::OnceCell;

pub type Fingerprint = u64;

#[derive(Clone)]
struct Entry {
    bytes: Arc<Vec<u8>>,
}

impl Entry {
    fn weight(&self) -> usize {
        self.bytes.len()
    }
}

/// One cache slot: the value (built at most once) plus whether its weight
/// has already been charged against the byte budget.
struct Slot {
    cell: OnceCell<Entry>,
    accounted: AtomicBool,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cell: OnceCell::new(),
            accounted: AtomicBool::new(false),
        })
    }
}

struct Inner {
    slots: LruCache<Fingerprint, Arc<Slot>>,
    bytes_used: usize,
}

/// A process-wide cache keyed by an opaque fingerprint (e.g. a hash of an
/// operator's configuration and the byte range it reads). Cheaply cloneable;
/// one instance is shared across every pipeline in the process.
#[derive(Clone)]
pub struct ProcessCache {
    inner: Arc<Mutex<Inner>>,
    byte_budget: usize,
}

impl ProcessCache {
    pub fn new(byte_budget: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                slots: LruCache::new(NonZeroUsize::new(usize::MAX).expect("usize::MAX is nonzero")),
                bytes_used: 0,
            })),
            byte_budget,
        }
    }

    /// Returns the cached bytes for `fingerprint`, running `build` at most
    /// once across all concurrent callers if the fingerprint is unseen or
    /// was evicted.
    pub async fn get_or_build<F, Fut>(&self, fingerprint: Fingerprint, build: F) -> Arc<Vec<u8>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Vec<u8>>,
    {
        let slot = {
            let mut inner = self.inner.lock().expect("cache lock poisoned");
            if let Some(slot) = inner.slots.get(&fingerprint) {
                slot.clone()
            } else {
                let slot = Slot::new();
                inner.slots.put(fingerprint, slot.clone());
                slot
            }
        };

        let entry = slot
            .cell
            .get_or_init(|| async move {
                let bytes = build().await;
                Entry {
                    bytes: Arc::new(bytes),
                }
            })
            .await
            .clone();

        if !slot.accounted.swap(true, Ordering::AcqRel) {
            self.charge_and_evict(entry.weight());
        }

        entry.bytes
    }

    fn charge_and_evict(&self, weight: usize) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.bytes_used = inner.bytes_used.saturating_add(weight);
        while inner.bytes_used > self.byte_budget {
            match inner.slots.pop_lru() {
                Some((_, evicted)) => {
                    if let Some(evicted_entry) = evicted.cell.get() {
                        inner.bytes_used = inner.bytes_used.saturating_sub(evicted_entry.weight());
                    }
                }
                None => break,
            }
        }
    }

    /// Number of fingerprints currently tracked, including in-flight builds.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[tokio::test]
    async fn concurrent_callers_share_one_build() {
        let cache = ProcessCache::new(1024);
        let build_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let build_count = build_count.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build(42, || async move {
                        build_count.fetch_add(1, AtomicOrdering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        vec![1, 2, 3]
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(build_count.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eviction_respects_byte_budget() {
        let cache = ProcessCache::new(10);
        cache.get_or_build(1, || async { vec![0u8; 6] }).await;
        cache.get_or_build(2, || async { vec![0u8; 6] }).await;
        assert_eq!(cache.len(), 1);
    }
}
