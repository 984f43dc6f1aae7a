//! In-process cache of committed event ids
//!
//! Only a shortcut in front of the event log's unique index. Clearing it,
//! or never filling it, changes latency and nothing else.

use std::collections::{HashSet, VecDeque};
use tokio::sync::RwLock;

#[derive(Default)]
struct CacheInner {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded FIFO set of event ids the store has confirmed
pub struct DedupCache {
    capacity: usize,
    inner: RwLock<CacheInner>,
}

impl DedupCache {
    /// Capacity 0 disables the cache
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(CacheInner::default()),
        }
    }

    pub async fn contains(&self, event_id: &str) -> bool {
        self.inner.read().await.ids.contains(event_id)
    }

    /// Remember an id the store has committed or reported as a duplicate
    pub async fn insert(&self, event_id: &str) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.write().await;
        if !inner.ids.insert(event_id.to_string()) {
            return;
        }
        inner.order.push_back(event_id.to_string());

        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.ids.remove(&evicted);
            }
        }
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.write().await;
        inner.ids.clear();
        inner.order.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.ids.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evicts_oldest_first() {
        let cache = DedupCache::new(2);
        cache.insert("evt_1").await;
        cache.insert("evt_2").await;
        cache.insert("evt_1").await;
        cache.insert("evt_3").await;

        assert!(!cache.contains("evt_1").await);
        assert!(cache.contains("evt_2").await);
        assert!(cache.contains("evt_3").await);
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_cache() {
        let cache = DedupCache::new(0);
        cache.insert("evt_1").await;
        assert!(!cache.contains("evt_1").await);
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear() {
        let cache = DedupCache::new(10);
        cache.insert("evt_1").await;
        cache.clear().await;
        assert!(!cache.contains("evt_1").await);
    }
}
