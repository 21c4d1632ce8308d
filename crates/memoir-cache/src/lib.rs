//! **memoir-cache** — an in-memory map with dirty-set tracking.
//!
//! Mirrors the `Arc<RwLock<HashMap<..>>>` shape of
//! `toka_store_memory::MemoryBackend`, generalized with the dirty-tracking
//! spec §4.D requires: here the cache is explicitly the "not yet durable"
//! layer sitting in front of a relational backend, rather than being the
//! durable store itself.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::RwLock;

/// A mapping from key to payload, with a parallel set of keys whose current
/// value has not yet been flushed to durable storage.
///
/// `dirty_entries().is_empty()` iff the cache [`is_clean`](Self::is_clean);
/// `commit`-style callers are the only code that should ever clear dirty
/// entries (spec §3 "Cache monotonicity").
#[derive(Debug)]
pub struct KvCache<K, V> {
    entries: Arc<RwLock<HashMap<K, V>>>,
    dirty: Arc<RwLock<HashSet<K>>>,
}

impl<K, V> Clone for KvCache<K, V> {
    fn clone(&self) -> Self {
        KvCache {
            entries: Arc::clone(&self.entries),
            dirty: Arc::clone(&self.dirty),
        }
    }
}

impl<K, V> Default for KvCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KvCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        KvCache {
            entries: Arc::new(RwLock::new(HashMap::new())),
            dirty: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Insert or overwrite `k`, marking it dirty.
    pub async fn set(&self, k: K, v: V) {
        self.entries.write().await.insert(k.clone(), v);
        self.dirty.write().await.insert(k);
    }

    pub async fn get(&self, k: &K) -> Option<V> {
        self.entries.read().await.get(k).cloned()
    }

    pub async fn exists(&self, k: &K) -> bool {
        self.entries.read().await.contains_key(k)
    }

    pub async fn delete(&self, k: &K) {
        self.entries.write().await.remove(k);
        self.dirty.write().await.remove(k);
    }

    pub async fn keys(&self) -> Vec<K> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Keys whose value hasn't yet been flushed to durable storage.
    pub async fn dirty_entries(&self) -> Vec<K> {
        self.dirty.read().await.iter().cloned().collect()
    }

    /// `true` iff there are no dirty entries — i.e. every cached value is
    /// already durable. The only legal transition out of "dirty" is a
    /// caller finishing a commit and calling [`clear_dirty`](Self::clear_dirty).
    pub async fn is_clean(&self) -> bool {
        self.dirty.read().await.is_empty()
    }

    pub async fn clear_dirty(&self) {
        self.dirty.write().await.clear();
    }

    /// Drop every entry (used by `evict_on_commit`). Does not touch the
    /// dirty set — callers evict only after a successful commit has already
    /// cleared it.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_marks_dirty_and_get_roundtrips() {
        let cache: KvCache<String, i32> = KvCache::new();
        cache.set("a".into(), 1).await;
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
        assert!(!cache.is_clean().await);
        assert_eq!(cache.dirty_entries().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn clear_dirty_is_the_only_dirty_to_clean_transition() {
        let cache: KvCache<String, i32> = KvCache::new();
        cache.set("a".into(), 1).await;
        assert!(!cache.is_clean().await);
        cache.clear_dirty().await;
        assert!(cache.is_clean().await);
        // value itself is still resident
        assert_eq!(cache.get(&"a".to_string()).await, Some(1));
    }

    #[tokio::test]
    async fn delete_removes_from_both_maps() {
        let cache: KvCache<String, i32> = KvCache::new();
        cache.set("a".into(), 1).await;
        cache.delete(&"a".to_string()).await;
        assert!(!cache.exists(&"a".to_string()).await);
        assert!(cache.is_clean().await);
    }

    #[tokio::test]
    async fn clear_empties_entries_but_preserves_semantics_of_dirty() {
        let cache: KvCache<String, i32> = KvCache::new();
        cache.set("a".into(), 1).await;
        cache.clear_dirty().await;
        cache.clear().await;
        assert!(!cache.exists(&"a".to_string()).await);
    }
}
