use serde::Serialize;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub keys: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

#[derive(Debug)]
struct CacheInner<K, V> {
    entries: HashMap<K, Entry<V>>,
    hits: u64,
    misses: u64,
}

/// Time-bounded cache for pipeline fetch results. Expired entries are dropped
/// lazily on access.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    default_ttl: Duration,
    inner: Mutex<CacheInner<K, V>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        let CacheInner {
            entries,
            hits,
            misses,
        } = &mut *guard;

        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                *hits += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                *misses += 1;
                None
            }
            None => {
                *misses += 1;
                None
            }
        }
    }

    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let mut guard = self.inner.lock().expect("cache mutex poisoned");
        guard.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .expect("cache mutex poisoned")
            .entries
            .clear();
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.inner.lock().expect("cache mutex poisoned");
        CacheStats {
            keys: guard.entries.len(),
            hits: guard.hits,
            misses: guard.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(300));
        cache.set("bitcoin".to_string(), 7);
        assert_eq!(cache.get(&"bitcoin".to_string()), Some(7));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.get(&"bitcoin".to_string()), None);
        assert_eq!(cache.stats().keys, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn per_entry_ttl_overrides_default() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(300));
        cache.set_with_ttl("options".to_string(), 1, Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cache.get(&"options".to_string()), None);
    }

    #[tokio::test]
    async fn stats_count_hits_and_misses() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(300));
        cache.set("a".to_string(), 1);
        cache.get(&"a".to_string());
        cache.get(&"a".to_string());
        cache.get(&"missing".to_string());

        let stats = cache.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn clear_flushes_all_entries() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(300));
        cache.set("a".to_string(), 1);
        cache.set("b".to_string(), 2);
        cache.clear();
        assert_eq!(cache.stats().keys, 0);
        assert_eq!(cache.get(&"a".to_string()), None);
    }
}
