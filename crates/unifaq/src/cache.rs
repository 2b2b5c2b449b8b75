//! LRU response cache keyed by the normalized question text. Entries age
//! out after a TTL so answers track the underlying data.

use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

use crate::config::CacheConfig;
use crate::retrieval::normalize_text;
use crate::types::RouterResult;

struct CacheEntry {
    result: RouterResult,
    inserted_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: Duration::from_secs(config.ttl_secs),
        }
    }

    /// Questions differing only in case or punctuation share one entry.
    fn key(question: &str) -> String {
        normalize_text(question)
    }

    pub fn get(&self, question: &str) -> Option<RouterResult> {
        let key = Self::key(question);
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                tracing::debug!(key = %key, "Response cache hit");
                Some(entry.result.clone())
            }
            Some(_) => {
                tracing::debug!(key = %key, "Response cache entry expired");
                entries.pop(&key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, question: &str, result: RouterResult) {
        let key = Self::key(question);
        self.entries.lock().put(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QuestionLabel, RoutePath, Timings};

    fn result(response: &str) -> RouterResult {
        RouterResult {
            response: response.to_string(),
            chosen: RoutePath::Rag,
            ml_model: QuestionLabel::Complex,
            ml_confidence: 0.8,
            query: None,
            fallback: false,
            timings: Timings::default(),
            context_used: 2,
        }
    }

    fn config(capacity: usize, ttl_secs: u64) -> CacheConfig {
        CacheConfig { capacity, ttl_secs }
    }

    #[test]
    fn hit_after_put() {
        let cache = ResponseCache::new(&config(8, 600));
        cache.put("Quanti CFU vale Basi di Dati?", result("6 CFU"));
        let hit = cache.get("Quanti CFU vale Basi di Dati?").unwrap();
        assert_eq!(hit.response, "6 CFU");
    }

    #[test]
    fn punctuation_and_case_share_an_entry() {
        let cache = ResponseCache::new(&config(8, 600));
        cache.put("Quanti CFU vale Basi di Dati?", result("6 CFU"));
        assert!(cache.get("quanti cfu vale basi di dati").is_some());
    }

    #[test]
    fn expired_entries_are_evicted_on_read() {
        let cache = ResponseCache::new(&config(8, 0));
        cache.put("domanda", result("risposta"));
        assert!(cache.get("domanda").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = ResponseCache::new(&config(2, 600));
        cache.put("prima domanda sulle tasse", result("a"));
        cache.put("seconda domanda sul regolamento", result("b"));
        cache.put("terza domanda sugli esami", result("c"));
        assert!(cache.get("prima domanda sulle tasse").is_none());
        assert!(cache.get("terza domanda sugli esami").is_some());
        assert_eq!(cache.len(), 2);
    }
}
