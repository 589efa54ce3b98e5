//! Time-to-live cache for computed results
//!
//! Injected where it is needed (the request server holds one) instead of
//! living in a global.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug)]
pub struct SignalCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, V)>>,
}

impl<V: Clone> SignalCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fresh value for `key`, if any
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.lock().ok()?;
        let (stored_at, value) = entries.get(key)?;
        if stored_at.elapsed() < self.ttl {
            debug!("cache hit {}", key);
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.into(), (Instant::now(), value));
        }
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        let ttl = self.ttl;
        entries.retain(|_, (stored_at, _)| stored_at.elapsed() < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_entry_hit() {
        let cache = SignalCache::new(Duration::from_secs(60));
        cache.insert("EURUSD", 42);
        assert_eq!(cache.get("EURUSD"), Some(42));
        assert_eq!(cache.get("GBPUSD"), None);
    }

    #[test]
    fn test_expired_entry_miss_and_purge() {
        let cache = SignalCache::new(Duration::ZERO);
        cache.insert("EURUSD", 1);
        assert_eq!(cache.get("EURUSD"), None);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }
}
