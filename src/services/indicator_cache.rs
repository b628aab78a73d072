use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

pub const DEFAULT_MAX_SIZE: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    value: Value,
    expires_at: Instant,
    /// Position in the LRU order; larger is more recent
    recency: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    lru: BTreeMap<u64, String>,
    next_recency: u64,
    /// ticker -> cache keys
    ticker_index: HashMap<String, HashSet<String>>,
    /// cache key -> (ticker, indicator)
    key_meta: HashMap<String, (String, String)>,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl CacheInner {
    fn touch(&mut self, key: &str) {
        let recency = self.next_recency;
        self.next_recency += 1;

        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.recency);
            entry.recency = recency;
            self.lru.insert(recency, key.to_string());
        }
    }

    /// Drop a key from the entries, the LRU order and both side indexes.
    fn remove_key(&mut self, key: &str) -> bool {
        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        self.lru.remove(&entry.recency);

        if let Some((ticker, _)) = self.key_meta.remove(key) {
            if let Some(keys) = self.ticker_index.get_mut(&ticker) {
                keys.remove(key);
                if keys.is_empty() {
                    self.ticker_index.remove(&ticker);
                }
            }
        }
        true
    }

    fn evict_lru(&mut self) -> bool {
        match self.lru.first_key_value() {
            Some((_, key)) => {
                let key = key.clone();
                self.remove_key(&key)
            }
            None => false,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
    pub max_size: usize,
    pub indexed_tickers: usize,
    pub hit_rate: f64,
}

/// Thread-safe TTL + LRU cache for indicator computations keyed by
/// (ticker, indicator, params).
///
/// A secondary index maps each ticker to its keys so
/// [`IndicatorResultCache::invalidate`] never scans the whole cache. Every
/// public method holds the single inner lock for its whole duration.
pub struct IndicatorResultCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    default_ttl: Duration,
}

impl Default for IndicatorResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_TTL)
    }
}

impl IndicatorResultCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    /// Deterministic key: SHA-256 over `TICKER:indicator:params`, where
    /// params are serialized with sorted object keys.
    pub fn cache_key(ticker: &str, indicator: &str, params: &Value) -> String {
        let material = format!(
            "{}:{}:{}",
            ticker.trim().to_uppercase(),
            indicator.trim().to_lowercase(),
            canonical_params(params)
        );
        hex::encode(Sha256::digest(material.as_bytes()))
    }

    pub fn get(&self, ticker: &str, indicator: &str, params: &Value) -> Option<Value> {
        let key = Self::cache_key(ticker, indicator, params);
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(&key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.expires_at <= Instant::now(),
        };

        if expired {
            inner.remove_key(&key);
            inner.expirations += 1;
            inner.misses += 1;
            return None;
        }

        inner.touch(&key);
        inner.hits += 1;
        inner.entries.get(&key).map(|entry| entry.value.clone())
    }

    /// Insert or refresh an entry. `ttl` defaults to the cache-wide TTL.
    pub fn set(&self, ticker: &str, indicator: &str, params: &Value, value: Value, ttl: Option<Duration>) {
        let ticker = ticker.trim().to_uppercase();
        let indicator = indicator.trim().to_lowercase();
        let key = Self::cache_key(&ticker, &indicator, params);
        let expires_at = Instant::now() + ttl.unwrap_or(self.default_ttl);

        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            inner.touch(&key);
            return;
        }

        let recency = inner.next_recency;
        inner.next_recency += 1;
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at,
                recency,
            },
        );
        inner.lru.insert(recency, key.clone());
        inner
            .ticker_index
            .entry(ticker.clone())
            .or_default()
            .insert(key.clone());
        inner.key_meta.insert(key, (ticker, indicator));

        while inner.entries.len() > self.max_size {
            if !inner.evict_lru() {
                break;
            }
            inner.evictions += 1;
        }
    }

    /// Remove every entry for `ticker`, or only those for `indicator` when
    /// given. Returns the number of entries removed.
    pub fn invalidate(&self, ticker: &str, indicator: Option<&str>) -> usize {
        let ticker = ticker.trim().to_uppercase();
        let indicator = indicator.map(|name| name.trim().to_lowercase());
        let mut inner = self.inner.lock();

        let Some(keys) = inner.ticker_index.get(&ticker) else {
            return 0;
        };

        let targets: Vec<String> = keys
            .iter()
            .filter(|key| match &indicator {
                None => true,
                Some(wanted) => inner
                    .key_meta
                    .get(*key)
                    .map(|(_, name)| name == wanted)
                    .unwrap_or(false),
            })
            .cloned()
            .collect();

        targets.iter().filter(|key| inner.remove_key(key)).count()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let removed = expired.iter().filter(|key| inner.remove_key(key)).count();
        inner.expirations += removed as u64;
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.ticker_index.clear();
        inner.key_meta.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys currently indexed for `ticker`
    pub fn indexed_keys(&self, ticker: &str) -> usize {
        self.inner
            .lock()
            .ticker_index
            .get(&ticker.trim().to_uppercase())
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            expirations: inner.expirations,
            size: inner.entries.len(),
            max_size: self.max_size,
            indexed_tickers: inner.ticker_index.len(),
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    #[cfg(test)]
    fn has_metadata(&self, key: &str) -> bool {
        let inner = self.inner.lock();
        inner.key_meta.contains_key(key)
            || inner.ticker_index.values().any(|keys| keys.contains(key))
    }
}

/// Missing params and `{}` hash the same.
fn canonical_params(params: &Value) -> String {
    match params {
        Value::Null => "{}".to_string(),
        other => canonical_json(other),
    }
}

/// JSON text with object keys sorted at every depth
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| format!("{}:{}", Value::String(key.clone()), canonical_json(&map[key])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
