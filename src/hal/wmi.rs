//! Management query cache
//!
//! Vendor management queries (firmware tables, platform methods) are slow
//! and their answers change rarely, so results are cached per
//! `(namespace, query)` with a per-entry TTL:
//! - default TTL 5 minutes, overridable per call
//! - `ttl = 0` bypasses the cache entirely
//! - a background sweep (driven by the very-slow tick) evicts expired rows
//!
//! The query tool itself is a seam: production binds whatever vendor tool
//! the platform ships; tests inject a canned responder.

use crate::error::{EngineError, HwResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// One result row: key/value pairs as returned by the vendor tool.
pub type WmiRecord = HashMap<String, String>;

pub const DEFAULT_WMI_TTL: Duration = Duration::from_secs(300);

/// Executes one management query. Implementations may block; the cache
/// itself never does beyond map locking.
pub trait QueryTool: Send + Sync {
    fn query(&self, namespace: &str, query: &str) -> HwResult<Vec<WmiRecord>>;
}

/// Placeholder tool for machines without a vendor management interface.
pub struct UnavailableQueryTool;

impl QueryTool for UnavailableQueryTool {
    fn query(&self, _namespace: &str, _query: &str) -> HwResult<Vec<WmiRecord>> {
        Err(EngineError::HwUnavailable(
            "no management query tool on this platform".into(),
        ))
    }
}

struct CacheEntry {
    rows: Vec<WmiRecord>,
    expires_at: Instant,
}

/// TTL cache over a `QueryTool`. Writers per key are coalesced: when two
/// callers race to fill the same key, the second result is discarded.
pub struct WmiCache {
    tool: Box<dyn QueryTool>,
    enabled: bool,
    entries: Mutex<HashMap<(String, String), CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl WmiCache {
    pub fn new(enabled: bool) -> Self {
        Self::with_tool(Box::new(UnavailableQueryTool), enabled)
    }

    pub fn with_tool(tool: Box<dyn QueryTool>, enabled: bool) -> Self {
        Self {
            tool,
            enabled,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Query with a caller-chosen TTL. `ttl = 0` (or a disabled cache)
    /// always goes to the tool and does not populate the cache.
    pub fn query(&self, namespace: &str, query: &str, ttl: Duration) -> HwResult<Vec<WmiRecord>> {
        if !self.enabled || ttl.is_zero() {
            return self.tool.query(namespace, query);
        }

        let key = (namespace.to_string(), query.to_string());
        {
            let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&key) {
                if entry.expires_at > Instant::now() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.rows.clone());
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let rows = self.tool.query(namespace, query)?;

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // Coalesce racing writers: keep whichever entry landed first if it
        // is still fresh, otherwise install ours.
        let fresh = entries
            .get(&key)
            .map(|e| e.expires_at > Instant::now())
            .unwrap_or(false);
        if !fresh {
            entries.insert(
                key,
                CacheEntry {
                    rows: rows.clone(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
        Ok(rows)
    }

    /// Query with the default 5-minute TTL.
    pub fn query_default(&self, namespace: &str, query: &str) -> HwResult<Vec<WmiRecord>> {
        self.query(namespace, query, DEFAULT_WMI_TTL)
    }

    /// Evict expired entries. The cache sweeper calls this every 60 s.
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!("Hal: WMI cache sweep evicted {} entries", evicted);
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use std::sync::Arc;

    struct CountingTool {
        calls: Arc<AtomicUsize>,
    }

    impl QueryTool for CountingTool {
        fn query(&self, _namespace: &str, query: &str) -> HwResult<Vec<WmiRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut record = WmiRecord::new();
            record.insert("Query".into(), query.to_string());
            Ok(vec![record])
        }
    }

    fn counting_cache(enabled: bool) -> (WmiCache, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = Box::new(CountingTool {
            calls: calls.clone(),
        });
        (WmiCache::with_tool(tool, enabled), calls)
    }

    #[test]
    fn cache_hit_avoids_second_tool_call() {
        let (cache, calls) = counting_cache(true);
        cache
            .query("root\\wmi", "SELECT * FROM ThermalZone", Duration::from_secs(60))
            .unwrap();
        cache
            .query("root\\wmi", "SELECT * FROM ThermalZone", Duration::from_secs(60))
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn zero_ttl_bypasses_cache() {
        let (cache, calls) = counting_cache(true);
        cache
            .query("root\\wmi", "SELECT * FROM Fan", Duration::ZERO)
            .unwrap();
        cache
            .query("root\\wmi", "SELECT * FROM Fan", Duration::ZERO)
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn disabled_cache_always_queries() {
        let (cache, calls) = counting_cache(false);
        cache.query("ns", "q", Duration::from_secs(60)).unwrap();
        cache.query("ns", "q", Duration::from_secs(60)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let (cache, _) = counting_cache(true);
        cache.query("ns", "short", Duration::from_millis(1)).unwrap();
        cache.query("ns", "long", Duration::from_secs(300)).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn unavailable_tool_propagates_tagged_error() {
        let cache = WmiCache::new(true);
        match cache.query_default("ns", "q") {
            Err(EngineError::HwUnavailable(_)) => {}
            other => panic!("expected HwUnavailable, got {:?}", other),
        }
    }
}
