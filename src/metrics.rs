//! Cache metrics.
//!
//! Counters are atomics so the shared reader policy can record hits without
//! the shard mutex. Reporting goes through a `BTreeMap` rather than a hash
//! map so metrics always appear in a deterministic order — essential when
//! diffing runs or asserting on output in tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Uniform metrics reporting interface.
pub trait CacheMetrics {
    /// All metrics as key-value pairs, keys sorted alphabetically.
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Identifies the cache flavor (e.g. "ShardedLRU").
    fn algorithm_name(&self) -> &'static str;
}

/// Per-shard operation counters.
#[derive(Debug, Default)]
pub(crate) struct CoreMetrics {
    /// Finds that returned a value.
    cache_hits: AtomicU64,
    /// Finds that came back empty.
    cache_misses: AtomicU64,
    /// Successful inserts (duplicates excluded).
    insertions: AtomicU64,
    /// Capacity evictions (explicit removes excluded).
    evictions: AtomicU64,
}

impl CoreMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_insertion(&self) {
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds this shard's counters into an aggregate map.
    pub(crate) fn accumulate(&self, into: &mut BTreeMap<String, f64>) {
        let hits = self.cache_hits.load(Ordering::Relaxed) as f64;
        let misses = self.cache_misses.load(Ordering::Relaxed) as f64;
        *into.entry(String::from("cache_hits")).or_insert(0.0) += hits;
        *into.entry(String::from("cache_misses")).or_insert(0.0) += misses;
        *into.entry(String::from("requests")).or_insert(0.0) += hits + misses;
        *into.entry(String::from("insertions")).or_insert(0.0) +=
            self.insertions.load(Ordering::Relaxed) as f64;
        *into.entry(String::from("evictions")).or_insert(0.0) +=
            self.evictions.load(Ordering::Relaxed) as f64;
    }
}

/// Derives `hit_rate` / `miss_rate` from an aggregate produced by
/// [`CoreMetrics::accumulate`].
pub(crate) fn finish_rates(aggregate: &mut BTreeMap<String, f64>) {
    let requests = aggregate.get("requests").copied().unwrap_or(0.0);
    if requests > 0.0 {
        let hits = aggregate.get("cache_hits").copied().unwrap_or(0.0);
        aggregate.insert(String::from("hit_rate"), hits / requests);
        aggregate.insert(String::from("miss_rate"), (requests - hits) / requests);
    }
}
