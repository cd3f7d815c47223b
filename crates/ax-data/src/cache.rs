use ax_types::PriceSeries;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::providers::FetchRequest;

/// Cached series with access metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    series: PriceSeries,
    last_accessed: DateTime<Utc>,
    access_count: u64,
}

impl CacheEntry {
    fn new(series: PriceSeries) -> Self {
        Self {
            series,
            last_accessed: Utc::now(),
            access_count: 0,
        }
    }

    fn access(&mut self) {
        self.last_accessed = Utc::now();
        self.access_count += 1;
    }
}

/// In-memory cache of normalized series keyed by request window
#[derive(Debug)]
pub struct SeriesCache {
    cache: DashMap<FetchRequest, RwLock<CacheEntry>>,
    max_entries: usize,
    stats: RwLock<CacheStats>,
}

impl SeriesCache {
    pub fn new() -> Self {
        Self::with_limit(256)
    }

    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn get(&self, request: &FetchRequest) -> Option<PriceSeries> {
        if let Some(entry_lock) = self.cache.get(request) {
            let mut entry = entry_lock.write();
            entry.access();
            self.stats.write().hits += 1;
            return Some(entry.series.clone());
        }

        self.stats.write().misses += 1;
        None
    }

    pub fn store(&self, request: &FetchRequest, series: &PriceSeries) {
        if series.is_empty() {
            return;
        }

        if self.cache.len() >= self.max_entries && !self.cache.contains_key(request) {
            self.evict_lru();
        }

        self.cache.insert(request.clone(), RwLock::new(CacheEntry::new(series.clone())));

        let mut stats = self.stats.write();
        stats.stores += 1;
        stats.total_rows_cached += series.len() as u64;
    }

    /// Evict the least recently used tenth of the entries (at least one)
    fn evict_lru(&self) {
        let to_remove = (self.cache.len() / 10).max(1);
        let mut candidates: Vec<(FetchRequest, DateTime<Utc>)> = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().read().last_accessed))
            .collect();

        candidates.sort_by(|a, b| a.1.cmp(&b.1));

        for (key, _) in candidates.into_iter().take(to_remove) {
            if let Some((_, entry_lock)) = self.cache.remove(&key) {
                let entry = entry_lock.into_inner();
                let mut stats = self.stats.write();
                stats.evictions += 1;
                stats.total_rows_cached = stats.total_rows_cached.saturating_sub(entry.series.len() as u64);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&self) {
        self.cache.clear();
        *self.stats.write() = CacheStats::default();
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl Default for SeriesCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub total_rows_cached: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_types::{Interval, PriceRow};
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    fn series() -> PriceSeries {
        PriceSeries::new("BTC", Interval::Day, vec![PriceRow::new(day(1), 1.0, 2.0, 0.5, 1.5, 10.0)]).unwrap()
    }

    #[test]
    fn test_cache_basic_operations() {
        let cache = SeriesCache::new();
        let request = FetchRequest::new("BTC", Interval::Day, day(1), day(2));

        assert!(cache.get(&request).is_none());
        cache.store(&request, &series());
        assert_eq!(cache.get(&request).unwrap().len(), 1);

        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.stores, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cache_evicts_when_full() {
        let cache = SeriesCache::with_limit(2);
        for d in 1..=3 {
            let request = FetchRequest::new("BTC", Interval::Day, day(d), day(d + 1));
            cache.store(&request, &series());
        }
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_empty_series_not_cached() {
        let cache = SeriesCache::new();
        let request = FetchRequest::new("BTC", Interval::Day, day(1), day(2));
        cache.store(&request, &PriceSeries::new("BTC", Interval::Day, Vec::new()).unwrap());
        assert!(cache.is_empty());
    }
}
