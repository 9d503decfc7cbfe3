//! Shared resolution counters

use dashmap::DashMap;

pub(crate) const HITS: &str = "hits";
pub(crate) const MISSES: &str = "misses";
pub(crate) const NEGATIVE_HITS: &str = "negative_hits";
pub(crate) const DIRECTORY_LOOKUPS: &str = "directory_lookups";
pub(crate) const DIRECTORY_FAILURES: &str = "directory_failures";
pub(crate) const REVERIFIES: &str = "reverifies";
pub(crate) const EVICTIONS: &str = "evictions";
pub(crate) const REPLACEMENTS: &str = "replacements";
pub(crate) const CONFLICTS: &str = "conflicts";

/// Counter set shared by the cache and both resolvers
#[derive(Debug, Default)]
pub struct Stats {
    counters: DashMap<String, usize>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment(&self, key: &str) {
        self.add(key, 1);
    }

    pub(crate) fn add(&self, key: &str, n: usize) {
        if n == 0 {
            return;
        }
        self.counters
            .entry(key.to_string())
            .and_modify(|count| *count += n)
            .or_insert(n);
    }

    pub fn get(&self, key: &str) -> usize {
        self.counters.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.counters.clear();
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self, entries: usize, max_entries: usize) -> CacheStats {
        CacheStats {
            hits: self.get(HITS),
            misses: self.get(MISSES),
            negative_hits: self.get(NEGATIVE_HITS),
            directory_lookups: self.get(DIRECTORY_LOOKUPS),
            directory_failures: self.get(DIRECTORY_FAILURES),
            reverifies: self.get(REVERIFIES),
            evictions: self.get(EVICTIONS),
            replacements: self.get(REPLACEMENTS),
            conflicts: self.get(CONFLICTS),
            entries,
            max_entries,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub negative_hits: usize,
    pub directory_lookups: usize,
    pub directory_failures: usize,
    pub reverifies: usize,
    pub evictions: usize,
    pub replacements: usize,
    pub conflicts: usize,
    pub entries: usize,
    pub max_entries: usize,
}

impl CacheStats {
    /// Calculate cache hit rate
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Stats::new();
        stats.increment(HITS);
        stats.increment(HITS);
        stats.increment(MISSES);
        stats.add(EVICTIONS, 0);

        let snapshot = stats.snapshot(3, 10);
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.evictions, 0);
        assert_eq!(snapshot.entries, 3);
        assert!((snapshot.hit_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_empty_hit_rate() {
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}
