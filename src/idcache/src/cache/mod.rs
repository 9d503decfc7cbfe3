//! Multi-key membership cache
//!
//! [`MembershipCache`] owns one [`MultiKeyIndex`] per key type and a recency
//! list over distinct records. A record is in the recency list iff it is
//! filed in at least one index; the list doubles as the LRU order used to
//! bound the cache.
//!
//! # Locking
//!
//! One cache lock serializes structural changes (filing, eviction, trimming)
//! and is never held across a directory call. Index locks are taken one at a
//! time under it. Record locks are never taken while the cache lock is held:
//! filing decisions only use the immutable parts of a record, and operations
//! that must read mutable record state (sweep, soft invalidation, merge)
//! snapshot candidates, release the cache lock, and come back.
//!
//! # Invalidation
//!
//! Every removal reports the record-kind categories it touched on a
//! broadcast channel so downstream name caches can drop their copies.


use crate::compat::compat_guid;
use crate::config::CacheConfig;
use crate::index::MultiKeyIndex;
use crate::record::{IdentityRecord, RecordId, RecordKeys};
use crate::stats::{Stats, CONFLICTS, EVICTIONS, REPLACEMENTS};
use crate::types::{IndexKey, KeyType, RecordClass, RecordKinds, ResolveFlags};
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the invalidation channel
const INVALIDATION_BUFFER: usize = 256;

/// Record-kind categories that lost entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidationEvent {
    pub kinds: RecordKinds,
    pub at: DateTime<Utc>,
}

struct CacheState {
    recency: LruCache<RecordId, Arc<IdentityRecord>>,
    offline: HashSet<String>,
}

/// Shared store of resolved identities
pub struct MembershipCache {
    indices: [MultiKeyIndex; KeyType::COUNT],
    state: Mutex<CacheState>,
    config: CacheConfig,
    stats: Arc<Stats>,
    invalidations: broadcast::Sender<InvalidationEvent>,
}

impl MembershipCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_stats(config, Arc::new(Stats::new()))
    }

    pub fn with_stats(config: CacheConfig, stats: Arc<Stats>) -> Self {
        let (invalidations, _) = broadcast::channel(INVALIDATION_BUFFER);
        Self {
            indices: KeyType::ALL.map(MultiKeyIndex::new),
            state: Mutex::new(CacheState {
                recency: LruCache::unbounded(),
                offline: HashSet::new(),
            }),
            config,
            stats,
            invalidations,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn index(&self, key_type: KeyType) -> &MultiKeyIndex {
        &self.indices[key_type.index()]
    }

    /// Cached record of a class in `class_mask` filed under `key`
    ///
    /// Promotes the record in the recency list.
    pub fn get_and_retain(
        &self,
        class_mask: RecordClass,
        key_type: KeyType,
        key: &IndexKey,
    ) -> Option<Arc<IdentityRecord>> {
        let index = self.index(key_type);
        let found = key
            .lookup_candidates(class_mask)
            .iter()
            .find_map(|candidate| {
                index
                    .get_and_retain(candidate)
                    .filter(|record| record.class().intersects(class_mask))
            })?;

        self.state.lock().recency.get(&found.id());
        Some(found)
    }

    /// File a freshly fetched record, merging it into an existing record for
    /// the same identity
    ///
    /// Returns the record now answering for the lookup: the merged existing
    /// record, the new record, or a retained builtin the new record may not
    /// shadow.
    pub fn add_or_update(&self, mut record: IdentityRecord, flags: ResolveFlags) -> Arc<IdentityRecord> {
        if !record.is_negative() && record.guid().is_none() {
            if let Some(id) = record.numeric_id() {
                let class = record.class();
                record.identity_mut().guid = compat_guid(class, id);
            }
        }

        let now = Instant::now();
        let (expires_at, max_refresh_at) = self.deadlines(&record, flags, now);
        record.set_deadlines(expires_at, max_refresh_at);

        let keys = record.index_keys();
        let lookup = primary_key(&record, &keys);
        let record = Arc::new(record);

        let mut evicted = Vec::new();
        let mut merge_into = None;
        let result = {
            let mut state = self.state.lock();
            let offline = record
                .partition()
                .is_some_and(|partition| state.offline.contains(partition));
            record.set_node_available(!offline);

            let existing = lookup
                .and_then(|(key_type, key)| self.index(key_type).get_and_retain(&key));

            match existing {
                Some(existing) if !existing.class().intersects(record.class()) => {
                    debug!(
                        "Class of {:?} changed from {:?} to {:?}",
                        record.name(),
                        existing.class(),
                        record.class()
                    );
                    self.unfile(&mut state, &existing);
                    evicted.push(existing);
                    self.file(&mut state, &record, &keys, &mut evicted)
                }
                Some(existing) if existing.same_identity(&record) => {
                    state.recency.get(&existing.id());
                    merge_into = Some(Arc::clone(&existing));
                    existing
                }
                Some(existing) if existing.is_builtin() => {
                    // a cached builtin is never displaced, not even by another builtin
                    if record.is_builtin() {
                        self.stats.increment(CONFLICTS);
                    }
                    warn!(
                        "Keeping builtin {:?}; ignoring {:?} from {:?}",
                        existing.name(),
                        record.name(),
                        record.partition()
                    );
                    existing
                }
                Some(existing) => {
                    if existing.is_negative() {
                        debug!("Positive answer supersedes negative entry for {:?}", record.name());
                    } else {
                        info!(
                            "Replacing cached {:?} from {:?} with {:?} from {:?}",
                            existing.name(),
                            existing.partition(),
                            record.name(),
                            record.partition()
                        );
                        self.stats.increment(REPLACEMENTS);
                    }
                    self.unfile(&mut state, &existing);
                    evicted.push(existing);
                    self.file(&mut state, &record, &keys, &mut evicted)
                }
                None => self.file(&mut state, &record, &keys, &mut evicted),
            }
        };

        if let Some(target) = merge_into {
            target.merge(&record, false);
            self.refresh_indices(&target);
        }

        self.trim();
        self.release(evicted);
        result
    }

    fn deadlines(&self, record: &IdentityRecord, flags: ResolveFlags, now: Instant) -> (Instant, Instant) {
        let kernel = flags.contains(ResolveFlags::KERNEL);
        let ttl = match (record.is_negative(), kernel) {
            (true, true) => self.config.negative_ttl().min(self.config.kernel_ttl()),
            (true, false) => self.config.negative_ttl(),
            (false, true) => self.config.kernel_ttl(),
            (false, false) => self.config.positive_ttl(),
        };
        let expires_at = now + ttl;
        if record.is_negative() {
            (expires_at, expires_at)
        } else {
            (expires_at, now + self.config.max_refresh())
        }
    }

    /// File `record` under every key it has; caller holds the cache lock
    fn file(
        &self,
        state: &mut CacheState,
        record: &Arc<IdentityRecord>,
        keys: &RecordKeys,
        evicted: &mut Vec<Arc<IdentityRecord>>,
    ) -> Arc<IdentityRecord> {
        let mut filed = false;
        let mut blocked_by = None;

        for key_type in KeyType::ALL {
            let Some(values) = &keys[key_type.index()] else {
                continue;
            };
            let filing = self.index(key_type).add_keyed(record, values, false);
            filed |= filing.filed;
            self.stats.add(CONFLICTS, filing.conflicts);
            if blocked_by.is_none() {
                blocked_by = filing.blocked_by;
            }
            for displaced in filing.displaced {
                self.unfile(state, &displaced);
                evicted.push(displaced);
            }
        }

        if filed {
            state.recency.put(record.id(), Arc::clone(record));
            Arc::clone(record)
        } else {
            blocked_by.unwrap_or_else(|| Arc::clone(record))
        }
    }

    /// Remove `record` from every index and the recency list
    fn unfile(&self, state: &mut CacheState, record: &IdentityRecord) {
        for index in &self.indices {
            index.remove(record);
        }
        state.recency.pop(&record.id());
    }

    /// LRU trim down to `max_entries`
    fn trim(&self) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            while state.recency.len() > self.config.max_entries {
                let Some((_, oldest)) = state.recency.pop_lru() else {
                    break;
                };
                for index in &self.indices {
                    index.remove(&oldest);
                }
                evicted.push(oldest);
            }
        }
        if !evicted.is_empty() {
            debug!("Trimmed {} least recently used records", evicted.len());
        }
        self.release(evicted);
    }

    /// Reset evicted records and report their kinds
    fn release(&self, evicted: Vec<Arc<IdentityRecord>>) -> RecordKinds {
        let mut kinds = RecordKinds::empty();
        for record in &evicted {
            kinds |= record.kinds();
            record.reset_membership();
        }
        self.stats.add(EVICTIONS, evicted.len());
        self.notify(kinds);
        kinds
    }

    fn notify(&self, kinds: RecordKinds) {
        if kinds.is_empty() {
            return;
        }
        // no subscribers is fine
        let _ = self.invalidations.send(InvalidationEvent {
            kinds,
            at: Utc::now(),
        });
    }

    /// Re-file `record` under its current keys
    ///
    /// Used after an in-place merge changed which keys the record has.
    pub fn refresh_indices(&self, record: &Arc<IdentityRecord>) {
        let keys = record.index_keys();
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            if !state.recency.contains(&record.id()) {
                return;
            }
            for key_type in KeyType::ALL {
                let index = self.index(key_type);
                index.remove(record);
                let Some(values) = &keys[key_type.index()] else {
                    continue;
                };
                let filing = index.add_keyed(record, values, false);
                self.stats.add(CONFLICTS, filing.conflicts);
                for displaced in filing.displaced {
                    self.unfile(&mut state, &displaced);
                    evicted.push(displaced);
                }
            }
            if !self.indices.iter().any(|index| index.contains_record(record.id())) {
                state.recency.pop(&record.id());
                evicted.push(Arc::clone(record));
            }
        }
        self.release(evicted);
    }

    /// Evict one record
    pub fn evict(&self, record: &IdentityRecord) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(removed) = state.recency.peek(&record.id()).cloned() else {
                return false;
            };
            self.unfile(&mut state, &removed);
            removed
        };
        self.release(vec![removed]);
        true
    }

    /// Evict every record past its deadline
    ///
    /// Host records and records of offline partitions are skipped. Returns
    /// the kinds touched (also broadcast).
    pub fn sweep(&self, now: Instant) -> RecordKinds {
        let candidates: Vec<Arc<IdentityRecord>> = {
            let state = self.state.lock();
            state
                .recency
                .iter()
                .map(|(_, record)| record)
                .filter(|record| !record.bypasses_date_checks())
                .filter(|record| {
                    !record
                        .partition()
                        .is_some_and(|partition| state.offline.contains(partition))
                })
                .cloned()
                .collect()
        };

        let expired: Vec<_> = candidates
            .into_iter()
            .filter(|record| record.is_expired(now))
            .collect();
        if expired.is_empty() {
            return RecordKinds::empty();
        }

        let mut evicted = Vec::with_capacity(expired.len());
        {
            let mut state = self.state.lock();
            for record in expired {
                if state.recency.contains(&record.id()) {
                    self.unfile(&mut state, &record);
                    evicted.push(record);
                }
            }
        }

        debug!("Sweep evicted {} records", evicted.len());
        self.release(evicted)
    }

    /// Flip availability on every record of `partition`
    ///
    /// Linear in the number of cached records. Returns how many changed.
    pub fn set_node_availability(&self, partition: &str, available: bool) -> usize {
        let mut state = self.state.lock();
        if available {
            state.offline.remove(partition);
        } else {
            state.offline.insert(partition.to_string());
        }

        let changed = state
            .recency
            .iter()
            .filter(|(_, record)| record.partition() == Some(partition))
            .filter(|(_, record)| record.set_node_available(available))
            .count();

        info!(
            "Partition {} is {}; {} cached records updated",
            partition,
            if available { "available" } else { "unavailable" },
            changed
        );
        changed
    }

    pub fn is_partition_offline(&self, partition: &str) -> bool {
        self.state.lock().offline.contains(partition)
    }

    /// Directory topology changed: drop negative answers, soft-expire the rest
    pub fn reset_on_node_change(&self) {
        let now = Instant::now();
        let (negatives, positives) = {
            let mut state = self.state.lock();
            let (negatives, positives): (Vec<_>, Vec<_>) = state
                .recency
                .iter()
                .map(|(_, record)| Arc::clone(record))
                .partition(|record| record.is_negative());
            for record in &negatives {
                self.unfile(&mut state, record);
            }
            (negatives, positives)
        };

        for record in &positives {
            record.force_expire(now);
        }
        info!(
            "Node set changed: dropped {} negative entries, expired {}",
            negatives.len(),
            positives.len()
        );
        self.release(negatives);
    }

    /// Drop everything and notify every kind
    pub fn reset_all(&self) {
        let evicted: Vec<_> = {
            let mut state = self.state.lock();
            for index in &self.indices {
                index.clear();
            }
            let evicted = state.recency.iter().map(|(_, record)| Arc::clone(record)).collect();
            state.recency.clear();
            evicted
        };

        info!("Flushed {} cached records", evicted.len());
        for record in &evicted {
            record.reset_membership();
        }
        self.stats.add(EVICTIONS, evicted.len());
        self.notify(RecordKinds::all());
    }

    /// Number of distinct cached records
    pub fn len(&self) -> usize {
        self.state.lock().recency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, record: &IdentityRecord) -> bool {
        self.state.lock().recency.contains(&record.id())
    }

    /// Cached records, most recently used first
    pub fn snapshot(&self) -> Vec<Arc<IdentityRecord>> {
        self.state
            .lock()
            .recency
            .iter()
            .map(|(_, record)| Arc::clone(record))
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.invalidations.subscribe()
    }
}

/// Key to look for an existing record under: the primary authority key type,
/// then GUID, then name
fn primary_key(record: &IdentityRecord, keys: &RecordKeys) -> Option<(KeyType, IndexKey)> {
    let key_of = |key_type: KeyType| {
        keys[key_type.index()]
            .as_ref()
            .and_then(|values| values.first().cloned())
            .map(|key| (key_type, key))
    };

    record
        .found_by()
        .primary()
        .and_then(key_of)
        .or_else(|| key_of(KeyType::Guid))
        .or_else(|| key_of(KeyType::Name))
}
