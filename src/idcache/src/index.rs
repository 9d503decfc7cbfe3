//! Ordered single-key-space index over shared identity records
//!
//! Several `MultiKeyIndex` instances coexist over the same record set, one per
//! [`KeyType`]. Each index serializes its own mutations; keeping the indices
//! consistent with each other is the cache's job.
//!
//! Besides the ordered key map, every index keeps a reverse map from record
//! id to the keys it is filed under, so a record can be removed without
//! re-reading its (mutable) attributes.

use crate::error::IdCacheError;
use crate::record::{IdentityRecord, RecordId};
use crate::types::{IndexKey, KeyType, KeyValues};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct IndexInner {
    entries: BTreeMap<IndexKey, Arc<IdentityRecord>>,
    filed: HashMap<RecordId, Vec<IndexKey>>,
}

impl IndexInner {
    fn file(&mut self, key: IndexKey, record: &Arc<IdentityRecord>) {
        self.filed.entry(record.id()).or_default().push(key.clone());
        self.entries.insert(key, Arc::clone(record));
    }

    fn unfile(&mut self, id: RecordId, key: &IndexKey) {
        if let Some(keys) = self.filed.get_mut(&id) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.filed.remove(&id);
            }
        }
    }
}

/// Outcome of filing a record under its keys
#[derive(Default)]
pub(crate) struct Filing {
    /// At least one key now points at the record
    pub filed: bool,
    /// Records that lost a key to the new one
    pub displaced: Vec<Arc<IdentityRecord>>,
    /// First existing record that kept its key
    pub blocked_by: Option<Arc<IdentityRecord>>,
    /// Genuine conflicts between unrelated positive records
    pub conflicts: usize,
}

/// What to do when a key is already taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collision {
    /// Equivalent record already filed
    Keep,
    Replace,
    /// Non-builtin record tried to take a builtin's key
    Shadowed,
    /// Negative record tried to take a positive record's key
    Stale,
    /// Two unrelated positive records
    Conflict,
}

impl Collision {
    fn between(existing: &IdentityRecord, incoming: &IdentityRecord, replace_existing: bool) -> Self {
        let both_negative = existing.is_negative() && incoming.is_negative();
        let same_source = !existing.is_negative()
            && !incoming.is_negative()
            && existing.same_source_name(incoming);
        if both_negative || same_source {
            return Collision::Keep;
        }

        match (existing.is_builtin(), incoming.is_builtin()) {
            (false, true) => return Collision::Replace,
            (true, false) => return Collision::Shadowed,
            _ => {}
        }

        if replace_existing || (existing.is_negative() && !incoming.is_negative()) {
            Collision::Replace
        } else if incoming.is_negative() {
            Collision::Stale
        } else {
            Collision::Conflict
        }
    }
}

/// Ordered mapping from one key space to identity records
pub struct MultiKeyIndex {
    key_type: KeyType,
    inner: RwLock<IndexInner>,
}

impl MultiKeyIndex {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// File `record` under every key it has for this index
    ///
    /// Returns whether at least one key now points at `record`.
    pub fn add(&self, record: &Arc<IdentityRecord>, replace_existing: bool) -> bool {
        match record.keys_for(self.key_type) {
            Some(keys) => self.add_keyed(record, &keys, replace_existing).filed,
            None => false,
        }
    }

    /// File `record` under precomputed `keys`
    pub(crate) fn add_keyed(
        &self,
        record: &Arc<IdentityRecord>,
        keys: &KeyValues,
        replace_existing: bool,
    ) -> Filing {
        let mut filing = Filing::default();
        let mut inner = self.inner.write();

        for key in keys.iter() {
            let Some(existing) = inner.entries.get(key).cloned() else {
                inner.file(key.clone(), record);
                filing.filed = true;
                continue;
            };
            if Arc::ptr_eq(&existing, record) {
                continue;
            }

            match Collision::between(&existing, record, replace_existing) {
                Collision::Replace => {
                    debug!(
                        "Replacing {} entry {} ({:?} -> {:?})",
                        self.key_type,
                        key,
                        existing.name(),
                        record.name()
                    );
                    inner.unfile(existing.id(), key);
                    inner.file(key.clone(), record);
                    filing.filed = true;
                    if !filing.displaced.iter().any(|d| Arc::ptr_eq(d, &existing)) {
                        filing.displaced.push(existing);
                    }
                }
                Collision::Shadowed => {
                    warn!(
                        "Rejecting {:?} from {:?}: {} key {} belongs to builtin {:?}",
                        record.name(),
                        record.partition(),
                        self.key_type,
                        key,
                        existing.name()
                    );
                    filing.blocked_by.get_or_insert(existing);
                }
                Collision::Conflict => {
                    let conflict = IdCacheError::Conflict {
                        key_type: self.key_type,
                        key: key.to_string(),
                    };
                    warn!(
                        "{}: keeping {:?} from {:?}, rejecting {:?} from {:?}",
                        conflict,
                        existing.name(),
                        existing.partition(),
                        record.name(),
                        record.partition()
                    );
                    filing.conflicts += 1;
                    filing.blocked_by.get_or_insert(existing);
                }
                Collision::Keep | Collision::Stale => {
                    filing.blocked_by.get_or_insert(existing);
                }
            }
        }

        filing
    }

    /// Record filed under `key`, if any
    pub fn get_and_retain(&self, key: &IndexKey) -> Option<Arc<IdentityRecord>> {
        self.inner.read().entries.get(key).cloned()
    }

    pub fn contains_key(&self, key: &IndexKey) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    pub fn contains_record(&self, id: RecordId) -> bool {
        self.inner.read().filed.contains_key(&id)
    }

    /// Unfile `record` from every key it holds in this index
    pub fn remove(&self, record: &IdentityRecord) -> bool {
        let released = {
            let mut inner = self.inner.write();
            let Some(keys) = inner.filed.remove(&record.id()) else {
                return false;
            };
            keys.iter()
                .filter_map(|key| inner.entries.remove(key))
                .collect::<Vec<_>>()
        };
        !released.is_empty()
    }

    /// Adopt entries of `other` whose keys are free here
    ///
    /// Returns the number of keys added.
    pub fn merge(&self, other: &MultiKeyIndex) -> usize {
        let incoming = other.entries();
        let mut inner = self.inner.write();
        let mut added = 0;
        for (key, record) in incoming {
            if !inner.entries.contains_key(&key) {
                inner.file(key, &record);
                added += 1;
            }
        }
        added
    }

    /// Replace every entry with the entries of `other`
    pub(crate) fn replace_with(&self, other: &MultiKeyIndex) {
        let incoming = other.entries();
        let released = {
            let mut inner = self.inner.write();
            let old = std::mem::take(&mut *inner);
            for (key, record) in incoming {
                inner.file(key, &record);
            }
            old
        };
        drop(released);
    }

    /// Distinct records in key order
    pub fn snapshot(&self) -> Vec<Arc<IdentityRecord>> {
        let inner = self.inner.read();
        let mut seen = HashSet::new();
        inner
            .entries
            .values()
            .filter(|record| seen.insert(record.id()))
            .cloned()
            .collect()
    }

    fn entries(&self) -> Vec<(IndexKey, Arc<IdentityRecord>)> {
        self.inner
            .read()
            .entries
            .iter()
            .map(|(key, record)| (key.clone(), Arc::clone(record)))
            .collect()
    }

    /// Number of keys
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Number of distinct records
    pub fn record_count(&self) -> usize {
        self.inner.read().filed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Drop every entry, returning the distinct records that were filed
    pub fn clear(&self) -> Vec<Arc<IdentityRecord>> {
        let old = std::mem::take(&mut *self.inner.write());
        let mut seen = HashSet::new();
        old.entries
            .into_values()
            .filter(|record| seen.insert(record.id()))
            .collect()
    }
}
