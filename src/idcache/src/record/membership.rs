//! Per-record group membership indices

use super::{IdentityRecord, RecordId};
use crate::index::MultiKeyIndex;
use crate::types::{IndexKey, KeyType};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A principal's resolved groups, indexed by group GUID, SID and gid
pub struct MembershipSet {
    by_guid: MultiKeyIndex,
    by_sid: MultiKeyIndex,
    by_gid: MultiKeyIndex,
}

impl MembershipSet {
    pub fn new() -> Self {
        Self {
            by_guid: MultiKeyIndex::new(KeyType::Guid),
            by_sid: MultiKeyIndex::new(KeyType::Sid),
            by_gid: MultiKeyIndex::new(KeyType::Gid),
        }
    }

    fn indices(&self) -> [&MultiKeyIndex; 3] {
        [&self.by_guid, &self.by_sid, &self.by_gid]
    }

    fn index_for(&self, key_type: KeyType) -> Option<&MultiKeyIndex> {
        match key_type {
            KeyType::Guid => Some(&self.by_guid),
            KeyType::Sid => Some(&self.by_sid),
            KeyType::Gid => Some(&self.by_gid),
            _ => None,
        }
    }

    /// File `group` under every index its attributes qualify it for
    ///
    /// The returned "new" signal comes from the first index the group has a
    /// key for (GUID, then SID, then gid).
    pub fn add(&self, group: &Arc<IdentityRecord>) -> bool {
        let mut is_new = None;
        for index in self.indices() {
            if let Some(keys) = group.keys_for(index.key_type()) {
                let filing = index.add_keyed(group, &keys, false);
                is_new.get_or_insert(filing.filed);
            }
        }
        is_new.unwrap_or(false)
    }

    /// Whether any of `group`'s GUID/SID/gid keys is present
    pub fn contains(&self, group: &IdentityRecord) -> bool {
        self.indices().into_iter().any(|index| {
            group
                .keys_for(index.key_type())
                .is_some_and(|keys| keys.iter().any(|key| index.contains_key(key)))
        })
    }

    /// Whether a group with `key` is present in the index for `key_type`
    pub fn contains_key(&self, key_type: KeyType, key: &IndexKey) -> bool {
        self.index_for(key_type)
            .is_some_and(|index| index.contains_key(key))
    }

    /// Distinct groups across all three indices
    pub fn groups(&self) -> Vec<Arc<IdentityRecord>> {
        let mut distinct: BTreeMap<RecordId, Arc<IdentityRecord>> = BTreeMap::new();
        for index in self.indices() {
            for group in index.snapshot() {
                distinct.entry(group.id()).or_insert(group);
            }
        }
        distinct.into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.groups().len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices().into_iter().all(|index| index.is_empty())
    }

    pub fn clear(&self) {
        for index in self.indices() {
            index.clear();
        }
    }

    /// Wholesale replacement with the contents of `other`
    pub(crate) fn replace_with(&self, other: &MembershipSet) {
        self.by_guid.replace_with(&other.by_guid);
        self.by_sid.replace_with(&other.by_sid);
        self.by_gid.replace_with(&other.by_gid);
    }
}

impl Default for MembershipSet {
    fn default() -> Self {
        Self::new()
    }
}
