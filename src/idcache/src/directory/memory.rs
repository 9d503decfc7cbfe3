//! In-memory directory seeded from JSON
//!
//! Backs the daemon's offline mode and the test suite. Partitions carry an
//! availability flag and a validity token that can be flipped and bumped at
//! runtime; lookups and group queries are counted so callers can assert how
//! often the cache fell through.

use super::{DirectoryLookup, MemberKey};
use crate::error::{IdCacheError, Result};
use crate::identity::Identity;
use crate::record::PartitionTokens;
use crate::types::{IndexKey, KeyType, RecordClass};
use anyhow::Context;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

/// One directory object plus the members it lists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    #[serde(flatten)]
    pub identity: Identity,

    /// Member names or GUIDs (groups only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl DirectoryEntry {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            members: Vec::new(),
        }
    }

    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.members.push(member.into());
        self
    }

    fn lists(&self, member: &MemberKey) -> bool {
        self.members.iter().any(|listed| match member {
            MemberKey::Name(name) => listed == name,
            MemberKey::Guid(guid) => uuid::Uuid::parse_str(listed).is_ok_and(|g| g == *guid),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionSeed {
    pub name: String,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default = "default_token")]
    pub token: u64,
}

/// JSON seed document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub partitions: Vec<PartitionSeed>,
    #[serde(default)]
    pub entries: Vec<DirectoryEntry>,
}

fn default_true() -> bool { true }
fn default_token() -> u64 { 1 }

#[derive(Debug, Clone, Copy)]
struct PartitionState {
    available: bool,
    token: u64,
}

/// Directory backed by an in-memory entry list
pub struct StaticDirectory {
    entries: RwLock<Vec<DirectoryEntry>>,
    partitions: DashMap<String, PartitionState>,
    latency: Option<Duration>,
    failure: Mutex<Option<IdCacheError>>,
    lookups: AtomicUsize,
    group_queries: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            partitions: DashMap::new(),
            latency: None,
            failure: Mutex::new(None),
            lookups: AtomicUsize::new(0),
            group_queries: AtomicUsize::new(0),
        }
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let directory = Self::new();
        for partition in seed.partitions {
            directory.partitions.insert(
                partition.name,
                PartitionState {
                    available: partition.available,
                    token: partition.token,
                },
            );
        }
        for entry in seed.entries {
            directory.insert(entry);
        }
        directory
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let seed: DirectorySeed = serde_json::from_str(json)
            .map_err(|e| IdCacheError::Directory(format!("invalid seed: {}", e)))?;
        Ok(Self::from_seed(seed))
    }

    /// Load a JSON seed file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read directory seed {}", path.as_ref().display()))?;
        Self::from_json_str(&contents).context("Failed to parse directory seed")
    }

    /// Delay every lookup and query by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Add an entry, registering its partition if unseen
    pub fn insert(&self, entry: DirectoryEntry) {
        if let Some(partition) = &entry.identity.partition {
            self.partitions
                .entry(partition.clone())
                .or_insert(PartitionState {
                    available: true,
                    token: default_token(),
                });
        }
        self.entries.write().push(entry);
    }

    pub fn insert_identity(&self, identity: Identity) {
        self.insert(DirectoryEntry::new(identity));
    }

    /// Make the group named `group` list `member`
    pub fn add_member(&self, group: &str, member: impl Into<String>) -> bool {
        let mut entries = self.entries.write();
        match entries
            .iter_mut()
            .find(|entry| entry.identity.class.is_group_like() && entry.identity.name.as_deref() == Some(group))
        {
            Some(entry) => {
                entry.members.push(member.into());
                true
            }
            None => false,
        }
    }

    pub fn set_partition_available(&self, partition: &str, available: bool) {
        self.partitions
            .entry(partition.to_string())
            .and_modify(|state| state.available = available)
            .or_insert(PartitionState {
                available,
                token: default_token(),
            });
    }

    /// Invalidate every identity handed out for `partition`
    pub fn bump_partition_token(&self, partition: &str) -> u64 {
        let mut state = self
            .partitions
            .entry(partition.to_string())
            .or_insert(PartitionState {
                available: true,
                token: default_token(),
            });
        state.token += 1;
        state.token
    }

    /// Fail every subsequent call with `failure` (or stop failing)
    pub fn set_failure(&self, failure: Option<IdCacheError>) {
        *self.failure.lock() = failure;
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn group_query_count(&self) -> usize {
        self.group_queries.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.lookups.store(0, Ordering::SeqCst);
        self.group_queries.store(0, Ordering::SeqCst);
    }

    fn is_available(&self, partition: Option<&str>) -> bool {
        partition.map_or(true, |p| self.partitions.get(p).map_or(true, |state| state.available))
    }

    fn offline_partition(&self) -> Option<String> {
        self.partitions
            .iter()
            .find(|state| !state.available)
            .map(|state| state.key().clone())
    }

    fn stamped(&self, identity: &Identity) -> Identity {
        let mut identity = identity.clone();
        identity.partition_token = identity
            .partition
            .as_deref()
            .and_then(|p| self.partition_token(p));
        identity
    }

    async fn simulate_round_trip(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match self.failure.lock().clone() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionTokens for StaticDirectory {
    fn partition_token(&self, partition: &str) -> Option<u64> {
        self.partitions.get(partition).map(|state| state.token)
    }
}

#[async_trait]
impl DirectoryLookup for StaticDirectory {
    async fn lookup_by_key(&self, class_mask: RecordClass, key_type: KeyType, key: &str) -> Result<Identity> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.simulate_round_trip().await?;

        let parsed = IndexKey::parse(key_type, key)?;
        let entries = self.entries.read();
        let mut matches = entries.iter().filter(|entry| {
            entry.identity.class.intersects(class_mask) && entry.identity.matches_key(key_type, &parsed)
        });

        if let Some(entry) = matches.next() {
            let partition = entry.identity.partition.as_deref();
            if !self.is_available(partition) {
                return Err(IdCacheError::Unavailable {
                    partition: partition.unwrap_or_default().to_string(),
                });
            }
            debug!("Directory hit for {} {}", key_type, key);
            return Ok(self.stamped(&entry.identity));
        }

        match self.offline_partition() {
            Some(partition) => Err(IdCacheError::Unavailable { partition }),
            None => Err(IdCacheError::NotFound),
        }
    }

    async fn lookup_groups_containing_member(
        &self,
        class_mask: RecordClass,
        member: &MemberKey,
    ) -> Result<Vec<Identity>> {
        self.group_queries.fetch_add(1, Ordering::SeqCst);
        self.simulate_round_trip().await?;

        let entries = self.entries.read();
        Ok(entries
            .iter()
            .filter(|entry| {
                entry.identity.class.intersects(class_mask)
                    && entry.identity.class.is_group_like()
                    && self.is_available(entry.identity.partition.as_deref())
                    && entry.lists(member)
            })
            .map(|entry| self.stamped(&entry.identity))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: &str = r#"{
        "partitions": [
            { "name": "/Local", "token": 1 },
            { "name": "/LDAP", "token": 5 }
        ],
        "entries": [
            { "class": "USER", "name": "alice", "numeric_id": 501, "primary_group_id": 20, "partition": "/Local" },
            { "class": "GROUP", "name": "staff", "numeric_id": 20, "partition": "/Local", "members": ["alice"] },
            { "class": "GROUP", "name": "engineers", "numeric_id": 1020, "partition": "/LDAP",
              "guid": "6f1c2e4a-0b7d-4c4e-9a55-2f0d1c9e8b11", "members": ["alice"] }
        ]
    }"#;

    #[tokio::test]
    async fn test_lookup_stamps_partition_token() {
        let directory = StaticDirectory::from_json_str(SEED).unwrap();

        let alice = directory
            .lookup_by_key(RecordClass::ACCOUNTS, KeyType::Uid, "501")
            .await
            .unwrap();
        assert_eq!(alice.name.as_deref(), Some("alice"));
        assert_eq!(alice.partition_token, Some(1));

        let engineers = directory
            .lookup_by_key(RecordClass::GROUPS, KeyType::Name, "engineers")
            .await
            .unwrap();
        assert_eq!(engineers.partition_token, Some(5));
        assert_eq!(directory.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_class_mask_filters() {
        let directory = StaticDirectory::from_json_str(SEED).unwrap();

        let err = directory
            .lookup_by_key(RecordClass::GROUPS, KeyType::Name, "alice")
            .await
            .unwrap_err();
        assert_eq!(err, IdCacheError::NotFound);
    }

    #[tokio::test]
    async fn test_offline_partition() {
        let directory = StaticDirectory::from_json_str(SEED).unwrap();
        directory.set_partition_available("/LDAP", false);

        let err = directory
            .lookup_by_key(RecordClass::GROUPS, KeyType::Gid, "1020")
            .await
            .unwrap_err();
        assert_eq!(err, IdCacheError::Unavailable { partition: "/LDAP".to_string() });

        // a miss cannot be authoritative while a partition is down
        let err = directory
            .lookup_by_key(RecordClass::ACCOUNTS, KeyType::Name, "nobody-here")
            .await
            .unwrap_err();
        assert!(matches!(err, IdCacheError::Unavailable { .. }));

        let groups = directory
            .lookup_groups_containing_member(RecordClass::GROUPS, &MemberKey::Name("alice".into()))
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[tokio::test]
    async fn test_groups_by_member_guid() {
        let directory = StaticDirectory::from_json_str(SEED).unwrap();
        let guid = uuid::Uuid::parse_str("6f1c2e4a-0b7d-4c4e-9a55-2f0d1c9e8b11").unwrap();
        directory.insert(
            DirectoryEntry::new(Identity::group("all-staff", 1030).with_partition("/LDAP"))
                .with_member("6F1C2E4A-0B7D-4C4E-9A55-2F0D1C9E8B11"),
        );

        let groups = directory
            .lookup_groups_containing_member(RecordClass::GROUPS, &MemberKey::Guid(guid))
            .await
            .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name.as_deref(), Some("all-staff"));
        assert_eq!(directory.group_query_count(), 1);
    }

    #[tokio::test]
    async fn test_bump_token_and_failure_injection() {
        let directory = StaticDirectory::from_json_str(SEED).unwrap();
        assert_eq!(directory.bump_partition_token("/LDAP"), 6);
        assert_eq!(directory.partition_token("/LDAP"), Some(6));

        directory.set_failure(Some(IdCacheError::Directory("boom".to_string())));
        assert!(directory
            .lookup_by_key(RecordClass::all(), KeyType::Name, "alice")
            .await
            .is_err());

        directory.set_failure(None);
        assert!(directory
            .lookup_by_key(RecordClass::all(), KeyType::Name, "alice")
            .await
            .is_ok());
    }

    #[test]
    fn test_rejects_bad_seed() {
        assert!(matches!(
            StaticDirectory::from_json_str("{ not json"),
            Err(IdCacheError::Directory(_))
        ));
    }
}
