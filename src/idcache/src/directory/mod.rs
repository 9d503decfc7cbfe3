//! Directory lookup collaborator
//!
//! The cache never talks to a directory service directly. Everything it needs
//! is behind [`DirectoryLookup`]: authoritative single-identity lookups,
//! "which groups list this member" queries for membership expansion, and a
//! cheap per-partition validity stamp used to decide whether a cached record
//! is still current.

mod memory;

pub use memory::{DirectoryEntry, DirectorySeed, PartitionSeed, StaticDirectory};

use crate::error::Result;
use crate::identity::Identity;
use crate::record::PartitionTokens;
use crate::types::{KeyType, RecordClass};
use async_trait::async_trait;
use std::fmt;
use uuid::Uuid;

/// Key a group lists its members by
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MemberKey {
    Name(String),
    Guid(Uuid),
}

impl fmt::Display for MemberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKey::Name(name) => f.write_str(name),
            MemberKey::Guid(guid) => write!(f, "{}", guid.hyphenated().to_string().to_uppercase()),
        }
    }
}

/// Authoritative identity source behind the cache
///
/// Implementations fill in [`Identity::partition`] and
/// [`Identity::partition_token`] on every identity they return.
#[async_trait]
pub trait DirectoryLookup: PartitionTokens + Send + Sync {
    /// Single identity of a class in `class_mask` answering to `key`
    ///
    /// `Err(NotFound)` is authoritative; `Err(Unavailable)` means the
    /// partition that would answer cannot be reached.
    async fn lookup_by_key(&self, class_mask: RecordClass, key_type: KeyType, key: &str) -> Result<Identity>;

    /// Groups of a class in `class_mask` that list `member` directly
    async fn lookup_groups_containing_member(
        &self,
        class_mask: RecordClass,
        member: &MemberKey,
    ) -> Result<Vec<Identity>>;
}
