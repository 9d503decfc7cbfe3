//! # Identity Membership Cache
//!
//! Identity and group-membership resolution cache for access-control paths.
//!
//! ## Features
//!
//! - **Seven key spaces** (uid, gid, GUID, SID, name, Kerberos, X.509 DN)
//!   over one set of shared records
//! - **Authority tracking**: a hit through a key the directory never
//!   confirmed is served optimistically and re-verified in the background
//! - **Single-flight** directory fallback per key and membership refresh per
//!   principal
//! - **Negative caching** with its own TTL and node-change reset
//! - **Nested groups** resolved concurrently with cycle and depth guards
//! - **Invalidation events** per record kind over a broadcast channel
//!
//! ## Example
//!
//! ```rust
//! use idcache::{Config, Identity, IdentityService, KeyType, ResolveFlags, StaticDirectory};
//! use idcache::directory::DirectoryEntry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let directory = StaticDirectory::new();
//!     directory.insert_identity(Identity::user("alice", 501).with_partition("/Local"));
//!     directory.insert(
//!         DirectoryEntry::new(Identity::group("developers", 1020).with_partition("/Local"))
//!             .with_member("alice"),
//!     );
//!
//!     let service = IdentityService::new(Config::default(), Arc::new(directory));
//!
//!     let alice = service
//!         .resolve_identity(KeyType::Name, "alice", ResolveFlags::empty())
//!         .await?;
//!     let member = service
//!         .is_member(&alice, KeyType::Name, "developers", ResolveFlags::empty())
//!         .await?;
//!
//!     assert!(member);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod compat;
pub mod config;
pub mod directory;
pub mod error;
pub mod groups;
pub mod identity;
pub mod index;
pub mod record;
pub mod resolver;
pub mod service;
pub mod sid;
pub mod stats;
pub mod temp_id;
pub mod types;
pub mod well_known;

// Re-export commonly used types
pub use cache::{InvalidationEvent, MembershipCache};
pub use config::{CacheConfig, Config, DaemonConfig};
pub use directory::{DirectoryLookup, MemberKey, StaticDirectory};
pub use error::{IdCacheError, Result};
pub use groups::GroupMembershipResolver;
pub use identity::Identity;
pub use index::MultiKeyIndex;
pub use record::{IdentityRecord, MembershipSet, PartitionTokens, RecordId};
pub use resolver::{LookupState, MembershipResolver};
pub use service::IdentityService;
pub use sid::Sid;
pub use stats::{CacheStats, Stats};
pub use temp_id::TemporaryIdAllocator;
pub use types::{IndexKey, KeyType, KeyTypes, KeyValues, RecordClass, RecordKinds, ResolveFlags};
pub use well_known::{PseudoGroup, WellKnown};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
