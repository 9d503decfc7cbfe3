//! Caller-facing identity service
//!
//! Bundles the cache, both resolvers, the temporary id allocator and the
//! directory collaborator behind the operations the RPC and kernel-facing
//! layers use.

use crate::cache::{InvalidationEvent, MembershipCache};
use crate::config::Config;
use crate::directory::DirectoryLookup;
use crate::error::{IdCacheError, Result};
use crate::groups::GroupMembershipResolver;
use crate::record::IdentityRecord;
use crate::resolver::MembershipResolver;
use crate::stats::{CacheStats, Stats};
use crate::temp_id::TemporaryIdAllocator;
use crate::types::{KeyType, RecordClass, RecordKinds, ResolveFlags};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identity resolution and membership service
#[derive(Clone)]
pub struct IdentityService {
    cache: Arc<MembershipCache>,
    resolver: MembershipResolver,
    groups: GroupMembershipResolver,
    config: Arc<Config>,
}

impl IdentityService {
    pub fn new(config: Config, directory: Arc<dyn DirectoryLookup>) -> Self {
        let stats = Arc::new(Stats::new());
        let cache = Arc::new(MembershipCache::with_stats(config.cache.clone(), stats));
        let resolver = MembershipResolver::new(
            Arc::clone(&cache),
            directory,
            Arc::new(TemporaryIdAllocator::new()),
            Arc::new(config.well_known.clone()),
        );
        let groups = GroupMembershipResolver::new(resolver.clone());

        info!(
            "Identity service ready (positive TTL {}s, negative TTL {}s, max {} entries)",
            config.cache.positive_ttl_secs, config.cache.negative_ttl_secs, config.cache.max_entries
        );

        Self {
            cache,
            resolver,
            groups,
            config: Arc::new(config),
        }
    }

    pub fn cache(&self) -> &Arc<MembershipCache> {
        &self.cache
    }

    pub fn resolver(&self) -> &MembershipResolver {
        &self.resolver
    }

    pub fn groups(&self) -> &GroupMembershipResolver {
        &self.groups
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Resolve an identity; a negative answer becomes `NotFound`
    pub async fn resolve_identity(
        &self,
        key_type: KeyType,
        key: &str,
        flags: ResolveFlags,
    ) -> Result<Arc<IdentityRecord>> {
        self.resolve_identity_as(key_type.default_class_mask(), key_type, key, flags)
            .await
    }

    pub async fn resolve_identity_as(
        &self,
        class_mask: RecordClass,
        key_type: KeyType,
        key: &str,
        flags: ResolveFlags,
    ) -> Result<Arc<IdentityRecord>> {
        let record = self
            .resolver
            .resolve_as(class_mask, key_type, key, flags)
            .await?;
        if record.is_negative() {
            return Err(IdCacheError::NotFound);
        }
        Ok(record)
    }

    /// Whether `subject` is a transitive member of the group named by
    /// `group_key`
    pub async fn is_member(
        &self,
        subject: &Arc<IdentityRecord>,
        group_key_type: KeyType,
        group_key: &str,
        flags: ResolveFlags,
    ) -> Result<bool> {
        if subject.is_negative() {
            return Ok(false);
        }
        self.groups.resolve(subject, flags).await?;

        let group = self
            .resolver
            .resolve_as(RecordClass::GROUPS, group_key_type, group_key, flags)
            .await?;
        let member = subject.is_member_of(&group);
        debug!(
            "{:?} member of {} {}: {}",
            subject.name(),
            group_key_type,
            group_key,
            member
        );
        Ok(member)
    }

    /// Resolved groups of `subject`
    pub async fn memberships(
        &self,
        subject: &Arc<IdentityRecord>,
        flags: ResolveFlags,
    ) -> Result<Vec<Arc<IdentityRecord>>> {
        self.groups.resolve(subject, flags).await?;
        Ok(subject.groups())
    }

    /// Returns how many cached records changed
    pub fn notify_node_availability(&self, partition: &str, available: bool) -> usize {
        self.cache.set_node_availability(partition, available)
    }

    pub fn notify_node_set_changed(&self) {
        self.cache.reset_on_node_change();
    }

    pub fn flush_all(&self) {
        self.cache.reset_all();
    }

    /// Evict expired records now
    pub fn sweep(&self) -> RecordKinds {
        self.cache.sweep(Instant::now())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.cache.subscribe()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache
            .stats()
            .snapshot(self.cache.len(), self.config.cache.max_entries)
    }

    /// Sweep every `interval` until the returned task is aborted
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let kinds = service.sweep();
                if !kinds.is_empty() {
                    debug!("Periodic sweep invalidated {:?}", kinds);
                }
            }
        })
    }
}
