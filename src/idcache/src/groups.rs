//! Transitive group membership resolution
//!
//! [`GroupMembershipResolver`] computes a principal's group closure: its
//! primary group, the well-known pseudo-groups, every group listing it
//! directly, and every group nesting one of those, to any depth up to
//! `max_nesting_depth`.
//!
//! # Cycles
//!
//! Every discovered group is added to one closure set owned by the root
//! subject. Adding a group that is already present reports "not new", and
//! only new groups are expanded further, so cyclic nesting terminates with
//! each group present exactly once. The scratch set gives the same "new"
//! answer as [`IdentityRecord::add_to_membership_index`] would on the
//! subject; it is installed with `adopt_memberships` once complete.
//!
//! # Concurrency
//!
//! Resolution is single-flighted per subject through the record's
//! "refresh active" flag. Sibling branches of the nesting graph are expanded
//! concurrently with `FuturesUnordered`; the closure is installed on the
//! subject in one step once every branch has finished.

use crate::config::CacheConfig;
use crate::compat::decode_compat_guid;
use crate::directory::MemberKey;
use crate::error::Result;
use crate::record::{IdentityRecord, MembershipSet};
use crate::resolver::MembershipResolver;
use crate::stats::{Stats, DIRECTORY_FAILURES, DIRECTORY_LOOKUPS};
use crate::types::{KeyType, KeyTypes, RecordClass, ResolveFlags};
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Clears the subject's refresh flag and wakes waiters on every exit path
struct RefreshGuard(Arc<IdentityRecord>);

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.0.finish_refresh();
    }
}

/// Computes and caches group closures
#[derive(Clone)]
pub struct GroupMembershipResolver {
    resolver: MembershipResolver,
    config: Arc<CacheConfig>,
    stats: Arc<Stats>,
}

impl GroupMembershipResolver {
    pub fn new(resolver: MembershipResolver) -> Self {
        let config = Arc::new(resolver.cache().config().clone());
        let stats = Arc::clone(resolver.cache().stats());
        Self {
            resolver,
            config,
            stats,
        }
    }

    /// Make sure `subject`'s memberships are populated
    ///
    /// Invalid memberships are computed before returning; a second caller
    /// arriving mid-computation waits for the first. Valid memberships past
    /// their refresh deadline are recomputed in the background while the
    /// caller proceeds with the current answer.
    pub async fn resolve(&self, subject: &Arc<IdentityRecord>, flags: ResolveFlags) -> Result<()> {
        if subject.is_negative() {
            return Ok(());
        }

        if subject.membership_valid() {
            if Instant::now() >= subject.max_refresh_at() && subject.try_begin_refresh() {
                debug!("Background membership refresh for {:?}", subject.name());
                let this = self.clone();
                let guard = RefreshGuard(Arc::clone(subject));
                tokio::spawn(async move {
                    this.refresh(&guard.0, flags).await;
                    drop(guard);
                });
            }
            return Ok(());
        }

        loop {
            if subject.try_begin_refresh() {
                let _guard = RefreshGuard(Arc::clone(subject));
                self.refresh(subject, flags).await;
                return Ok(());
            }

            subject.wait_for_refresh().await;
            if subject.membership_valid() || !subject.class().is_account_like() {
                return Ok(());
            }
        }
    }

    /// Compute the closure and install it on `subject`
    async fn refresh(&self, subject: &Arc<IdentityRecord>, flags: ResolveFlags) {
        let closure = MembershipSet::new();
        let mut roots = Vec::new();

        if subject.class().is_account_like() {
            if let Some(gid) = subject.primary_group_id() {
                if let Some(group) = self.resolve_group(gid, flags).await {
                    roots.push(group);
                }
            }

            let well_known = self.resolver.well_known();
            let locality = if self.config.is_local_partition(subject.partition()) {
                &well_known.local_accounts
            } else {
                &well_known.network_accounts
            };
            for gid in [well_known.everyone.gid, locality.gid] {
                if let Some(group) = self.resolve_group(gid, flags).await {
                    closure.add(&group);
                }
            }
        }

        roots.extend(self.groups_listing(subject, flags).await);

        let mut branches = FuturesUnordered::new();
        for group in roots {
            if closure.add(&group) {
                branches.push(self.expand(&closure, group, 1, flags));
            }
        }
        while branches.next().await.is_some() {}

        let complete = subject.class().is_account_like();
        subject.adopt_memberships(&closure, complete);
        subject.set_max_refresh_at(Instant::now() + self.config.max_refresh());
        debug!(
            "Resolved {} groups for {:?}{}",
            closure.len(),
            subject.name(),
            if complete { "" } else { " (partial)" }
        );
    }

    /// Add every group nesting `group` to `closure`, recursing into new ones
    fn expand<'a>(
        &'a self,
        closure: &'a MembershipSet,
        group: Arc<IdentityRecord>,
        depth: usize,
        flags: ResolveFlags,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let parents = self.groups_listing(&group, flags).await;
            if parents.is_empty() {
                return;
            }
            if depth >= self.config.max_nesting_depth {
                warn!(
                    "Nesting depth {} reached at {:?}; ignoring {} enclosing groups",
                    depth,
                    group.name(),
                    parents.len()
                );
                return;
            }

            let mut branches = FuturesUnordered::new();
            for parent in parents {
                if closure.add(&parent) {
                    branches.push(self.expand(closure, parent, depth + 1, flags));
                }
            }
            while branches.next().await.is_some() {}
        })
    }

    async fn resolve_group(&self, gid: u32, flags: ResolveFlags) -> Option<Arc<IdentityRecord>> {
        match self.resolver.resolve(KeyType::Gid, &gid.to_string(), flags).await {
            Ok(group) if !group.is_negative() => Some(group),
            Ok(_) => {
                debug!("Group {} does not exist", gid);
                None
            }
            Err(e) => {
                self.stats.increment(DIRECTORY_FAILURES);
                warn!("Failed to resolve group {}: {}", gid, e);
                None
            }
        }
    }

    /// Groups that list `member` by name or by (real) GUID
    async fn groups_listing(&self, member: &IdentityRecord, flags: ResolveFlags) -> Vec<Arc<IdentityRecord>> {
        let mut keys = Vec::with_capacity(2);
        if let Some(name) = member.name() {
            keys.push(MemberKey::Name(name.to_string()));
        }
        if let Some(guid) = member.guid().filter(|guid| decode_compat_guid(guid).is_none()) {
            keys.push(MemberKey::Guid(guid));
        }

        let directory = self.resolver.directory();
        let mut groups = Vec::new();
        for key in keys {
            self.stats.increment(DIRECTORY_LOOKUPS);
            match directory
                .lookup_groups_containing_member(RecordClass::GROUPS, &key)
                .await
            {
                Ok(identities) => {
                    for identity in identities {
                        let record = IdentityRecord::positive(identity, KeyTypes::empty());
                        groups.push(self.resolver.cache().add_or_update(record, flags));
                    }
                }
                Err(e) => {
                    self.stats.increment(DIRECTORY_FAILURES);
                    warn!("Membership query for {} failed: {}", key, e);
                }
            }
        }
        groups
    }
}
