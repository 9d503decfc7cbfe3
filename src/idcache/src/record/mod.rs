//! Cached identity records
//!
//! An [`IdentityRecord`] is one resolved (or negative) principal plus the
//! metadata the cache needs: which key types the directory confirmed it by,
//! its deadlines, its partition's availability, and the record's own group
//! membership indices.
//!
//! # Ownership
//!
//! Records are shared as `Arc<IdentityRecord>` between every
//! [`MultiKeyIndex`](crate::index::MultiKeyIndex) that files them, the
//! cache's recency list, and any caller holding a handle. Reachability from
//! the recency list decides eviction eligibility; the reference count only
//! decides when the memory goes away.
//!
//! # Locking
//!
//! Each record has its own lock guarding attribute merges and membership
//! replacement. It is never held while waiting on the cache lock, and the
//! cache never takes a record lock while holding its own: class, partition,
//! name, negative and builtin are fixed at creation so the cache can make
//! filing decisions without reading mutable state.

mod membership;

#[cfg(test)]
mod tests;

pub use membership::MembershipSet;

use crate::identity::Identity;
use crate::sid::Sid;
use crate::types::{IndexKey, KeyType, KeyTypes, KeyValues, RecordClass, RecordKinds};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use uuid::Uuid;

static NEXT_RECORD_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique handle of one record instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

impl RecordId {
    fn next() -> Self {
        Self(NEXT_RECORD_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Keys a record contributes to each index, by [`KeyType::index`]
pub type RecordKeys = [Option<KeyValues>; KeyType::COUNT];

/// Source of current partition validity stamps
pub trait PartitionTokens {
    /// Current validity stamp of `partition`, if it has one
    fn partition_token(&self, partition: &str) -> Option<u64>;
}

impl PartitionTokens for HashMap<String, u64> {
    fn partition_token(&self, partition: &str) -> Option<u64> {
        self.get(partition).copied()
    }
}

struct RecordState {
    identity: Identity,
    found_by: KeyTypes,
    expires_at: Instant,
    max_refresh_at: Instant,
}

/// One resolved or negative principal
pub struct IdentityRecord {
    id: RecordId,
    class: RecordClass,
    partition: Option<String>,
    name: Option<String>,
    negative: bool,
    builtin: bool,

    state: RwLock<RecordState>,
    memberships: MembershipSet,
    membership_valid: AtomicBool,

    node_available: AtomicBool,
    refresh_active: AtomicBool,
    refresh_done: Notify,
    reverify_scheduled: AtomicU8,
}

impl IdentityRecord {
    fn from_parts(identity: Identity, found_by: KeyTypes, negative: bool) -> Self {
        let now = Instant::now();
        Self {
            id: RecordId::next(),
            class: identity.class,
            partition: identity.partition.clone(),
            name: identity.name.clone(),
            negative,
            builtin: identity.builtin && !negative,
            state: RwLock::new(RecordState {
                identity,
                found_by,
                expires_at: now,
                max_refresh_at: now,
            }),
            memberships: MembershipSet::new(),
            membership_valid: AtomicBool::new(false),
            node_available: AtomicBool::new(true),
            refresh_active: AtomicBool::new(false),
            refresh_done: Notify::new(),
            reverify_scheduled: AtomicU8::new(0),
        }
    }

    /// Record for an identity the directory produced via `found_by`
    ///
    /// Deadlines are assigned when the record is filed in the cache.
    pub fn positive(identity: Identity, found_by: KeyTypes) -> Self {
        Self::from_parts(identity, found_by, false)
    }

    /// "Confirmed not found" record for `key` in the key space `key_type`
    pub fn negative(class: RecordClass, key_type: KeyType, key: &IndexKey) -> Self {
        let mut identity = Identity {
            class,
            ..Default::default()
        };
        match (key_type, key) {
            (_, IndexKey::Id(id)) => identity.numeric_id = Some(*id),
            (_, IndexKey::Guid(guid)) => identity.guid = Some(*guid),
            (_, IndexKey::Sid(sid)) => identity.sid = Some(sid.clone()),
            (_, IndexKey::Name(_, name)) => identity.name = Some(name.clone()),
            (KeyType::X509Dn, IndexKey::Text(dn)) => identity.x509_dns.push(dn.clone()),
            (_, IndexKey::Text(principal)) => identity.kerberos_principals.push(principal.clone()),
        }
        Self::from_parts(identity, key_type.bit(), true)
    }

    pub fn id(&self) -> RecordId {
        self.id
    }

    pub fn class(&self) -> RecordClass {
        self.class
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn partition(&self) -> Option<&str> {
        self.partition.as_deref()
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_builtin(&self) -> bool {
        self.builtin
    }

    /// Snapshot of the identity attributes
    pub fn identity(&self) -> Identity {
        self.state.read().identity.clone()
    }

    pub fn numeric_id(&self) -> Option<u32> {
        self.state.read().identity.numeric_id
    }

    pub fn primary_group_id(&self) -> Option<u32> {
        self.state.read().identity.primary_group_id
    }

    pub fn guid(&self) -> Option<Uuid> {
        self.state.read().identity.guid
    }

    pub fn sid(&self) -> Option<Sid> {
        self.state.read().identity.sid.clone()
    }

    pub fn partition_token(&self) -> Option<u64> {
        self.state.read().identity.partition_token
    }

    /// Key types the directory confirmed this record by
    pub fn found_by(&self) -> KeyTypes {
        self.state.read().found_by
    }

    pub fn expires_at(&self) -> Instant {
        self.state.read().expires_at
    }

    pub fn max_refresh_at(&self) -> Instant {
        self.state.read().max_refresh_at
    }

    pub fn node_available(&self) -> bool {
        self.node_available.load(Ordering::Acquire)
    }

    /// Whether the membership indices hold a completed resolution
    pub fn membership_valid(&self) -> bool {
        self.membership_valid.load(Ordering::Acquire)
    }

    pub fn kinds(&self) -> RecordKinds {
        self.class.kinds()
    }

    /// Host records keep their directory state through offline periods
    pub fn bypasses_date_checks(&self) -> bool {
        !self.negative && self.class.contains(RecordClass::COMPUTER)
    }

    /// Same real-world identity: partition, class, name and polarity match
    pub fn same_identity(&self, other: &IdentityRecord) -> bool {
        self.negative == other.negative
            && self.class == other.class
            && self.partition == other.partition
            && self.name == other.name
    }

    /// Both records carry the same (partition, name) pair
    pub(crate) fn same_source_name(&self, other: &IdentityRecord) -> bool {
        self.name.is_some() && self.name == other.name && self.partition == other.partition
    }

    /// Keys this record is filed under in every index
    ///
    /// Negative records only answer for the key type they were created by.
    pub fn index_keys(&self) -> RecordKeys {
        let state = self.state.read();
        KeyType::ALL.map(|key_type| {
            if self.negative && !state.found_by.contains_type(key_type) {
                return None;
            }
            state.identity.keys_for(key_type)
        })
    }

    /// Keys for a single index
    pub fn keys_for(&self, key_type: KeyType) -> Option<KeyValues> {
        let state = self.state.read();
        if self.negative && !state.found_by.contains_type(key_type) {
            return None;
        }
        state.identity.keys_for(key_type)
    }

    /// Whether the cached answer is still good
    ///
    /// True when no partition token is attached, when the partition is
    /// offline (avoids churn during outages), or when the token still
    /// matches the partition's current stamp and `expires_at` has not passed.
    pub fn validate<T: PartitionTokens + ?Sized>(&self, now: Instant, tokens: &T) -> bool {
        let state = self.state.read();
        let Some(token) = state.identity.partition_token else {
            return true;
        };
        if !self.node_available() {
            return true;
        }

        let current = self
            .partition
            .as_deref()
            .and_then(|partition| tokens.partition_token(partition));
        current == Some(token) && now < state.expires_at
    }

    /// Whether a hit on this record should go back to the directory
    pub fn needs_refresh<T: PartitionTokens + ?Sized>(&self, now: Instant, tokens: &T) -> bool {
        if !self.validate(now, tokens) {
            return true;
        }
        let state = self.state.read();
        (state.identity.partition_token.is_none() && now >= state.expires_at)
            || now >= state.max_refresh_at
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.state.read().expires_at
    }

    /// Copy attributes, deadlines and authority from `source`
    ///
    /// `found_by` bits are unioned. Class, partition, name and builtin are
    /// fixed at creation and are not copied. With `include_memberships` and
    /// a completed resolution on `source`, the membership indices are
    /// replaced wholesale and marked valid. Does not touch any cache index.
    pub fn merge(&self, source: &IdentityRecord, include_memberships: bool) {
        let (mut identity, found_by, expires_at, max_refresh_at) = {
            let source_state = source.state.read();
            (
                source_state.identity.clone(),
                source_state.found_by,
                source_state.expires_at,
                source_state.max_refresh_at,
            )
        };

        let mut state = self.state.write();
        identity.class = self.class;
        identity.name = self.name.clone();
        identity.partition = self.partition.clone();
        identity.builtin = self.builtin;

        state.identity = identity;
        state.found_by |= found_by;
        state.expires_at = expires_at;
        state.max_refresh_at = max_refresh_at;
        self.node_available
            .store(source.node_available(), Ordering::Release);

        if include_memberships && source.membership_valid() && !self.negative {
            self.memberships.replace_with(&source.memberships);
            self.membership_valid.store(true, Ordering::Release);
        }
    }

    /// Record `group` as one of this record's memberships
    ///
    /// Returns false when the group was already present, which is what
    /// stops nested-group expansion on cycles. Negative records never hold
    /// memberships.
    pub fn add_to_membership_index(&self, group: &Arc<IdentityRecord>) -> bool {
        if self.negative {
            return false;
        }
        self.memberships.add(group)
    }

    /// Drop every membership and mark the indices invalid
    pub fn reset_membership(&self) {
        let _state = self.state.write();
        self.memberships.clear();
        self.membership_valid.store(false, Ordering::Release);
    }

    pub fn memberships(&self) -> &MembershipSet {
        &self.memberships
    }

    /// Distinct groups in the membership indices
    pub fn groups(&self) -> Vec<Arc<IdentityRecord>> {
        self.memberships.groups()
    }

    /// Whether `group` is in the membership indices
    pub fn is_member_of(&self, group: &IdentityRecord) -> bool {
        !self.negative && !group.negative && self.memberships.contains(group)
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresh_active.load(Ordering::Acquire)
    }

    pub(crate) fn identity_mut(&mut self) -> &mut Identity {
        &mut self.state.get_mut().identity
    }

    pub(crate) fn set_deadlines(&self, expires_at: Instant, max_refresh_at: Instant) {
        let mut state = self.state.write();
        state.expires_at = expires_at;
        state.max_refresh_at = max_refresh_at;
    }

    /// Soft invalidation: next access revalidates
    pub(crate) fn force_expire(&self, now: Instant) {
        self.state.write().expires_at = now;
    }

    pub(crate) fn set_max_refresh_at(&self, at: Instant) {
        self.state.write().max_refresh_at = at;
    }

    /// Returns whether the flag changed
    pub(crate) fn set_node_available(&self, available: bool) -> bool {
        self.node_available.swap(available, Ordering::AcqRel) != available
    }

    /// Test-and-set of the per-key-type re-verify bit
    pub(crate) fn try_schedule_reverify(&self, key_type: KeyType) -> bool {
        let bit = key_type.bit().bits();
        self.reverify_scheduled.fetch_or(bit, Ordering::AcqRel) & bit == 0
    }

    /// Install a freshly computed closure
    pub(crate) fn adopt_memberships(&self, closure: &MembershipSet, mark_valid: bool) {
        if self.negative {
            return;
        }
        let _state = self.state.write();
        self.memberships.replace_with(closure);
        self.membership_valid.store(mark_valid, Ordering::Release);
    }

    pub(crate) fn try_begin_refresh(&self) -> bool {
        self.refresh_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_refresh(&self) {
        self.refresh_active.store(false, Ordering::Release);
        self.refresh_done.notify_waiters();
    }

    /// Wait until no membership refresh is in flight
    pub(crate) async fn wait_for_refresh(&self) {
        loop {
            let notified = self.refresh_done.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_refreshing() {
                return;
            }
            notified.await;
        }
    }
}

impl fmt::Debug for IdentityRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRecord")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("name", &self.name)
            .field("partition", &self.partition)
            .field("negative", &self.negative)
            .field("builtin", &self.builtin)
            .finish()
    }
}
