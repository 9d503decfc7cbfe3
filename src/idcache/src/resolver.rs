//! Identity resolution with authority tracking and directory fallback
//!
//! [`MembershipResolver`] answers "which identity does this key name". A
//! lookup walks a small state machine:
//!
//! ```text
//! NotStarted ──► CacheHitAuthoritative ──────────────► Done
//!     │
//!     ├──────► CacheHitUnverified ──► AsyncReverify ──► Done
//!     │                   └──────────────────────────► Done
//!     └──────► DirectoryFallback ─────────────────────► Done
//! ```
//!
//! The consult step runs under one serialized lane: concurrent misses for the
//! same key join a single in-flight directory fallback instead of racing. The
//! lane is never held across the directory round trip.
//!
//! A hit is authoritative when the record was confirmed by the directory via
//! the requested key type (or is negative). Otherwise the cached record is
//! returned immediately and a one-shot background re-verify is scheduled for
//! that key type.

use crate::cache::MembershipCache;
use crate::compat::decode_compat_guid;
use crate::directory::DirectoryLookup;
use crate::error::{IdCacheError, Result};
use crate::identity::Identity;
use crate::record::IdentityRecord;
use crate::stats::{Stats, DIRECTORY_FAILURES, DIRECTORY_LOOKUPS, HITS, MISSES, NEGATIVE_HITS, REVERIFIES};
use crate::temp_id::{TemporaryIdAllocator, TemporaryKey};
use crate::types::{IndexKey, KeyType, KeyTypes, RecordClass, ResolveFlags};
use crate::well_known::WellKnown;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Progress of one lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupState {
    NotStarted,
    CacheHitAuthoritative,
    CacheHitUnverified,
    DirectoryFallback,
    AsyncReverify,
    Done,
}

/// Lookups join one flight only when class mask, key type and key all match;
/// a narrower mask can produce a different answer, so it gets its own flight.
type LaneKey = (RecordClass, KeyType, IndexKey);
type Flight = Arc<OnceCell<Result<Arc<IdentityRecord>>>>;

/// Outcome of consulting the cache
enum Consult {
    Authoritative(Arc<IdentityRecord>),
    Unverified(Arc<IdentityRecord>),
    /// Miss, or a hit that must go back to the directory
    Fallback(Option<Arc<IdentityRecord>>),
}

struct ResolverInner {
    cache: Arc<MembershipCache>,
    directory: Arc<dyn DirectoryLookup>,
    temp_ids: Arc<TemporaryIdAllocator>,
    well_known: Arc<WellKnown>,
    lane: Mutex<HashMap<LaneKey, Flight>>,
    stats: Arc<Stats>,
}

/// Key-to-identity resolver in front of the cache
#[derive(Clone)]
pub struct MembershipResolver {
    inner: Arc<ResolverInner>,
}

impl MembershipResolver {
    pub fn new(
        cache: Arc<MembershipCache>,
        directory: Arc<dyn DirectoryLookup>,
        temp_ids: Arc<TemporaryIdAllocator>,
        well_known: Arc<WellKnown>,
    ) -> Self {
        let stats = Arc::clone(cache.stats());
        Self {
            inner: Arc::new(ResolverInner {
                cache,
                directory,
                temp_ids,
                well_known,
                lane: Mutex::new(HashMap::new()),
                stats,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<MembershipCache> {
        &self.inner.cache
    }

    pub fn directory(&self) -> &Arc<dyn DirectoryLookup> {
        &self.inner.directory
    }

    pub fn well_known(&self) -> &WellKnown {
        &self.inner.well_known
    }

    pub fn temp_ids(&self) -> &TemporaryIdAllocator {
        &self.inner.temp_ids
    }

    /// Resolve `raw_key` in the key space `key_type`
    ///
    /// May return a negative record; `Err` is reserved for malformed keys and
    /// failures with nothing to fall back on.
    pub async fn resolve(&self, key_type: KeyType, raw_key: &str, flags: ResolveFlags) -> Result<Arc<IdentityRecord>> {
        self.resolve_as(key_type.default_class_mask(), key_type, raw_key, flags)
            .await
    }

    /// Resolve restricted to classes in `class_mask`
    pub async fn resolve_as(
        &self,
        class_mask: RecordClass,
        key_type: KeyType,
        raw_key: &str,
        flags: ResolveFlags,
    ) -> Result<Arc<IdentityRecord>> {
        let (class_mask, key_type, key) = self.normalize(class_mask, key_type, raw_key)?;
        let lane_key: LaneKey = (class_mask, key_type, key.clone());

        let mut state = LookupState::NotStarted;
        let mut current: Option<Arc<IdentityRecord>> = None;
        let mut flight: Option<Flight> = None;

        loop {
            state = match state {
                LookupState::NotStarted => {
                    let mut lane = self.inner.lane.lock();
                    match self.consult(class_mask, key_type, &key) {
                        Consult::Authoritative(record) => {
                            current = Some(record);
                            LookupState::CacheHitAuthoritative
                        }
                        Consult::Unverified(record) => {
                            current = Some(record);
                            LookupState::CacheHitUnverified
                        }
                        Consult::Fallback(stale) => {
                            current = stale;
                            flight = Some(Arc::clone(
                                lane.entry(lane_key.clone())
                                    .or_insert_with(|| Arc::new(OnceCell::new())),
                            ));
                            LookupState::DirectoryFallback
                        }
                    }
                }
                LookupState::CacheHitAuthoritative => {
                    let negative = current.as_ref().is_some_and(|record| record.is_negative());
                    self.inner
                        .stats
                        .increment(if negative { NEGATIVE_HITS } else { HITS });
                    LookupState::Done
                }
                LookupState::CacheHitUnverified => {
                    self.inner.stats.increment(HITS);
                    match &current {
                        Some(record) if record.try_schedule_reverify(key_type) => LookupState::AsyncReverify,
                        _ => LookupState::Done,
                    }
                }
                LookupState::AsyncReverify => {
                    if let Some(record) = &current {
                        self.spawn_reverify(record, class_mask, key_type, &key, flags);
                    }
                    LookupState::Done
                }
                LookupState::DirectoryFallback => {
                    self.inner.stats.increment(MISSES);
                    let flight = flight.take().unwrap_or_else(|| Arc::new(OnceCell::new()));
                    let stale = current.take();
                    let result = flight
                        .get_or_init(|| self.fetch(class_mask, key_type, &key, flags, stale))
                        .await
                        .clone();
                    self.land(&lane_key, &flight);
                    return result;
                }
                LookupState::Done => {
                    return current.ok_or(IdCacheError::NotFound);
                }
            };
        }
    }

    /// Parse the key and translate compatibility GUIDs and temporary ids back
    /// to the key they stand for
    fn normalize(
        &self,
        class_mask: RecordClass,
        key_type: KeyType,
        raw_key: &str,
    ) -> Result<(RecordClass, KeyType, IndexKey)> {
        let key = IndexKey::parse(key_type, raw_key)?;

        match &key {
            IndexKey::Guid(guid) => {
                if let Some((class, id)) = decode_compat_guid(guid) {
                    let id_type = if class.is_group_like() { KeyType::Gid } else { KeyType::Uid };
                    debug!("Compatibility GUID {} stands for {} {}", key, id_type, id);
                    return Ok((class, id_type, IndexKey::Id(id)));
                }
            }
            IndexKey::Id(id) if self.inner.temp_ids.is_temporary(*id) => {
                return match self.inner.temp_ids.lookup(*id) {
                    Some(TemporaryKey::Guid(guid)) => Ok((class_mask, KeyType::Guid, IndexKey::Guid(guid))),
                    Some(TemporaryKey::Sid(sid)) => Ok((class_mask, KeyType::Sid, IndexKey::Sid(sid))),
                    None => Err(IdCacheError::NotFound),
                };
            }
            _ => {}
        }

        Ok((class_mask, key_type, key))
    }

    fn consult(&self, class_mask: RecordClass, key_type: KeyType, key: &IndexKey) -> Consult {
        let Some(record) = self.inner.cache.get_and_retain(class_mask, key_type, key) else {
            return Consult::Fallback(None);
        };

        if self.masquerades(&record, key_type, key) {
            debug!(
                "Ignoring non-builtin {:?} cached under reserved {} {}",
                record.name(),
                key_type,
                key
            );
            return Consult::Fallback(None);
        }

        if record.needs_refresh(Instant::now(), self.inner.directory.as_ref()) {
            return Consult::Fallback(Some(record));
        }

        if record.is_negative() || record.found_by().contains_type(key_type) {
            Consult::Authoritative(record)
        } else {
            Consult::Unverified(record)
        }
    }

    /// Non-builtin record answering for a reserved key
    fn masquerades(&self, record: &IdentityRecord, key_type: KeyType, key: &IndexKey) -> bool {
        !record.is_negative() && !record.is_builtin() && self.inner.well_known.is_reserved(key_type, key)
    }

    fn land(&self, lane_key: &LaneKey, flight: &Flight) {
        let mut lane = self.inner.lane.lock();
        if lane.get(lane_key).is_some_and(|current| Arc::ptr_eq(current, flight)) {
            lane.remove(lane_key);
        }
    }

    fn spawn_reverify(
        &self,
        record: &Arc<IdentityRecord>,
        class_mask: RecordClass,
        key_type: KeyType,
        key: &IndexKey,
        flags: ResolveFlags,
    ) {
        self.inner.stats.increment(REVERIFIES);
        debug!("Scheduling {} re-verify of {:?} via {}", key_type, record.name(), key);

        let resolver = self.clone();
        let key = key.to_string();
        let temporary_id = self.temporary_id_of(record);
        tokio::spawn(async move {
            resolver.inner.stats.increment(DIRECTORY_LOOKUPS);
            match resolver
                .inner
                .directory
                .lookup_by_key(class_mask, key_type, &key)
                .await
            {
                Ok(mut identity) => {
                    if identity.numeric_id.is_none() {
                        identity.numeric_id = temporary_id;
                    }
                    resolver
                        .inner
                        .cache
                        .add_or_update(IdentityRecord::positive(identity, key_type.bit()), flags);
                }
                Err(e) => {
                    resolver.inner.stats.increment(DIRECTORY_FAILURES);
                    debug!("Re-verify of {} {} failed: {}", key_type, key, e);
                }
            }
        });
    }

    /// Directory fallback; runs once per in-flight key
    async fn fetch(
        &self,
        class_mask: RecordClass,
        key_type: KeyType,
        key: &IndexKey,
        flags: ResolveFlags,
        stale: Option<Arc<IdentityRecord>>,
    ) -> Result<Arc<IdentityRecord>> {
        if class_mask.is_group_like() {
            if let Some(identity) = self.inner.well_known.pseudo_group_for(key_type, key) {
                let found_by = KeyTypes::GID | KeyTypes::GUID | KeyTypes::SID | KeyTypes::NAME;
                return Ok(self
                    .inner
                    .cache
                    .add_or_update(IdentityRecord::positive(identity, found_by), flags));
            }
        }

        debug!("Directory fallback for {} {}", key_type, key);
        self.inner.stats.increment(DIRECTORY_LOOKUPS);
        let outcome = self
            .inner
            .directory
            .lookup_by_key(class_mask, key_type, &key.to_string())
            .await;

        match outcome {
            Ok(mut identity) => {
                if identity.numeric_id.is_none() {
                    identity.numeric_id = match stale.as_deref().and_then(|r| self.temporary_id_of(r)) {
                        Some(id) => Some(id),
                        None if flags.contains(ResolveFlags::KERNEL) => self.temporary_id_for(&identity),
                        None => None,
                    };
                }
                Ok(self
                    .inner
                    .cache
                    .add_or_update(IdentityRecord::positive(identity, key_type.bit()), flags))
            }
            Err(IdCacheError::NotFound) => {
                self.inner.stats.increment(DIRECTORY_FAILURES);
                Ok(self.negative(class_mask, key_type, key, flags))
            }
            Err(IdCacheError::Unavailable { partition }) => {
                self.inner.stats.increment(DIRECTORY_FAILURES);
                if let Some(stale) = stale {
                    debug!("Partition {} unavailable; serving cached {:?}", partition, stale.name());
                    return Ok(stale);
                }
                if self.inner.cache.is_partition_offline(&partition) {
                    return Err(IdCacheError::Unavailable { partition });
                }
                Ok(self.negative(class_mask, key_type, key, flags))
            }
            Err(err @ IdCacheError::Malformed(_)) => Err(err),
            Err(err) => {
                self.inner.stats.increment(DIRECTORY_FAILURES);
                warn!("Directory lookup of {} {} failed: {}", key_type, key, err);
                stale.ok_or(err)
            }
        }
    }

    fn negative(
        &self,
        class_mask: RecordClass,
        key_type: KeyType,
        key: &IndexKey,
        flags: ResolveFlags,
    ) -> Arc<IdentityRecord> {
        let record = IdentityRecord::negative(class_mask, key_type, key);
        if flags.contains(ResolveFlags::NO_NEGATIVE_CACHE) {
            Arc::new(record)
        } else {
            self.inner.cache.add_or_update(record, flags)
        }
    }

    /// Temporary id already carried by `record`; kept across refreshes
    fn temporary_id_of(&self, record: &IdentityRecord) -> Option<u32> {
        record
            .numeric_id()
            .filter(|id| self.inner.temp_ids.is_temporary(*id))
    }

    /// Surrogate numeric id for an identity that has a GUID or SID only
    fn temporary_id_for(&self, identity: &Identity) -> Option<u32> {
        let allocated = match (&identity.guid, &identity.sid) {
            (Some(guid), _) => self.inner.temp_ids.allocate_guid(guid),
            (None, Some(sid)) => self.inner.temp_ids.allocate_sid(sid),
            (None, None) => return None,
        };
        match allocated {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("No temporary id for {:?}: {}", identity.name, e);
                None
            }
        }
    }
}
