//! Resolver integration tests
//!
//! Authority tracking, single-flight directory fallback, negative caching,
//! outage handling and the compatibility/temporary id translations.

use idcache::compat::compat_guid;
use idcache::temp_id::TEMPORARY_ID_BASE;
use idcache::{
    CacheConfig, Identity, IdCacheError, KeyType, KeyTypes, MembershipCache, MembershipResolver,
    RecordClass, ResolveFlags, StaticDirectory, TemporaryIdAllocator, WellKnown,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn directory() -> Arc<StaticDirectory> {
    let directory = StaticDirectory::new();
    directory.insert_identity(
        Identity::user("dave", 1501)
            .with_primary_group(2000)
            .with_partition("/LDAP"),
    );
    directory.insert_identity(Identity::group("operators", 2000).with_partition("/LDAP"));
    Arc::new(directory)
}

fn resolver(directory: Arc<StaticDirectory>) -> MembershipResolver {
    let cache = Arc::new(MembershipCache::new(CacheConfig::default()));
    MembershipResolver::new(
        cache,
        directory,
        Arc::new(TemporaryIdAllocator::new()),
        Arc::new(WellKnown::default()),
    )
}

// ============================================================================
// SINGLE-FLIGHT FALLBACK
// ============================================================================

#[tokio::test]
async fn test_concurrent_misses_share_one_lookup() {
    let directory = Arc::new(
        StaticDirectory::new().with_latency(Duration::from_millis(50)),
    );
    directory.insert_identity(Identity::user("dave", 1501).with_partition("/LDAP"));
    let resolver = resolver(Arc::clone(&directory));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let resolver = resolver.clone();
        handles.push(tokio::spawn(async move {
            resolver
                .resolve(KeyType::Name, "dave", ResolveFlags::empty())
                .await
        }));
    }

    let mut records = Vec::new();
    for handle in handles {
        records.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(directory.lookup_count(), 1, "Misses should join one fallback");
    for record in &records {
        assert!(Arc::ptr_eq(record, &records[0]));
    }
    assert_eq!(resolver.cache().len(), 1);
}

#[tokio::test]
async fn test_different_class_masks_use_separate_flights() {
    let directory = Arc::new(
        StaticDirectory::new().with_latency(Duration::from_millis(50)),
    );
    directory.insert_identity(Identity::user("dave", 1501).with_partition("/LDAP"));
    let resolver = resolver(Arc::clone(&directory));

    let (any, accounts) = tokio::join!(
        resolver.resolve(KeyType::Name, "dave", ResolveFlags::empty()),
        resolver.resolve_as(RecordClass::ACCOUNTS, KeyType::Name, "dave", ResolveFlags::empty()),
    );

    assert_eq!(directory.lookup_count(), 2);
    // the second answer merges into the first filed record
    assert!(Arc::ptr_eq(&any.unwrap(), &accounts.unwrap()));
    assert_eq!(resolver.cache().len(), 1);
}

#[tokio::test]
async fn test_authoritative_hit_skips_directory() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let first = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();
    let second = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(directory.lookup_count(), 1);

    let stats = resolver.cache().stats().snapshot(0, 0);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

// ============================================================================
// AUTHORITY TRACKING
// ============================================================================

#[tokio::test]
async fn test_unverified_hit_schedules_one_reverify() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let by_name = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();
    assert_eq!(by_name.found_by(), KeyTypes::NAME);

    // Served from cache through a key the directory never confirmed
    let by_uid = resolver
        .resolve(KeyType::Uid, "1501", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&by_name, &by_uid));
    assert_eq!(directory.lookup_count(), 1);

    // A second unverified hit does not schedule another re-verify
    resolver
        .resolve(KeyType::Uid, "1501", ResolveFlags::empty())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(directory.lookup_count(), 2);
    assert!(by_name.found_by().contains(KeyTypes::NAME | KeyTypes::UID));
    assert_eq!(resolver.cache().stats().snapshot(0, 0).reverifies, 1);

    // Now authoritative for uid as well
    resolver
        .resolve(KeyType::Uid, "1501", ResolveFlags::empty())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(directory.lookup_count(), 2);
}

#[tokio::test]
async fn test_reserved_key_not_served_from_non_builtin_record() {
    let directory = StaticDirectory::new();
    directory.insert_identity(Identity::user("root", 0).with_partition("/LDAP"));
    let directory = Arc::new(directory);
    let resolver = resolver(Arc::clone(&directory));

    for _ in 0..2 {
        let record = resolver
            .resolve(KeyType::Uid, "0", ResolveFlags::empty())
            .await
            .unwrap();
        assert_eq!(record.name(), Some("root"));
    }

    assert_eq!(directory.lookup_count(), 2, "Reserved uid must go back to the directory");
}

// ============================================================================
// NEGATIVE CACHING
// ============================================================================

#[tokio::test]
async fn test_negative_answer_is_cached() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let first = resolver
        .resolve(KeyType::Name, "ghost", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(first.is_negative());

    let second = resolver
        .resolve(KeyType::Name, "ghost", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(second.is_negative());
    assert!(Arc::ptr_eq(&first, &second));

    assert_eq!(directory.lookup_count(), 1);
    assert_eq!(resolver.cache().stats().snapshot(0, 0).negative_hits, 1);
}

#[tokio::test]
async fn test_no_negative_cache_flag() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    for _ in 0..2 {
        let record = resolver
            .resolve(KeyType::Name, "phantom", ResolveFlags::NO_NEGATIVE_CACHE)
            .await
            .unwrap();
        assert!(record.is_negative());
        assert!(!resolver.cache().contains(&record));
    }

    assert_eq!(directory.lookup_count(), 2);
    assert!(resolver.cache().is_empty());
}

// ============================================================================
// FAILURES AND OUTAGES
// ============================================================================

#[tokio::test]
async fn test_malformed_key_never_reaches_directory() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let err = resolver
        .resolve(KeyType::Uid, "not-a-number", ResolveFlags::empty())
        .await
        .unwrap_err();

    assert!(matches!(err, IdCacheError::Malformed(_)));
    assert_eq!(directory.lookup_count(), 0);
}

#[tokio::test]
async fn test_unavailable_partition_serves_stale_record() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let cached = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();

    // Invalidate the token, then take the partition down
    directory.bump_partition_token("/LDAP");
    directory.set_partition_available("/LDAP", false);

    let served = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&cached, &served));
    assert_eq!(directory.lookup_count(), 2);
}

#[tokio::test]
async fn test_directory_failure_without_cached_record() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));
    directory.set_failure(Some(IdCacheError::Directory("ldap down".to_string())));

    let err = resolver
        .resolve(KeyType::Name, "erin", ResolveFlags::empty())
        .await
        .unwrap_err();
    assert!(matches!(err, IdCacheError::Directory(_)));
    assert!(resolver.cache().is_empty(), "Failures are not cached as negative");

    directory.set_failure(None);
    let record = resolver
        .resolve(KeyType::Name, "erin", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(record.is_negative());
}

#[tokio::test]
async fn test_directory_failure_serves_stale_record() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let cached = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();
    directory.bump_partition_token("/LDAP");
    directory.set_failure(Some(IdCacheError::Directory("timeout".to_string())));

    let served = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&cached, &served));
}

// ============================================================================
// KEY TRANSLATION
// ============================================================================

#[tokio::test]
async fn test_compat_guid_resolves_through_numeric_id() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let dave = resolver
        .resolve(KeyType::Name, "dave", ResolveFlags::empty())
        .await
        .unwrap();
    let guid = compat_guid(RecordClass::USER, 1501).unwrap();
    assert_eq!(dave.guid(), Some(guid));

    let by_guid = resolver
        .resolve(KeyType::Guid, &guid.to_string(), ResolveFlags::empty())
        .await
        .unwrap();

    assert!(Arc::ptr_eq(&dave, &by_guid));
    assert_eq!(directory.lookup_count(), 1);
}

#[tokio::test]
async fn test_kernel_lookup_assigns_temporary_id() {
    let guid = Uuid::new_v4();
    let directory = StaticDirectory::new();
    directory.insert_identity(
        Identity::new(RecordClass::USER, "erin")
            .with_guid(guid)
            .with_partition("/LDAP"),
    );
    let directory = Arc::new(directory);
    let resolver = resolver(Arc::clone(&directory));

    let erin = resolver
        .resolve(KeyType::Name, "erin", ResolveFlags::KERNEL)
        .await
        .unwrap();
    let uid = erin.numeric_id().expect("kernel lookup should mint a uid");
    assert!(uid >= TEMPORARY_ID_BASE);

    let by_uid = resolver
        .resolve(KeyType::Uid, &uid.to_string(), ResolveFlags::empty())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&erin, &by_uid));

    // The background re-verify keeps the minted uid
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(erin.numeric_id(), Some(uid));

    // Inside the allocated block but never handed out
    let err = resolver
        .resolve(KeyType::Uid, &(uid + 10).to_string(), ResolveFlags::empty())
        .await
        .unwrap_err();
    assert_eq!(err, IdCacheError::NotFound);
}

#[tokio::test]
async fn test_pseudo_groups_are_synthesized_locally() {
    let directory = directory();
    let resolver = resolver(Arc::clone(&directory));

    let everyone = resolver
        .resolve(KeyType::Gid, "12", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(everyone.is_builtin());
    assert_eq!(everyone.name(), Some("everyone"));

    let by_sid = resolver
        .resolve_as(RecordClass::GROUPS, KeyType::Sid, "S-1-1-0", ResolveFlags::empty())
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&everyone, &by_sid));

    let network = resolver
        .resolve_as(RecordClass::GROUPS, KeyType::Name, "netaccounts", ResolveFlags::empty())
        .await
        .unwrap();
    assert_eq!(network.numeric_id(), Some(62));

    assert_eq!(directory.lookup_count(), 0);
}
