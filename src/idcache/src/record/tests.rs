use super::*;
use std::time::Duration;

fn tokens(partition: &str, token: u64) -> HashMap<String, u64> {
    let mut map = HashMap::new();
    map.insert(partition.to_string(), token);
    map
}

fn ldap_user(name: &str, uid: u32, token: u64) -> IdentityRecord {
    IdentityRecord::positive(
        Identity::user(name, uid)
            .with_partition("/LDAP")
            .with_partition_token(token),
        KeyTypes::UID,
    )
}

fn group(name: &str, gid: u32) -> Arc<IdentityRecord> {
    Arc::new(IdentityRecord::positive(
        Identity::group(name, gid)
            .with_guid(Uuid::new_v4())
            .with_partition("/LDAP"),
        KeyTypes::GID,
    ))
}

// ============================================================================
// Validate
// ============================================================================

#[test]
fn test_tokenless_record_always_validates() {
    let record = IdentityRecord::positive(Identity::user("alice", 501), KeyTypes::UID);
    let later = Instant::now() + Duration::from_secs(3600);

    assert!(record.validate(later, &HashMap::new()));
}

#[test]
fn test_token_must_match_and_deadline_hold() {
    let record = ldap_user("bob", 502, 7);
    let now = Instant::now();
    record.set_deadlines(now + Duration::from_secs(60), now + Duration::from_secs(600));

    assert!(record.validate(now, &tokens("/LDAP", 7)));
    assert!(!record.validate(now, &tokens("/LDAP", 8)));
    assert!(!record.validate(now + Duration::from_secs(61), &tokens("/LDAP", 7)));
}

#[test]
fn test_offline_partition_stays_valid() {
    let record = ldap_user("carol", 503, 7);
    let now = Instant::now();
    record.set_deadlines(now, now);

    assert!(record.set_node_available(false));
    assert!(!record.set_node_available(false));
    assert!(record.validate(now + Duration::from_secs(3600), &tokens("/LDAP", 99)));
}

#[test]
fn test_needs_refresh_after_max_refresh() {
    let record = ldap_user("dave", 504, 1);
    let now = Instant::now();
    record.set_deadlines(now + Duration::from_secs(600), now + Duration::from_secs(60));
    let current = tokens("/LDAP", 1);

    assert!(!record.needs_refresh(now, &current));
    assert!(record.needs_refresh(now + Duration::from_secs(61), &current));
}

// ============================================================================
// Merge
// ============================================================================

#[test]
fn test_merge_unions_found_by() {
    let target = ldap_user("erin", 505, 1);
    let source = IdentityRecord::positive(
        Identity::user("erin", 505)
            .with_partition("/LDAP")
            .with_display_name("Erin Example"),
        KeyTypes::NAME,
    );

    target.merge(&source, false);

    assert_eq!(target.found_by(), KeyTypes::UID | KeyTypes::NAME);
    assert_eq!(target.identity().display_name.as_deref(), Some("Erin Example"));
    assert_eq!(target.name(), Some("erin"));
}

#[test]
fn test_merge_copies_valid_memberships_only() {
    let target = ldap_user("frank", 506, 1);
    let source = ldap_user("frank", 506, 1);
    let staff = group("staff", 20);

    source.add_to_membership_index(&staff);
    target.merge(&source, true);
    assert!(target.memberships().is_empty());

    source.adopt_memberships(&source.memberships, true);
    target.merge(&source, true);
    assert!(target.membership_valid());
    assert!(target.is_member_of(&staff));
}

// ============================================================================
// Memberships
// ============================================================================

#[test]
fn test_readding_group_reports_not_new() {
    let subject = ldap_user("gina", 507, 1);
    let staff = group("staff", 20);

    assert!(subject.add_to_membership_index(&staff));
    assert!(!subject.add_to_membership_index(&staff));
    assert_eq!(subject.groups().len(), 1);
}

#[test]
fn test_scratch_closure_matches_direct_adds() {
    let direct = ldap_user("ivan", 509, 1);
    let adopted = ldap_user("jill", 510, 1);
    let staff = group("staff", 20);
    let ops = group("ops", 21);

    let closure = MembershipSet::new();
    for g in [&staff, &ops, &staff] {
        assert_eq!(closure.add(g), direct.add_to_membership_index(g));
    }

    adopted.adopt_memberships(&closure, true);
    assert!(adopted.membership_valid());
    assert_eq!(adopted.groups().len(), direct.groups().len());
    assert!(adopted.is_member_of(&ops));
    assert!(!adopted.add_to_membership_index(&staff));
}

#[test]
fn test_negative_record_never_holds_memberships() {
    let negative = IdentityRecord::negative(RecordClass::ACCOUNTS, KeyType::Uid, &IndexKey::Id(9999));
    let staff = group("staff", 20);

    assert!(!negative.add_to_membership_index(&staff));
    assert!(negative.memberships().is_empty());
    assert!(!negative.is_member_of(&staff));
}

#[test]
fn test_reset_membership_releases_groups() {
    let subject = ldap_user("hank", 508, 1);
    let staff = group("staff", 20);
    subject.add_to_membership_index(&staff);
    // filed by GUID and gid
    assert_eq!(Arc::strong_count(&staff), 3);

    subject.reset_membership();

    assert!(!subject.membership_valid());
    assert_eq!(Arc::strong_count(&staff), 1);
}

#[test]
fn test_negative_keys_limited_to_lookup_type() {
    let negative = IdentityRecord::negative(
        RecordClass::all(),
        KeyType::Name,
        &IndexKey::Name(crate::types::NameSpace::Account, "ghost".to_string()),
    );

    let keys = negative.index_keys();
    assert!(keys[KeyType::Name.index()].is_some());
    assert!(keys[KeyType::Uid.index()].is_none());
    assert!(negative.is_negative());
    assert!(!negative.is_builtin());
}

// ============================================================================
// Refresh flags
// ============================================================================

#[test]
fn test_reverify_scheduled_once_per_key_type() {
    let record = ldap_user("ivy", 509, 1);

    assert!(record.try_schedule_reverify(KeyType::Name));
    assert!(!record.try_schedule_reverify(KeyType::Name));
    assert!(record.try_schedule_reverify(KeyType::Guid));
}

#[tokio::test]
async fn test_waiters_released_when_refresh_finishes() {
    let record = Arc::new(ldap_user("jack", 510, 1));
    assert!(record.try_begin_refresh());
    assert!(!record.try_begin_refresh());

    let waiter = {
        let record = Arc::clone(&record);
        tokio::spawn(async move { record.wait_for_refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    record.finish_refresh();

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(!record.is_refreshing());
}

#[test]
fn test_host_records_bypass_date_checks() {
    let host = IdentityRecord::positive(
        Identity::new(RecordClass::COMPUTER, "build01$"),
        KeyTypes::NAME,
    );
    let user = ldap_user("kate", 511, 1);

    assert!(host.bypasses_date_checks());
    assert!(!user.bypasses_date_checks());
}
