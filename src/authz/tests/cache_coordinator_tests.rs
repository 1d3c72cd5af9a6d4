//! Cache coordinator integration tests
//!
//! Two-tier reads and writes, structured invalidation, eviction under
//! pressure, and behavior while the remote tier is down.

use permguard_authz::cache::key::{self, Invalidation};
use permguard_authz::cache::{CacheCoordinator, DegradationPolicy, InMemoryRemoteTier, SetOutcome, TierHint};
use permguard_authz::config::{CacheSection, DegradationSection};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn two_tier(cache: CacheSection, degradation: DegradationSection) -> (CacheCoordinator, Arc<InMemoryRemoteTier>) {
    let remote = Arc::new(InMemoryRemoteTier::new());
    let policy = Arc::new(DegradationPolicy::new(degradation));
    (CacheCoordinator::with_remote(cache, policy, remote.clone()), remote)
}

fn default_two_tier() -> (CacheCoordinator, Arc<InMemoryRemoteTier>) {
    two_tier(CacheSection::default(), DegradationSection::default())
}

// ============================================================================
// READS AND WRITES
// ============================================================================

#[tokio::test]
async fn test_get_after_set_hits_local_tier() {
    let (cache, remote) = default_two_tier();

    assert_eq!(cache.set("perm:u1:global:all", &vec!["doc:read"], None).await, SetOutcome::Stored);
    let calls_before = remote.call_count();

    let value: Option<Vec<String>> = cache.get("perm:u1:global:all").await;
    assert_eq!(value, Some(vec!["doc:read".to_string()]));
    assert_eq!(remote.call_count(), calls_before, "local hit must not touch the remote tier");

    let stats = cache.stats();
    assert_eq!(stats.local_hits, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_miss_is_absent_and_counted() {
    let (cache, _remote) = default_two_tier();

    let value: Option<String> = cache.get("perm:nobody:global:all").await;
    assert!(value.is_none());

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.miss_rate, 1.0);
}

#[tokio::test]
async fn test_remote_only_hint_reads_shared_tier() {
    let (cache, remote) = default_two_tier();
    remote.insert_raw("role:u1:org:all", "[]", Duration::from_secs(60));

    let value: Option<Vec<String>> = cache.get_with_hint("role:u1:org:all", TierHint::RemoteOnly).await;
    assert_eq!(value, Some(Vec::new()));
    assert!(cache.contains_local("role:u1:org:all"));
}

#[tokio::test]
async fn test_expired_entry_reads_as_absent() {
    let (cache, _remote) = two_tier(
        CacheSection {
            remote_enabled: false,
            ..Default::default()
        },
        DegradationSection::default(),
    );

    cache.set("short", &1u8, Some(Duration::from_millis(20))).await;
    sleep(Duration::from_millis(40)).await;

    let value: Option<u8> = cache.get("short").await;
    assert!(value.is_none());
    assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test]
async fn test_type_mismatch_is_treated_as_corruption() {
    let (cache, remote) = default_two_tier();
    cache.set("k", &"text", None).await;

    let value: Option<u64> = cache.get("k").await;
    assert!(value.is_none());
    assert!(!cache.contains_local("k"));
    assert!(!remote.contains("k"));
    assert_eq!(cache.stats().corruptions, 1);
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_exact_invalidation_removes_only_that_key() {
    let (cache, remote) = default_two_tier();
    for k in ["auth:user:123", "auth:user:1234", "auth:user:12"] {
        cache.set(k, &true, None).await;
    }

    assert_eq!(cache.invalidate_pattern("auth:user:123").await, 1);

    assert!(!cache.contains_local("auth:user:123"));
    assert!(!remote.contains("auth:user:123"));
    assert!(cache.contains_local("auth:user:1234"));
    assert!(cache.contains_local("auth:user:12"));
}

#[tokio::test]
async fn test_prefix_invalidation_keeps_subject_ids_literal() {
    let (cache, remote) = default_two_tier();
    let doomed = ["auth:user:123", "auth:user:j.doe", "auth:user:jane doe", "auth:user:[admin]"];
    let kept = ["auth:users:1", "auth:userX", "other:user:123"];

    for k in doomed.iter().chain(kept.iter()) {
        cache.set(k, &1u8, None).await;
    }

    assert_eq!(cache.invalidate_pattern("auth:user:*").await, doomed.len());

    for k in doomed {
        assert!(!cache.contains_local(k), "{} should be gone locally", k);
        assert!(!remote.contains(k), "{} should be gone remotely", k);
    }
    for k in kept {
        assert!(cache.contains_local(k), "{} should survive", k);
        assert!(remote.contains(k), "{} should survive remotely", k);
    }
}

#[tokio::test]
async fn test_dot_in_prefix_is_not_a_wildcard() {
    let (cache, _remote) = default_two_tier();
    cache.set("perm:a.b:global:all", &1u8, None).await;
    cache.set("perm:aXb:global:all", &1u8, None).await;

    cache.invalidate(&Invalidation::prefix(key::permission_subject_prefix("a.b"))).await;

    assert!(!cache.contains_local("perm:a.b:global:all"));
    assert!(cache.contains_local("perm:aXb:global:all"));
}

#[tokio::test]
async fn test_regex_invalidation_reaches_remote_tier() {
    let (cache, remote) = default_two_tier();
    cache.set("role:u1:org:acme", &1u8, None).await;
    cache.set("role:u1:project:p1", &1u8, None).await;
    cache.set("role:u1:system:all", &1u8, None).await;

    let removed = cache.invalidate(&Invalidation::regex(r"role:u1:(org|project):.*")).await;

    assert_eq!(removed, 2);
    assert!(!remote.contains("role:u1:org:acme"));
    assert!(!remote.contains("role:u1:project:p1"));
    assert!(remote.contains("role:u1:system:all"));
}

#[tokio::test]
async fn test_invalid_regex_removes_nothing() {
    let (cache, _remote) = default_two_tier();
    cache.set("k", &1u8, None).await;

    assert_eq!(cache.invalidate(&Invalidation::regex("(unclosed")).await, 0);
    assert!(cache.contains_local("k"));
}

// ============================================================================
// FILLS RACING INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_fill_after_covering_invalidation_is_dropped() {
    let (cache, remote) = default_two_tier();
    let since = cache.generation();

    // Lands while the caller is still reading the store
    cache.invalidate(&Invalidation::prefix("hier:u1:")).await;

    let outcome = cache
        .set_if_current("hier:u1:org:acme", &vec!["admin"], None, since)
        .await;

    assert_eq!(outcome, SetOutcome::Superseded);
    assert!(!cache.contains_local("hier:u1:org:acme"));
    assert!(!remote.contains("hier:u1:org:acme"));
}

#[tokio::test]
async fn test_unrelated_invalidation_does_not_block_fill() {
    let (cache, remote) = default_two_tier();
    let since = cache.generation();

    cache.invalidate(&Invalidation::prefix("hier:u10:")).await;
    cache.invalidate(&Invalidation::exact("perm:u1:global:all")).await;

    let outcome = cache
        .set_if_current("hier:u1:org:acme", &vec!["admin"], None, since)
        .await;

    assert_eq!(outcome, SetOutcome::Stored);
    assert!(cache.contains_local("hier:u1:org:acme"));
    assert!(remote.contains("hier:u1:org:acme"));
}

#[tokio::test]
async fn test_clear_supersedes_every_pending_fill() {
    let (cache, _remote) = default_two_tier();
    let since = cache.generation();

    cache.clear().await;

    assert_eq!(
        cache.set_if_current("role:u1:system:all", &0u8, None, since).await,
        SetOutcome::Superseded
    );
    assert_eq!(
        cache.set_if_current("role:u1:system:all", &0u8, None, cache.generation()).await,
        SetOutcome::Stored
    );
}

// ============================================================================
// EVICTION
// ============================================================================

#[tokio::test]
async fn test_overflow_evicts_oldest_tenth() {
    let (cache, _remote) = two_tier(
        CacheSection {
            max_local_entries: 20,
            remote_enabled: false,
            ..Default::default()
        },
        DegradationSection::default(),
    );

    for i in 0..20 {
        cache.set(&format!("k{}", i), &i, None).await;
    }
    cache.set("newest", &99, None).await;

    assert!(!cache.contains_local("k0"));
    assert!(!cache.contains_local("k1"));
    assert!(cache.contains_local("k2"));
    assert!(cache.contains_local("newest"), "new entry must be present after eviction");

    let stats = cache.stats();
    assert_eq!(stats.evictions, 2);
    assert_eq!(stats.local_entries, 19);
    assert!(!stats.remote_disabled, "overflow must not disable the remote tier");
}

#[tokio::test]
async fn test_byte_ceiling_triggers_eviction() {
    let (cache, _remote) = two_tier(
        CacheSection {
            max_local_bytes: 2_000,
            remote_enabled: false,
            ..Default::default()
        },
        DegradationSection::default(),
    );

    let payload = "x".repeat(200);
    for i in 0..20 {
        cache.set(&format!("blob{}", i), &payload, None).await;
    }

    let stats = cache.stats();
    assert!(stats.local_bytes <= 2_000);
    assert!(stats.evictions > 0);
    assert!(cache.contains_local("blob19"));
    assert!(!cache.contains_local("blob0"));
}

// ============================================================================
// REMOTE TIER OUTAGE
// ============================================================================

#[tokio::test]
async fn test_outage_trips_breaker_and_recovers() {
    let (cache, remote) = two_tier(
        CacheSection::default(),
        DegradationSection {
            failure_threshold: 5,
            recovery_window_ms: 50,
            ..Default::default()
        },
    );
    remote.set_available(false);

    for i in 0..5 {
        let _: Option<u8> = cache.get(&format!("missing{}", i)).await;
    }
    assert!(cache.stats().remote_disabled);

    let calls = remote.call_count();
    let _: Option<u8> = cache.get("missing-again").await;
    assert_eq!(remote.call_count(), calls, "disabled tier must not be contacted");

    remote.set_available(true);
    remote.insert_raw("shared", "7", Duration::from_secs(60));
    sleep(Duration::from_millis(70)).await;

    let value: Option<u8> = cache.get("shared").await;
    assert_eq!(value, Some(7));
    assert!(!cache.stats().remote_disabled);
}

#[tokio::test]
async fn test_writes_succeed_locally_during_outage() {
    let (cache, remote) = default_two_tier();
    remote.set_available(false);

    assert_eq!(cache.set("k", &1u8, None).await, SetOutcome::StoredLocalOnly);
    let value: Option<u8> = cache.get("k").await;
    assert_eq!(value, Some(1));
}

#[tokio::test]
async fn test_clear_flushes_both_tiers() {
    let (cache, remote) = default_two_tier();
    cache.set("a", &1u8, None).await;
    cache.set("b", &2u8, None).await;

    cache.clear().await;

    assert_eq!(cache.stats().local_entries, 0);
    assert!(remote.is_empty());
}

// ============================================================================
// PROPERTY-BASED TESTS (PROPTEST)
// ============================================================================

proptest! {
    #[test]
    fn test_prefix_invalidation_is_literal(
        subject in "[a-z.*+?()\\[\\] ]{1,12}",
        other in "[a-z]{1,12}",
    ) {
        prop_assume!(!other.starts_with(&subject));

        tokio_test::block_on(async {
            let cache = CacheCoordinator::new(CacheSection::default(), Arc::new(DegradationPolicy::default()));
            let mine = key::permission_list_key(&subject, None);
            let theirs = key::permission_list_key(&other, None);
            cache.set(&mine, &1u8, None).await;
            cache.set(&theirs, &1u8, None).await;

            cache.invalidate(&Invalidation::prefix(key::permission_subject_prefix(&subject))).await;

            assert!(!cache.contains_local(&mine));
            assert!(cache.contains_local(&theirs));
        });
    }

    #[test]
    fn test_checksum_ignores_check_order(
        pairs in proptest::collection::vec(("[a-z]{1,8}", "[a-z]{1,8}"), 1..8),
    ) {
        use permguard_authz::PermissionCheck;

        let checks: Vec<PermissionCheck> = pairs.iter().map(|(r, a)| PermissionCheck::new(r.clone(), a.clone())).collect();
        let mut reversed = checks.clone();
        reversed.reverse();

        prop_assert_eq!(key::checksum(&checks), key::checksum(&reversed));
        prop_assert_eq!(
            key::permission_batch_key("u1", None, &checks),
            key::permission_batch_key("u1", None, &reversed)
        );
    }
}
