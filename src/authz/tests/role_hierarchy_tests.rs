//! Role hierarchy cache tests
//!
//! Scope-specific TTLs, backoff on transient failures, and invalidation at
//! each granularity across both cache layers.

use permguard_authz::cache::{CacheCoordinator, DegradationPolicy};
use permguard_authz::config::{CacheSection, EngineConfig, RoleSection};
use permguard_authz::roles::RoleHierarchyCache;
use permguard_authz::store::{BackingStore, InMemoryBackingStore, StoreOp};
use permguard_authz::{AuthzError, RoleRecord, Scope, ScopeType};
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

struct Harness {
    roles: RoleHierarchyCache,
    store: Arc<InMemoryBackingStore>,
    cache: Arc<CacheCoordinator>,
}

fn harness(config: RoleSection) -> Harness {
    let store = Arc::new(InMemoryBackingStore::new());
    let cache = Arc::new(CacheCoordinator::new(
        CacheSection::default(),
        Arc::new(DegradationPolicy::default()),
    ));
    let roles = RoleHierarchyCache::new(&config, cache.clone(), store.clone());
    Harness { roles, store, cache }
}

fn fast_backoff() -> RoleSection {
    RoleSection {
        backoff_base_ms: 5,
        ..Default::default()
    }
}

fn seed(store: &InMemoryBackingStore) {
    store.add_role("u1", RoleRecord::new("owner", ScopeType::Organization, Some("acme".into())));
    store.add_role("u1", RoleRecord::new("member", ScopeType::Organization, Some("globex".into())));
    store.add_role("u1", RoleRecord::new("maintainer", ScopeType::Project, Some("p1".into())));
    store.add_role("u1", RoleRecord::new("operator", ScopeType::System, None));
}

// ============================================================================
// LOOKUPS
// ============================================================================

#[tokio::test]
async fn test_hierarchy_for_scope_instance() {
    let h = harness(fast_backoff());
    seed(&h.store);

    let acme = h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    assert_eq!(acme.roles, vec!["owner".to_string()]);
    assert_eq!(acme.scope, ScopeType::Organization);
    assert_eq!(acme.scope_id.as_deref(), Some("acme"));
    assert!(!acme.is_expired());

    let all_orgs = h.roles.get_hierarchy("u1", ScopeType::Organization, None).await;
    assert_eq!(all_orgs.roles.len(), 2);
}

#[tokio::test]
async fn test_scope_ttls_are_ordered() {
    let h = harness(RoleSection::default());

    let org = h.roles.optimizer(ScopeType::Organization).ttl();
    let project = h.roles.optimizer(ScopeType::Project).ttl();
    let system = h.roles.optimizer(ScopeType::System).ttl();

    assert!(system > org);
    assert!(system > project);
}

#[tokio::test]
async fn test_backoff_then_success() {
    let h = harness(RoleSection {
        backoff_base_ms: 20,
        ..Default::default()
    });
    seed(&h.store);
    h.store
        .fail_next(StoreOp::FetchRoles, 2, AuthzError::transient_store("connection refused"));

    let start = Instant::now();
    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::System, None).await;

    assert_eq!(hierarchy.roles, vec!["operator".to_string()]);
    assert_eq!(h.store.call_count(StoreOp::FetchRoles), 3);
    // 20ms, then 40ms
    assert!(start.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_exhausted_backoff_degrades_to_no_roles() {
    let h = harness(fast_backoff());
    seed(&h.store);
    h.store
        .fail_always(StoreOp::FetchRoles, AuthzError::transient_store("connection refused"));

    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::Project, Some("p1")).await;
    assert!(hierarchy.roles.is_empty());
    assert_eq!(h.store.call_count(StoreOp::FetchRoles), 3);

    // The outage is not remembered
    h.store.heal(StoreOp::FetchRoles);
    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::Project, Some("p1")).await;
    assert_eq!(hierarchy.roles, vec!["maintainer".to_string()]);
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let h = harness(fast_backoff());
    h.store.fail_always(StoreOp::FetchRoles, AuthzError::store("permission denied for table"));

    assert!(h.roles.optimizer(ScopeType::System).fetch("u1", None).await.is_empty());
    assert_eq!(h.store.call_count(StoreOp::FetchRoles), 1);
}

#[tokio::test]
async fn test_malformed_rows_are_dropped() {
    let h = harness(fast_backoff());
    h.store.add_role("u1", RoleRecord::new("", ScopeType::Organization, Some("acme".into())));
    h.store.add_role("u1", RoleRecord::new("owner", ScopeType::Organization, Some("acme".into())));

    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    assert_eq!(hierarchy.roles, vec!["owner".to_string()]);
}

#[tokio::test]
async fn test_warm_loads_each_scope() {
    let h = harness(fast_backoff());
    seed(&h.store);

    let warmed = h
        .roles
        .warm("u1", &[Scope::organization("acme"), Scope::project("p1"), Scope::system()])
        .await;

    assert_eq!(warmed.len(), 3);
    assert!(h.cache.contains_local("hier:u1:org:acme"));
    assert!(h.cache.contains_local("hier:u1:project:p1"));
    assert!(h.cache.contains_local("hier:u1:system:all"));
}

#[tokio::test]
async fn test_permissions_are_loaded_lazily() {
    let h = harness(fast_backoff());
    let acme = Scope::organization("acme");
    h.store.grant("u1", "invoice", "approve", Some(&acme));

    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    assert!(hierarchy.permissions.is_none());
    assert_eq!(h.store.call_count(StoreOp::FetchPermissions), 0);

    let permissions = h.roles.permissions_for("u1", ScopeType::Organization, Some("acme")).await;
    assert_eq!(permissions, vec!["invoice:approve".to_string()]);

    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    assert_eq!(hierarchy.permissions, Some(permissions));
}

// ============================================================================
// INVALIDATION
// ============================================================================

#[tokio::test]
async fn test_invalidate_one_instance() {
    let h = harness(fast_backoff());
    seed(&h.store);
    h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    h.roles.get_hierarchy("u1", ScopeType::Organization, Some("globex")).await;

    h.roles
        .invalidate_hierarchy("u1", Some(ScopeType::Organization), Some("acme"))
        .await;

    assert!(!h.cache.contains_local("hier:u1:org:acme"));
    assert!(!h.cache.contains_local("role:u1:org:acme"));
    assert!(h.cache.contains_local("hier:u1:org:globex"));
    assert!(h.cache.contains_local("role:u1:org:globex"));
}

#[tokio::test]
async fn test_invalidate_scope_type() {
    let h = harness(fast_backoff());
    seed(&h.store);
    h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    h.roles.get_hierarchy("u1", ScopeType::Organization, None).await;
    h.roles.get_hierarchy("u1", ScopeType::Project, Some("p1")).await;

    h.roles.invalidate_hierarchy("u1", Some(ScopeType::Organization), None).await;

    assert!(!h.cache.contains_local("hier:u1:org:acme"));
    assert!(!h.cache.contains_local("hier:u1:org:all"));
    assert!(!h.cache.contains_local("role:u1:org:acme"));
    assert!(!h.cache.contains_local("role:u1:org:all"));
    assert!(h.cache.contains_local("hier:u1:project:p1"));
    assert!(h.cache.contains_local("role:u1:project:p1"));
}

#[tokio::test]
async fn test_invalidate_everything_for_subject() {
    let h = harness(fast_backoff());
    seed(&h.store);
    h.roles
        .warm("u1", &[Scope::organization("acme"), Scope::project("p1"), Scope::system()])
        .await;
    h.roles.get_hierarchy("u10", ScopeType::System, None).await;

    h.roles.invalidate_hierarchy("u1", None, None).await;

    for key in ["hier:u1:org:acme", "hier:u1:project:p1", "hier:u1:system:all", "role:u1:system:all"] {
        assert!(!h.cache.contains_local(key), "{} should be gone", key);
    }
    assert!(h.cache.contains_local("hier:u10:system:all"));
}

#[tokio::test]
async fn test_invalidation_picks_up_new_roles() {
    let h = harness(fast_backoff());
    seed(&h.store);
    assert_eq!(
        h.roles.get_hierarchy("u1", ScopeType::Project, Some("p1")).await.roles.len(),
        1
    );

    h.store.add_role("u1", RoleRecord::new("reviewer", ScopeType::Project, Some("p1".into())));
    assert_eq!(
        h.roles.get_hierarchy("u1", ScopeType::Project, Some("p1")).await.roles.len(),
        1,
        "cached hierarchy is served until invalidated"
    );

    h.roles
        .invalidate_hierarchy("u1", Some(ScopeType::Project), Some("p1"))
        .await;
    assert_eq!(
        h.roles.get_hierarchy("u1", ScopeType::Project, Some("p1")).await.roles.len(),
        2
    );
}

#[tokio::test]
async fn test_invalidation_during_permission_fetch_is_not_undone() {
    let h = harness(fast_backoff());
    h.store.add_role("u1", RoleRecord::new("admin", ScopeType::Organization, Some("acme".into())));
    assert!(h
        .roles
        .get_hierarchy("u1", ScopeType::Organization, Some("acme"))
        .await
        .has_role("admin"));

    h.store.set_delay(StoreOp::FetchPermissions, Duration::from_millis(200));
    let role_fetches = h.store.call_count(StoreOp::FetchRoles);

    tokio::join!(
        h.roles.permissions_for("u1", ScopeType::Organization, Some("acme")),
        async {
            sleep(Duration::from_millis(50)).await;
            h.store
                .revoke_role("u1", "admin", Some("acme"), Some(ScopeType::Organization))
                .await
                .unwrap();
            h.roles
                .invalidate_hierarchy("u1", Some(ScopeType::Organization), Some("acme"))
                .await;
        }
    );

    let hierarchy = h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")).await;
    assert!(hierarchy.roles.is_empty(), "revoked role came back: {:?}", hierarchy.roles);
    assert_eq!(h.store.call_count(StoreOp::FetchRoles), role_fetches + 1);
}

#[tokio::test]
async fn test_invalidation_during_role_fetch_is_not_undone() {
    let h = harness(fast_backoff());
    h.store.add_role("u1", RoleRecord::new("owner", ScopeType::Organization, Some("acme".into())));
    h.store.set_delay(StoreOp::FetchRoles, Duration::from_millis(100));

    tokio::join!(
        h.roles.get_hierarchy("u1", ScopeType::Organization, Some("acme")),
        async {
            sleep(Duration::from_millis(30)).await;
            h.roles
                .invalidate_hierarchy("u1", Some(ScopeType::Organization), Some("acme"))
                .await;
        }
    );

    assert!(!h.cache.contains_local("hier:u1:org:acme"));
    assert!(!h.cache.contains_local("role:u1:org:acme"));
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[test]
fn test_role_ttls_load_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[roles]
organization_ttl_secs = 120
project_ttl_secs = 240
system_ttl_secs = 7200
"#
    )
    .unwrap();

    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.roles.organization_ttl_secs, 120);
    assert_eq!(config.roles.system_ttl_secs, 7200);
    assert_eq!(config.batch.batch_size, 10);
}

#[test]
fn test_inverted_role_ttls_are_rejected() {
    let result = EngineConfig::from_toml_str(
        r#"
[roles]
organization_ttl_secs = 7200
system_ttl_secs = 60
"#,
    );
    assert!(result.is_err());
}
