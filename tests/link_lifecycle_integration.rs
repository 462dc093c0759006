//! Integration tests for driver linking
//!
//! Tests verify, end to end through the in-memory store:
//! 1. Confirmation through one event applies to every event of the driver
//! 2. Rejections survive re-reconciliation
//! 3. Reconciliation is idempotent per (user, driver, event)
//! 4. A driver identity is confirmed to at most one user
//! 5. Transient repository failures are retried

use std::sync::Arc;
use std::time::Duration;

use driver_link::{
    DiscoveryFilter, DriverIdentity, DriverLinkManager, EventDriver, InMemoryLinkStore,
    LinkStatus, LinkingConfig, MatchType, UserIdentity,
};

// ============================================================================
// TEST FIXTURES
// ============================================================================

fn test_config() -> LinkingConfig {
    LinkingConfig {
        retry_backoff: Duration::from_millis(1),
        ..LinkingConfig::default()
    }
}

fn manager(store: &InMemoryLinkStore) -> DriverLinkManager {
    DriverLinkManager::new(Arc::new(store.clone()), test_config())
}

fn entry(driver_id: &str, name: &str, transponder: Option<&str>) -> EventDriver {
    EventDriver::new(
        DriverIdentity::new(driver_id, name, None, format!("mylaps-{driver_id}")),
        transponder.map(str::to_string),
    )
}

/// "Jayson Brenton" raced as "Jason Brenton" (driver d1) in events e1 and e2.
async fn brenton_store() -> InMemoryLinkStore {
    let store = InMemoryLinkStore::new();
    store
        .insert_user_identity(UserIdentity::new("u1", "Jayson Brenton", None))
        .await;
    for event in ["e1", "e2"] {
        store
            .insert_event_entry(event, entry("d1", "Jason Brenton", None))
            .await;
        store
            .insert_event_entry(event, entry("d9", "Marco Rossi", None))
            .await;
    }
    store
}

// ============================================================================
// CROSS-EVENT CONFIRMATION
// ============================================================================

#[tokio::test]
async fn test_confirmation_is_cross_event() {
    let store = brenton_store().await;
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e1").await.unwrap();
    manager.reconciler().reconcile_event("e2").await.unwrap();

    let link = manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(link.status, LinkStatus::Confirmed);
    assert_eq!(link.driver_id, "d1");

    let found = manager
        .discovery()
        .discover_links_for_user("u1", &DiscoveryFilter::confirmed_only())
        .await
        .unwrap();
    assert_eq!(found.events, vec!["e1", "e2"]);
    assert!(found
        .participation_details
        .iter()
        .all(|d| d.match_type == MatchType::Fuzzy && d.link_id == link.id));
}

#[tokio::test]
async fn test_event_ingested_after_confirmation_is_discovered() {
    let store = brenton_store().await;
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e1").await.unwrap();
    manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();

    let summary = manager.reconciler().reconcile_event("e2").await.unwrap();
    assert_eq!(summary.links_created, 0);
    assert_eq!(summary.event_links_recorded, 1);

    let links = store.user_driver_links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Confirmed);

    let found = manager
        .discovery()
        .discover_links_for_user("u1", &DiscoveryFilter::confirmed_only())
        .await
        .unwrap();
    assert_eq!(found.events, vec!["e1", "e2"]);
}

#[tokio::test]
async fn test_confirmed_transponder_link_follows_driver_without_evidence() {
    let store = InMemoryLinkStore::new();
    store
        .insert_user_identity(UserIdentity::new("u1", "J. B.", Some("9001".to_string())))
        .await;
    store
        .insert_event_entry("e1", entry("d1", "Jayson Brenton", Some("9001")))
        .await;
    store
        .insert_event_entry("e2", entry("d1", "Jayson Brenton", None))
        .await;
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e1").await.unwrap();
    let link = manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(link.match_type, MatchType::Transponder);

    let summary = manager.reconciler().reconcile_event("e2").await.unwrap();
    assert_eq!(summary.links_created, 0);
    assert_eq!(summary.event_links_recorded, 1);

    let found = manager
        .discovery()
        .discover_links_for_user("u1", &DiscoveryFilter::confirmed_only())
        .await
        .unwrap();
    assert_eq!(found.events, vec!["e1", "e2"]);
    assert!(found
        .participation_details
        .iter()
        .all(|d| d.link_id == link.id && d.match_type == MatchType::Transponder));

    let rerun = manager.reconciler().reconcile_event("e2").await.unwrap();
    assert_eq!(rerun.event_links_recorded, 0);
}

// ============================================================================
// REJECTION AND IDEMPOTENCE
// ============================================================================

#[tokio::test]
async fn test_rejection_is_durable() {
    let store = brenton_store().await;
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e1").await.unwrap();
    manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Rejected)
        .await
        .unwrap();

    for event in ["e1", "e2", "e1"] {
        let summary = manager.reconciler().reconcile_event(event).await.unwrap();
        assert_eq!(summary.links_created, 0);
        assert_eq!(summary.rejected_pairs, 1);
    }

    let links = store.user_driver_links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Rejected);

    // The occurrence in e2 is still recorded, against the rejected link.
    let occurrences = store.event_driver_links().await;
    assert_eq!(occurrences.len(), 2);
    assert!(occurrences
        .iter()
        .all(|o| o.user_driver_link_id == links[0].id));

    let found = manager
        .discovery()
        .discover_links_for_user("u1", &DiscoveryFilter::default())
        .await
        .unwrap();
    assert!(found.events.is_empty());
}

#[tokio::test]
async fn test_reconcile_twice_is_idempotent() {
    let store = brenton_store().await;
    let manager = manager(&store);

    let first = manager.reconciler().reconcile_event("e1").await.unwrap();
    assert_eq!(first.links_created, 1);
    let links = store.user_driver_links().await;
    let occurrences = store.event_driver_links().await;

    let second = manager.reconciler().reconcile_event("e1").await.unwrap();
    assert_eq!(second.links_created, 0);
    assert_eq!(second.links_updated, 0);
    assert_eq!(second.event_links_recorded, 0);
    assert_eq!(store.user_driver_links().await, links);
    assert_eq!(store.event_driver_links().await, occurrences);
}

#[tokio::test]
async fn test_stronger_evidence_improves_link() {
    let store = InMemoryLinkStore::new();
    store
        .insert_user_identity(UserIdentity::new("u1", "Jayson Brenton", Some("4242".into())))
        .await;
    store
        .insert_event_entry("e1", entry("d1", "Jason Brenton", None))
        .await;
    store
        .insert_event_entry("e2", entry("d1", "Jason Brenton", Some("4242")))
        .await;
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e1").await.unwrap();
    let fuzzy = store.user_driver_links().await.remove(0);
    assert_eq!(fuzzy.match_type, MatchType::Fuzzy);

    let summary = manager.reconciler().reconcile_event("e2").await.unwrap();
    assert_eq!(summary.links_updated, 1);

    let improved = store.user_driver_links().await.remove(0);
    assert_eq!(improved.id, fuzzy.id);
    assert_eq!(improved.match_type, MatchType::Transponder);
    assert_eq!(improved.similarity_score, 1.0);
    assert_eq!(improved.status, LinkStatus::Suggested);

    // Each occurrence keeps the evidence seen in its own event.
    let occurrences = store.event_driver_links().await;
    assert_eq!(occurrences[0].match_type, MatchType::Fuzzy);
    assert_eq!(occurrences[1].transponder_number.as_deref(), Some("4242"));
}

// ============================================================================
// EXCLUSIVITY
// ============================================================================

#[tokio::test]
async fn test_driver_confirmed_to_one_user_only() {
    let store = InMemoryLinkStore::new();
    store
        .insert_user_identity(UserIdentity::new("u1", "John Doe", None))
        .await;
    store
        .insert_user_identity(UserIdentity::new("u2", "Doe, John", None))
        .await;
    store
        .insert_event_entry("e1", entry("d1", "John Doe", None))
        .await;
    let manager = manager(&store);

    let summary = manager.reconciler().reconcile_event("e1").await.unwrap();
    assert_eq!(summary.links_created, 2);
    assert_eq!(summary.conflicts, 0);

    manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();

    let err = manager
        .lifecycle()
        .update_status_by_event("u2", "e1", LinkStatus::Confirmed)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "CONFLICT");
    assert!(err.requires_manual_review());

    let confirmed: Vec<_> = store
        .user_driver_links()
        .await
        .into_iter()
        .filter(|l| l.status == LinkStatus::Confirmed)
        .collect();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].user_id, "u1");
}

#[tokio::test]
async fn test_new_claim_on_confirmed_driver_is_conflicted() {
    let store = InMemoryLinkStore::new();
    store
        .insert_user_identity(UserIdentity::new("u1", "John Doe", None))
        .await;
    store
        .insert_event_entry("e1", entry("d1", "John Doe", None))
        .await;
    store
        .insert_event_entry("e2", entry("d1", "John Doe", None))
        .await;
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e1").await.unwrap();
    manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();

    store
        .insert_user_identity(UserIdentity::new("u2", "JOHN  DOE", None))
        .await;
    let summary = manager.reconciler().reconcile_event("e2").await.unwrap();
    assert_eq!(summary.links_created, 1);
    assert_eq!(summary.conflicts, 1);

    let links = store.user_driver_links().await;
    let claim = links.iter().find(|l| l.user_id == "u2").unwrap();
    assert_eq!(claim.status, LinkStatus::Conflicted);
    assert!(claim.conflict_reason.is_some());

    let err = manager
        .lifecycle()
        .update_status_by_event("u2", "e2", LinkStatus::Confirmed)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "FORBIDDEN");

    let link = manager
        .lifecycle()
        .update_status_by_event("u2", "e2", LinkStatus::Rejected)
        .await
        .unwrap();
    assert_eq!(link.status, LinkStatus::Rejected);
}

// ============================================================================
// FAILURE HANDLING AND CONCURRENCY
// ============================================================================

#[tokio::test]
async fn test_review_retries_transient_failure() {
    let store = brenton_store().await;
    let manager = manager(&store);
    manager.reconciler().reconcile_event("e1").await.unwrap();

    store.fail_next_commits(2).await;
    let link = manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(link.status, LinkStatus::Confirmed);
    assert_eq!(store.user_driver_links().await[0].status, LinkStatus::Confirmed);
}

#[tokio::test]
async fn test_review_gives_up_after_max_retries() {
    let store = brenton_store().await;
    let manager = manager(&store);
    manager.reconciler().reconcile_event("e1").await.unwrap();

    store.fail_next_commits(10).await;
    let err = manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "REPOSITORY_ERROR");
    assert!(err.is_transient());
    assert_eq!(store.user_driver_links().await[0].status, LinkStatus::Suggested);
}

#[tokio::test]
async fn test_confirm_concurrent_with_reconcile() {
    let store = brenton_store().await;
    let manager = manager(&store);
    manager.reconciler().reconcile_event("e1").await.unwrap();

    let reconciler = manager.reconciler();
    let lifecycle = manager.lifecycle();
    let (summary, review) = tokio::join!(
        reconciler.reconcile_event("e2"),
        lifecycle.update_status_by_event("u1", "e1", LinkStatus::Confirmed),
    );
    summary.unwrap();
    review.unwrap();

    let links = store.user_driver_links().await;
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].status, LinkStatus::Confirmed);
    assert!(links[0].confirmed_at.is_some());
    assert_eq!(store.event_driver_links().await.len(), 2);
}

#[tokio::test]
async fn test_review_targets_open_link_over_rejected_one() {
    let store = InMemoryLinkStore::new();
    store
        .insert_user_identity(UserIdentity::new("u1", "Jayson Brenton", None))
        .await;
    store
        .insert_event_entry("e0", entry("d1", "Jayson Brenton", None))
        .await;
    for (driver_id, name) in [("d1", "Jayson Brenton"), ("d2", "Jason Brenton")] {
        store
            .insert_event_entry("e1", entry(driver_id, name, None))
            .await;
    }
    let manager = manager(&store);

    manager.reconciler().reconcile_event("e0").await.unwrap();
    manager
        .lifecycle()
        .update_status_by_event("u1", "e0", LinkStatus::Rejected)
        .await
        .unwrap();
    manager.reconciler().reconcile_event("e1").await.unwrap();

    let link = manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(link.driver_id, "d2");
    assert_eq!(link.status, LinkStatus::Confirmed);

    let links = store.user_driver_links().await;
    let rejected = links.iter().find(|l| l.driver_id == "d1").unwrap();
    assert_eq!(rejected.status, LinkStatus::Rejected);
}

#[tokio::test]
async fn test_review_without_match_is_not_found() {
    let store = brenton_store().await;
    let manager = manager(&store);

    let err = manager
        .lifecycle()
        .update_status_by_event("u1", "e1", LinkStatus::Confirmed)
        .await
        .unwrap_err();
    assert_eq!(err.code().as_str(), "NOT_FOUND");

    let err = "approved".parse::<LinkStatus>().unwrap_err();
    assert_eq!(err.code().as_str(), "VALIDATION_ERROR");
}
