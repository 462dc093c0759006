//! Link reconciler
//!
//! For one newly ingested event, matches every distinct driver entered in it
//! against every user with a declared identity and persists the results:
//! - first match creates a `suggested` `UserDriverLink` (or `conflicted` when
//!   the driver is already confirmed to someone else and the evidence is strong)
//! - later matches improve the durable link's score monotonically
//! - rejected links are never re-suggested; the event occurrence is still kept
//! - a driver already linked to a user (suggested or confirmed) gets an
//!   occurrence for this event even when this event's evidence alone would
//!   not match, carrying the durable link's evidence
//!
//! Re-running for the same event is safe: (user, driver, event) is the
//! idempotence key and unchanged evidence produces no writes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LinkingConfig;
use crate::error::{LinkError, LinkResult};
use crate::identity_linking::{DriverMatcher, MatchResult};
use crate::links::{
    DriverLocks, EventDriver, EventDriverLink, Evidence, LinkStatus, LinkStore, LinkTransaction,
    MatchType, UserDriverLink,
};
use crate::retry::with_driver_lock;

/// Reason stored on links created against an already confirmed driver
pub const CONFLICT_REASON_ALREADY_CONFIRMED: &str = "driver already confirmed to another user";

/// Per-run overrides
#[derive(Debug, Clone, Default)]
pub struct ReconcileOptions {
    /// Force transponder evidence on or off. `None` skips transponders only
    /// when no entry of the event carries one.
    pub skip_transponder: Option<bool>,
}

/// Counts for one reconciliation run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub event_id: String,
    pub pairs_evaluated: usize,
    pub links_created: usize,
    pub links_updated: usize,
    pub conflicts: usize,
    pub event_links_recorded: usize,
    pub rejected_pairs: usize,
}

impl ReconcileSummary {
    fn record(&mut self, outcome: PairOutcome) {
        match outcome.link {
            LinkChange::Created { conflicted } => {
                self.links_created += 1;
                if conflicted {
                    self.conflicts += 1;
                }
            }
            LinkChange::Improved => self.links_updated += 1,
            LinkChange::Unchanged => {}
            LinkChange::Rejected => self.rejected_pairs += 1,
        }
        if outcome.event_link_written {
            self.event_links_recorded += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkChange {
    Created { conflicted: bool },
    Improved,
    Unchanged,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct PairOutcome {
    link: LinkChange,
    event_link_written: bool,
}

/// One (user, driver) pair waiting to be persisted
struct PairWork<'a> {
    user_id: &'a str,
    entry: &'a EventDriver,
    evidence: PairEvidence,
}

enum PairEvidence {
    /// The matcher matched this pair in this event
    Matched(MatchResult),
    /// No match here, but the pair already has an open durable link
    Carried,
}

/// Orchestrates matching and link persistence for ingested events
pub struct LinkReconciler {
    store: Arc<dyn LinkStore>,
    matcher: DriverMatcher,
    locks: DriverLocks,
    config: LinkingConfig,
}

impl LinkReconciler {
    pub fn new(store: Arc<dyn LinkStore>, locks: DriverLocks, config: LinkingConfig) -> Self {
        Self {
            store,
            matcher: DriverMatcher::new(&config),
            locks,
            config,
        }
    }

    /// Reconcile one event with default options
    pub async fn reconcile_event(&self, event_id: &str) -> LinkResult<ReconcileSummary> {
        self.reconcile_event_with(event_id, &ReconcileOptions::default())
            .await
    }

    /// Reconcile one event. Aborting mid-way leaves already persisted pairs
    /// correct; a re-run completes the rest.
    pub async fn reconcile_event_with(
        &self,
        event_id: &str,
        options: &ReconcileOptions,
    ) -> LinkResult<ReconcileSummary> {
        if event_id.trim().is_empty() {
            return Err(LinkError::Validation("event_id is required".to_string()));
        }

        let users = self.store.fetch_all_user_identities().await?;
        let entries = distinct_drivers(
            self.store
                .fetch_driver_identities_for_event(event_id)
                .await?,
        );

        let skip_transponder = options
            .skip_transponder
            .unwrap_or_else(|| entries.iter().all(|e| e.effective_transponder().is_none()));

        let mut summary = ReconcileSummary {
            event_id: event_id.to_string(),
            pairs_evaluated: users.len() * entries.len(),
            ..ReconcileSummary::default()
        };

        // Links already held on these drivers, for pairs that do not match here
        let mut existing = Vec::with_capacity(entries.len());
        for entry in &entries {
            existing.push(
                self.store
                    .list_driver_links(&entry.identity.driver_id)
                    .await?,
            );
        }

        // Matching itself is pure.
        let mut work: Vec<PairWork<'_>> = entries
            .iter()
            .flat_map(|entry| users.iter().map(move |user| (user, entry)))
            .filter_map(|(user, entry)| {
                self.matcher
                    .match_with_transponder(
                        user,
                        &entry.identity,
                        entry.effective_transponder(),
                        skip_transponder,
                    )
                    .map(|result| PairWork {
                        user_id: user.user_id.as_str(),
                        entry,
                        evidence: PairEvidence::Matched(result),
                    })
            })
            .collect();
        let matched = work.len();

        let matched_pairs: HashSet<(&str, &str)> = work
            .iter()
            .map(|w| (w.user_id, w.entry.identity.driver_id.as_str()))
            .collect();
        let carried: Vec<PairWork<'_>> = entries
            .iter()
            .zip(&existing)
            .flat_map(|(entry, links)| links.iter().map(move |link| (entry, link)))
            .filter(|(_, link)| matches!(link.status, LinkStatus::Suggested | LinkStatus::Confirmed))
            .filter(|(entry, link)| {
                !matched_pairs.contains(&(link.user_id.as_str(), entry.identity.driver_id.as_str()))
            })
            .map(|(entry, link)| PairWork {
                user_id: link.user_id.as_str(),
                entry,
                evidence: PairEvidence::Carried,
            })
            .collect();
        work.extend(carried);

        debug!(
            event_id,
            users = users.len(),
            drivers = entries.len(),
            matched,
            carried = work.len() - matched,
            skip_transponder,
            "Matched event drivers"
        );

        summary = stream::iter(work.iter())
            .map(|pair| self.persist_pair_with_retry(event_id, pair))
            .buffer_unordered(self.config.concurrency.max(1))
            .try_fold(summary, |mut summary, outcome| async move {
                summary.record(outcome);
                Ok::<_, LinkError>(summary)
            })
            .await?;

        info!(
            event_id,
            created = summary.links_created,
            updated = summary.links_updated,
            conflicts = summary.conflicts,
            event_links = summary.event_links_recorded,
            "Event reconciled"
        );

        Ok(summary)
    }

    async fn persist_pair_with_retry(
        &self,
        event_id: &str,
        pair: &PairWork<'_>,
    ) -> LinkResult<PairOutcome> {
        let driver_id = pair.entry.identity.driver_id.as_str();
        with_driver_lock(
            &self.locks,
            driver_id,
            &self.config,
            "reconcile_pair",
            move || self.persist_pair(event_id, pair),
        )
        .await
    }

    async fn persist_pair(&self, event_id: &str, pair: &PairWork<'_>) -> LinkResult<PairOutcome> {
        match &pair.evidence {
            PairEvidence::Matched(result) => self.persist_match(event_id, pair, result).await,
            PairEvidence::Carried => self.persist_carried(event_id, pair).await,
        }
    }

    /// One matched (user, driver) reconciliation unit in a single transaction.
    async fn persist_match(
        &self,
        event_id: &str,
        pair: &PairWork<'_>,
        result: &MatchResult,
    ) -> LinkResult<PairOutcome> {
        let user_id = pair.user_id;
        let driver_id = pair.entry.identity.driver_id.as_str();
        let now = Utc::now();

        let mut tx = self.store.begin().await?;
        tx.lock_driver(driver_id).await?;

        let (owner, change) = match tx.get_user_driver_link(user_id, driver_id).await? {
            None => {
                let conflict_reason = if self.is_high_confidence(result) {
                    tx.find_confirmed_link_for_driver(driver_id)
                        .await?
                        .filter(|confirmed| confirmed.user_id != user_id)
                        .map(|_| CONFLICT_REASON_ALREADY_CONFIRMED.to_string())
                } else {
                    None
                };
                let conflicted = conflict_reason.is_some();
                if conflicted {
                    warn!(
                        event_id,
                        user_id,
                        driver_id,
                        match_type = %result.match_type,
                        "Driver already confirmed to another user; link needs manual review"
                    );
                }

                let link =
                    UserDriverLink::from_match(user_id, driver_id, result, conflict_reason, now);
                tx.upsert_user_driver_link(&link).await?;
                (link, LinkChange::Created { conflicted })
            }
            Some(mut link) => match link.status {
                LinkStatus::Rejected => (link, LinkChange::Rejected),
                LinkStatus::Suggested | LinkStatus::Confirmed | LinkStatus::Conflicted => {
                    if link.improve_with(result, now) {
                        tx.upsert_user_driver_link(&link).await?;
                        (link, LinkChange::Improved)
                    } else {
                        (link, LinkChange::Unchanged)
                    }
                }
            },
        };

        let event_link_written = record_occurrence(
            tx.as_mut(),
            &owner,
            event_id,
            Evidence::from(result),
            pair.entry.transponder_number.clone(),
        )
        .await?;

        tx.commit().await?;

        debug!(
            event_id,
            user_id,
            driver_id,
            status = %owner.status,
            match_type = %result.match_type,
            score = result.similarity_score,
            "Pair reconciled"
        );

        Ok(PairOutcome {
            link: change,
            event_link_written,
        })
    }

    /// Record this event for a pair whose durable link is still open. The
    /// link may have been rejected or never existed by the time the lock is
    /// held; then nothing is written.
    async fn persist_carried(&self, event_id: &str, pair: &PairWork<'_>) -> LinkResult<PairOutcome> {
        let user_id = pair.user_id;
        let driver_id = pair.entry.identity.driver_id.as_str();
        let untouched = PairOutcome {
            link: LinkChange::Unchanged,
            event_link_written: false,
        };

        let mut tx = self.store.begin().await?;
        tx.lock_driver(driver_id).await?;

        let owner = match tx.get_user_driver_link(user_id, driver_id).await? {
            Some(owner) if matches!(owner.status, LinkStatus::Suggested | LinkStatus::Confirmed) => {
                owner
            }
            _ => return Ok(untouched),
        };

        let event_link_written = record_occurrence(
            tx.as_mut(),
            &owner,
            event_id,
            Evidence::from(&owner),
            pair.entry.transponder_number.clone(),
        )
        .await?;
        if !event_link_written {
            return Ok(untouched);
        }
        tx.commit().await?;

        debug!(
            event_id,
            user_id,
            driver_id,
            status = %owner.status,
            "Occurrence recorded from existing link"
        );

        Ok(PairOutcome {
            link: LinkChange::Unchanged,
            event_link_written,
        })
    }

    /// Transponder and exact matches always count; fuzzy only above `auto_link_min`.
    fn is_high_confidence(&self, result: &MatchResult) -> bool {
        match result.match_type {
            MatchType::Transponder | MatchType::Exact => true,
            MatchType::Fuzzy => result.similarity_score >= self.config.auto_link_min,
        }
    }
}

/// Create or refresh the (user, driver, event) occurrence. Returns whether a
/// write happened.
async fn record_occurrence(
    tx: &mut dyn LinkTransaction,
    owner: &UserDriverLink,
    event_id: &str,
    evidence: Evidence,
    observed_transponder: Option<String>,
) -> LinkResult<bool> {
    let now = Utc::now();
    match tx
        .get_event_driver_link_for_driver(&owner.user_id, &owner.driver_id, event_id)
        .await?
    {
        Some(mut existing) => {
            let changed = existing.refresh(owner, evidence, observed_transponder, now);
            if changed {
                tx.upsert_event_driver_link(&existing).await?;
            }
            Ok(changed)
        }
        None => {
            let link = EventDriverLink::new(owner, event_id, evidence, observed_transponder, now);
            tx.upsert_event_driver_link(&link).await?;
            Ok(true)
        }
    }
}

/// Keep one entry per driver; an entry with an observed transponder wins.
fn distinct_drivers(entries: Vec<EventDriver>) -> Vec<EventDriver> {
    let mut by_driver: BTreeMap<String, EventDriver> = BTreeMap::new();
    for entry in entries {
        let keep_existing = by_driver
            .get(&entry.identity.driver_id)
            .is_some_and(|kept| {
                kept.transponder_number.is_some() || entry.transponder_number.is_none()
            });
        if !keep_existing {
            by_driver.insert(entry.identity.driver_id.clone(), entry);
        }
    }
    by_driver.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::{DriverIdentity, InMemoryLinkStore, UserIdentity};

    fn reconciler(store: &InMemoryLinkStore) -> LinkReconciler {
        LinkReconciler::new(
            Arc::new(store.clone()),
            DriverLocks::new(),
            LinkingConfig::default(),
        )
    }

    fn entry(driver_id: &str, name: &str, transponder: Option<&str>) -> EventDriver {
        EventDriver::new(
            DriverIdentity::new(driver_id, name, None, format!("src-{driver_id}")),
            transponder.map(str::to_string),
        )
    }

    #[test]
    fn test_distinct_drivers_prefers_observed_transponder() {
        let entries = vec![
            entry("d1", "John Doe", None),
            entry("d1", "John Doe", Some("123")),
            entry("d2", "Jane Roe", None),
        ];
        let distinct = distinct_drivers(entries);
        assert_eq!(distinct.len(), 2);
        assert_eq!(distinct[0].transponder_number.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn test_empty_event_id_rejected() {
        let store = InMemoryLinkStore::new();
        let err = reconciler(&store).reconcile_event(" ").await.unwrap_err();
        assert_eq!(err.code().as_str(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_first_match_creates_suggested_link() {
        let store = InMemoryLinkStore::new();
        store
            .insert_user_identity(UserIdentity::new("u1", "Jayson Brenton", None))
            .await;
        store
            .insert_event_entry("e1", entry("d1", "Jason Brenton", None))
            .await;
        store
            .insert_event_entry("e1", entry("d2", "Somebody Else", None))
            .await;

        let summary = reconciler(&store).reconcile_event("e1").await.unwrap();
        assert_eq!(summary.pairs_evaluated, 2);
        assert_eq!(summary.links_created, 1);
        assert_eq!(summary.event_links_recorded, 1);
        assert_eq!(summary.conflicts, 0);

        let links = store.user_driver_links().await;
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].status, LinkStatus::Suggested);
        assert_eq!(links[0].match_type, MatchType::Fuzzy);
    }

    #[tokio::test]
    async fn test_transponder_used_when_event_has_timing_data() {
        let store = InMemoryLinkStore::new();
        store
            .insert_user_identity(UserIdentity::new("u1", "J. B.", Some("9001".into())))
            .await;
        store
            .insert_event_entry("e1", entry("d1", "Jayson Brenton", Some("9001")))
            .await;

        reconciler(&store).reconcile_event("e1").await.unwrap();
        let links = store.event_driver_links().await;
        assert_eq!(links[0].match_type, MatchType::Transponder);
        assert_eq!(links[0].transponder_number.as_deref(), Some("9001"));
    }

    #[tokio::test]
    async fn test_forced_skip_transponder() {
        let store = InMemoryLinkStore::new();
        store
            .insert_user_identity(UserIdentity::new("u1", "J. B.", Some("9001".into())))
            .await;
        store
            .insert_event_entry("e1", entry("d1", "Jayson Brenton", Some("9001")))
            .await;

        let options = ReconcileOptions {
            skip_transponder: Some(true),
        };
        let summary = reconciler(&store)
            .reconcile_event_with("e1", &options)
            .await
            .unwrap();
        assert_eq!(summary.links_created, 0);
    }

    #[tokio::test]
    async fn test_open_link_carried_into_event_without_match() {
        let store = InMemoryLinkStore::new();
        store
            .insert_user_identity(UserIdentity::new("u1", "J. B.", Some("9001".into())))
            .await;
        store
            .insert_event_entry("e1", entry("d1", "Jayson Brenton", Some("9001")))
            .await;
        store
            .insert_event_entry("e2", entry("d1", "Jayson Brenton", None))
            .await;
        let reconciler = reconciler(&store);

        reconciler.reconcile_event("e1").await.unwrap();
        let summary = reconciler.reconcile_event("e2").await.unwrap();
        assert_eq!(summary.links_created, 0);
        assert_eq!(summary.event_links_recorded, 1);

        let occurrences = store.event_driver_links().await;
        assert_eq!(occurrences.len(), 2);
        assert_eq!(occurrences[1].event_id, "e2");
        assert_eq!(occurrences[1].match_type, MatchType::Transponder);
        assert_eq!(occurrences[1].transponder_number, None);

        let rerun = reconciler.reconcile_event("e2").await.unwrap();
        assert_eq!(rerun.event_links_recorded, 0);
        assert_eq!(store.event_driver_links().await, occurrences);
    }

    #[tokio::test]
    async fn test_rejected_link_not_carried() {
        let store = InMemoryLinkStore::new();
        store
            .insert_user_identity(UserIdentity::new("u1", "J. B.", Some("9001".into())))
            .await;
        store
            .insert_event_entry("e1", entry("d1", "Jayson Brenton", Some("9001")))
            .await;
        store
            .insert_event_entry("e2", entry("d1", "Jayson Brenton", None))
            .await;
        let reconciler = reconciler(&store);
        reconciler.reconcile_event("e1").await.unwrap();

        let mut link = store.user_driver_links().await.remove(0);
        link.status = LinkStatus::Rejected;
        let mut tx = store.begin().await.unwrap();
        tx.upsert_user_driver_link(&link).await.unwrap();
        tx.commit().await.unwrap();

        let summary = reconciler.reconcile_event("e2").await.unwrap();
        assert_eq!(summary.event_links_recorded, 0);
        assert_eq!(store.event_driver_links().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_commit_failure_is_retried() {
        let store = InMemoryLinkStore::new();
        store
            .insert_user_identity(UserIdentity::new("u1", "John Doe", None))
            .await;
        store
            .insert_event_entry("e1", entry("d1", "Doe John", None))
            .await;
        store.fail_next_commits(2).await;

        let summary = reconciler(&store).reconcile_event("e1").await.unwrap();
        assert_eq!(summary.links_created, 1);
        assert_eq!(store.user_driver_links().await.len(), 1);
    }
}
