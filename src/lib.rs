//! Driver identity linking
//!
//! Resolves which scraped race-result driver records belong to which user:
//! names are canonicalized and scored, every user is matched against the
//! drivers of each newly ingested event, and the resulting links move through
//! a reviewable lifecycle that spans events.
//!
//! ## Call chain
//! ```text
//! ingestion -> LinkReconciler::reconcile_event
//!                 -> DriverMatcher (normalize -> similarity)
//!                 -> LinkStore transaction per (user, driver) pair
//! user review -> LinkLifecycleService::update_status_by_event
//! "my events" -> LinkDiscoveryService::discover_links_for_user
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driver_link::{DriverLinkManager, InMemoryLinkStore, LinkStatus, LinkingConfig};
//!
//! # async fn run() -> driver_link::LinkResult<()> {
//! let manager = DriverLinkManager::new(Arc::new(InMemoryLinkStore::new()), LinkingConfig::default());
//! let summary = manager.reconciler().reconcile_event("event-1").await?;
//! println!("{} links created", summary.links_created);
//! manager
//!     .lifecycle()
//!     .update_status_by_event("user-1", "event-1", LinkStatus::Confirmed)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod identity_linking;
pub mod lifecycle;
pub mod links;
pub mod reconciler;

mod retry;

use std::sync::Arc;

pub use config::LinkingConfig;
pub use discovery::{DiscoveryFilter, LinkDiscoveryService, ParticipationDetail, UserEventLinks};
pub use error::{ErrorCode, LinkError, LinkResult, RepositoryError};
pub use identity_linking::{
    normalize_driver_name, similarity, DriverMatcher, MatchResult, MATCHER_ID, MATCHER_VERSION,
};
pub use lifecycle::LinkLifecycleService;
pub use links::{
    DriverIdentity, DriverLocks, EventDriver, EventDriverLink, Evidence, InMemoryLinkStore,
    LinkStatus, LinkStore, LinkTransaction, MatchType, UserDriverLink, UserIdentity,
};
#[cfg(feature = "database")]
pub use links::{DatabaseConfig, PgLinkStore};
pub use reconciler::{LinkReconciler, ReconcileOptions, ReconcileSummary};

/// Wires the services over one store so they share the same driver locks.
#[derive(Clone)]
pub struct DriverLinkManager {
    store: Arc<dyn LinkStore>,
    locks: DriverLocks,
    config: LinkingConfig,
}

impl DriverLinkManager {
    pub fn new(store: Arc<dyn LinkStore>, config: LinkingConfig) -> Self {
        Self {
            store,
            locks: DriverLocks::new(),
            config,
        }
    }

    pub fn reconciler(&self) -> LinkReconciler {
        LinkReconciler::new(self.store.clone(), self.locks.clone(), self.config.clone())
    }

    pub fn lifecycle(&self) -> LinkLifecycleService {
        LinkLifecycleService::new(self.store.clone(), self.locks.clone(), self.config.clone())
    }

    pub fn discovery(&self) -> LinkDiscoveryService {
        LinkDiscoveryService::new(self.store.clone())
    }
}
