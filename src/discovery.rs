//! Link discovery
//!
//! Read-only "my events" query: every event in which a driver identity linked
//! to the user participated, with the per-event match metadata. Because the
//! durable link is resolved first, a confirmation made through one event
//! surfaces every other event of the same driver identity.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::error::{LinkError, LinkResult};
use crate::links::{EventDriverLink, LinkStatus, LinkStore, MatchType, UserDriverLink};

/// Optional filters for [`LinkDiscoveryService::discover_links_for_user`]
#[derive(Debug, Clone, Default)]
pub struct DiscoveryFilter {
    /// Keep only occurrences with one of these match types
    pub match_types: Option<Vec<MatchType>>,
    /// Keep only occurrences scoring at least this much
    pub min_similarity_score: Option<f64>,
    /// Ignore suggested links
    pub confirmed_only: bool,
}

impl DiscoveryFilter {
    pub fn confirmed_only() -> Self {
        Self {
            confirmed_only: true,
            ..Self::default()
        }
    }

    fn validate(&self) -> LinkResult<()> {
        if let Some(min) = self.min_similarity_score {
            if !(0.0..=1.0).contains(&min) {
                return Err(LinkError::Validation(format!(
                    "min_similarity_score must be within 0..=1, got {}",
                    min
                )));
            }
        }
        if self.match_types.as_ref().is_some_and(|types| types.is_empty()) {
            return Err(LinkError::Validation(
                "match_types filter must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn accepts_link(&self, link: &UserDriverLink) -> bool {
        match link.status {
            LinkStatus::Confirmed => true,
            LinkStatus::Suggested => !self.confirmed_only,
            LinkStatus::Rejected | LinkStatus::Conflicted => false,
        }
    }

    fn accepts_occurrence(&self, occurrence: &EventDriverLink) -> bool {
        let type_ok = self
            .match_types
            .as_ref()
            .map_or(true, |types| types.contains(&occurrence.match_type));
        let score_ok = self
            .min_similarity_score
            .map_or(true, |min| occurrence.similarity_score >= min);
        type_ok && score_ok
    }
}

/// One event a linked driver identity took part in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipationDetail {
    pub event_id: String,
    pub driver_id: String,
    pub link_id: Uuid,
    pub link_status: LinkStatus,
    pub match_type: MatchType,
    pub similarity_score: f64,
    pub transponder_number: Option<String>,
    pub matched_at: DateTime<Utc>,
}

/// Discovery result for one user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserEventLinks {
    pub user_id: String,
    /// Distinct event ids, sorted
    pub events: Vec<String>,
    /// Sorted by (event_id, driver_id)
    pub participation_details: Vec<ParticipationDetail>,
}

pub struct LinkDiscoveryService {
    store: Arc<dyn LinkStore>,
}

impl LinkDiscoveryService {
    pub fn new(store: Arc<dyn LinkStore>) -> Self {
        Self { store }
    }

    pub async fn discover_links_for_user(
        &self,
        user_id: &str,
        filter: &DiscoveryFilter,
    ) -> LinkResult<UserEventLinks> {
        if user_id.trim().is_empty() {
            return Err(LinkError::Validation("user_id is required".to_string()));
        }
        filter.validate()?;

        let links = self.store.list_user_driver_links(user_id).await?;

        let mut participation_details = Vec::new();
        for link in links.iter().filter(|l| filter.accepts_link(l)) {
            let occurrences = self.store.list_event_driver_links(link.id).await?;
            participation_details.extend(
                occurrences
                    .into_iter()
                    .filter(|o| filter.accepts_occurrence(o))
                    .map(|o| ParticipationDetail {
                        event_id: o.event_id,
                        driver_id: o.driver_id,
                        link_id: link.id,
                        link_status: link.status,
                        match_type: o.match_type,
                        similarity_score: o.similarity_score,
                        transponder_number: o.transponder_number,
                        matched_at: o.matched_at,
                    }),
            );
        }

        participation_details.sort_by(|a, b| {
            (&a.event_id, &a.driver_id).cmp(&(&b.event_id, &b.driver_id))
        });
        let events: Vec<String> = participation_details
            .iter()
            .map(|d| d.event_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        debug!(
            user_id,
            links = links.len(),
            events = events.len(),
            "Discovered linked events"
        );

        Ok(UserEventLinks {
            user_id: user_id.to_string(),
            events,
            participation_details,
        })
    }
}
