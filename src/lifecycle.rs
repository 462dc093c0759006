//! Link lifecycle
//!
//! User-driven review of a suggested match, addressed by event. The review
//! stamps the event occurrence and moves the durable link, so confirming in
//! one event confirms the driver identity for every event it appears in.
//!
//! ```text
//! suggested  --confirm-->  confirmed
//! suggested  --reject--->  rejected
//! conflicted --reject--->  rejected
//! conflicted --confirm-->  (admin path only, FORBIDDEN here)
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::config::LinkingConfig;
use crate::error::{LinkError, LinkResult};
use crate::links::{strongest_event_link, DriverLocks, LinkStatus, LinkStore, UserDriverLink};
use crate::retry::with_driver_lock;

/// Confirm/reject entry point
pub struct LinkLifecycleService {
    store: Arc<dyn LinkStore>,
    locks: DriverLocks,
    config: LinkingConfig,
}

impl LinkLifecycleService {
    pub fn new(store: Arc<dyn LinkStore>, locks: DriverLocks, config: LinkingConfig) -> Self {
        Self {
            store,
            locks,
            config,
        }
    }

    /// Confirm or reject the user's match in `event_id` and return the
    /// durable link as it stands afterwards. Repeating a completed review is
    /// a no-op success.
    pub async fn update_status_by_event(
        &self,
        user_id: &str,
        event_id: &str,
        status: LinkStatus,
    ) -> LinkResult<UserDriverLink> {
        if !matches!(status, LinkStatus::Confirmed | LinkStatus::Rejected) {
            return Err(LinkError::Validation(format!(
                "status must be confirmed or rejected, got {}",
                status
            )));
        }
        if user_id.trim().is_empty() || event_id.trim().is_empty() {
            return Err(LinkError::Validation(
                "user_id and event_id are required".to_string(),
            ));
        }

        let driver_id = self.driver_for_event(user_id, event_id).await?;
        let driver = driver_id.as_str();

        let link = with_driver_lock(
            &self.locks,
            driver,
            &self.config,
            "update_status_by_event",
            move || self.apply_review(user_id, driver, event_id, status),
        )
        .await?;

        info!(
            user_id,
            driver_id = %link.driver_id,
            event_id,
            status = %link.status,
            "Link reviewed"
        );
        Ok(link)
    }

    /// Resolve which driver the user matched in this event. Occurrences whose
    /// durable link is still open for review win over reviewed ones; among
    /// those the strongest evidence wins.
    async fn driver_for_event(&self, user_id: &str, event_id: &str) -> LinkResult<String> {
        let mut tx = self.store.begin().await?;
        let occurrences = tx.get_event_driver_links(user_id, event_id).await?;

        let mut open = Vec::new();
        let mut reviewed = Vec::new();
        for occurrence in occurrences {
            let owner = tx
                .get_user_driver_link(user_id, &occurrence.driver_id)
                .await?;
            match owner.map(|link| link.status) {
                Some(LinkStatus::Suggested | LinkStatus::Conflicted) => open.push(occurrence),
                Some(LinkStatus::Confirmed | LinkStatus::Rejected) | None => {
                    reviewed.push(occurrence)
                }
            }
        }
        drop(tx);

        strongest_event_link(open)
            .or_else(|| strongest_event_link(reviewed))
            .map(|link| link.driver_id)
            .ok_or_else(|| {
                LinkError::NotFound(format!(
                    "no driver link for user {} in event {}",
                    user_id, event_id
                ))
            })
    }

    async fn apply_review(
        &self,
        user_id: &str,
        driver_id: &str,
        event_id: &str,
        target: LinkStatus,
    ) -> LinkResult<UserDriverLink> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;
        tx.lock_driver(driver_id).await?;

        let mut occurrence = tx
            .get_event_driver_link_for_driver(user_id, driver_id, event_id)
            .await?
            .ok_or_else(|| {
                LinkError::NotFound(format!(
                    "no driver link for user {} in event {}",
                    user_id, event_id
                ))
            })?;

        let mut link = match tx.get_user_driver_link(user_id, driver_id).await? {
            Some(link) if link.id == occurrence.user_driver_link_id => link,
            _ => {
                error!(
                    user_id,
                    driver_id,
                    event_id,
                    event_link_id = %occurrence.id,
                    owner_id = %occurrence.user_driver_link_id,
                    "Event driver link has no owning user driver link"
                );
                return Err(LinkError::IntegrityViolation(format!(
                    "event driver link {} references missing user driver link {}",
                    occurrence.id, occurrence.user_driver_link_id
                )));
            }
        };

        match (link.status, target) {
            (current, target) if current == target => return Ok(link),
            (LinkStatus::Suggested, LinkStatus::Confirmed) => {
                if let Some(other) = tx.find_confirmed_link_for_driver(driver_id).await? {
                    if other.user_id != user_id {
                        return Err(LinkError::Conflict {
                            driver_id: driver_id.to_string(),
                        });
                    }
                }
                link.status = LinkStatus::Confirmed;
                link.confirmed_at = Some(now);
            }
            (LinkStatus::Suggested | LinkStatus::Conflicted, LinkStatus::Rejected) => {
                link.status = LinkStatus::Rejected;
                link.rejected_at = Some(now);
            }
            (LinkStatus::Conflicted, LinkStatus::Confirmed) => {
                return Err(LinkError::Forbidden(format!(
                    "link between user {} and driver {} is conflicted and needs admin resolution",
                    user_id, driver_id
                )));
            }
            (current @ (LinkStatus::Confirmed | LinkStatus::Rejected), target) => {
                return Err(LinkError::Forbidden(format!(
                    "link between user {} and driver {} is {} and cannot become {}",
                    user_id, driver_id, current, target
                )));
            }
            (_, LinkStatus::Suggested | LinkStatus::Conflicted) => {
                return Err(LinkError::Validation(format!(
                    "status must be confirmed or rejected, got {}",
                    target
                )));
            }
        }

        tx.upsert_user_driver_link(&link).await?;
        occurrence.reviewed_at = Some(now);
        tx.upsert_event_driver_link(&occurrence).await?;
        tx.commit().await?;

        Ok(link)
    }
}
