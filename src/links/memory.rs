//! In-memory link store
//!
//! Transactional `LinkStore` backed by process memory. Used by tests and by
//! embedders that do not need durability. A transaction holds the store lock
//! for its whole lifetime and stages writes until commit, so uncommitted work
//! is discarded on drop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::repository::{LinkStore, LinkTransaction};
use super::{EventDriver, EventDriverLink, LinkStatus, UserDriverLink, UserIdentity};
use crate::error::RepositoryError;

type PairKey = (String, String);
type EventKey = (String, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    users: BTreeMap<String, UserIdentity>,
    event_entries: BTreeMap<String, Vec<EventDriver>>,
    user_links: HashMap<PairKey, UserDriverLink>,
    event_links: HashMap<EventKey, EventDriverLink>,
    failing_commits: u32,
}

/// Process-local implementation of [`LinkStore`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryLinkStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a user's declared identity
    pub async fn insert_user_identity(&self, user: UserIdentity) {
        let mut state = self.state.lock().await;
        state.users.insert(user.user_id.clone(), user);
    }

    /// Record a driver's entry in an event. Re-inserting the same driver
    /// replaces the earlier entry.
    pub async fn insert_event_entry(&self, event_id: &str, entry: EventDriver) {
        let mut state = self.state.lock().await;
        let entries = state.event_entries.entry(event_id.to_string()).or_default();
        entries.retain(|e| e.identity.driver_id != entry.identity.driver_id);
        entries.push(entry);
    }

    /// Store an event link without checking its owner, to set up corrupted data
    #[cfg(test)]
    pub(crate) async fn insert_event_driver_link_unchecked(&self, link: EventDriverLink) {
        let mut state = self.state.lock().await;
        let key = (
            link.user_id.clone(),
            link.driver_id.clone(),
            link.event_id.clone(),
        );
        state.event_links.insert(key, link);
    }

    /// Make the next `count` commits fail with a transient error
    pub async fn fail_next_commits(&self, count: u32) {
        self.state.lock().await.failing_commits = count;
    }

    /// Snapshot of every durable link, ordered by (user_id, driver_id)
    pub async fn user_driver_links(&self) -> Vec<UserDriverLink> {
        let state = self.state.lock().await;
        let mut links: Vec<_> = state.user_links.values().cloned().collect();
        links.sort_by(|a, b| (&a.user_id, &a.driver_id).cmp(&(&b.user_id, &b.driver_id)));
        links
    }

    /// Snapshot of every per-event link, ordered by (user_id, driver_id, event_id)
    pub async fn event_driver_links(&self) -> Vec<EventDriverLink> {
        let state = self.state.lock().await;
        let mut links: Vec<_> = state.event_links.values().cloned().collect();
        links.sort_by(|a, b| {
            (&a.user_id, &a.driver_id, &a.event_id).cmp(&(&b.user_id, &b.driver_id, &b.event_id))
        });
        links
    }
}

#[async_trait]
impl LinkStore for InMemoryLinkStore {
    async fn fetch_all_user_identities(&self) -> Result<Vec<UserIdentity>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.users.values().cloned().collect())
    }

    async fn fetch_driver_identities_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<EventDriver>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .event_entries
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_user_driver_links(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserDriverLink>, RepositoryError> {
        let state = self.state.lock().await;
        let mut links: Vec<_> = state
            .user_links
            .values()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.driver_id.cmp(&b.driver_id));
        Ok(links)
    }

    async fn list_driver_links(
        &self,
        driver_id: &str,
    ) -> Result<Vec<UserDriverLink>, RepositoryError> {
        let state = self.state.lock().await;
        let mut links: Vec<_> = state
            .user_links
            .values()
            .filter(|l| l.driver_id == driver_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        Ok(links)
    }

    async fn list_event_driver_links(
        &self,
        user_driver_link_id: Uuid,
    ) -> Result<Vec<EventDriverLink>, RepositoryError> {
        let state = self.state.lock().await;
        let mut links: Vec<_> = state
            .event_links
            .values()
            .filter(|l| l.user_driver_link_id == user_driver_link_id)
            .cloned()
            .collect();
        links.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        Ok(links)
    }

    async fn begin(&self) -> Result<Box<dyn LinkTransaction>, RepositoryError> {
        let guard = self.state.clone().lock_owned().await;
        Ok(Box::new(InMemoryTransaction {
            state: guard,
            user_links: HashMap::new(),
            event_links: HashMap::new(),
        }))
    }
}

/// Staged writes over an exclusively held store
struct InMemoryTransaction {
    state: OwnedMutexGuard<MemoryState>,
    user_links: HashMap<PairKey, UserDriverLink>,
    event_links: HashMap<EventKey, EventDriverLink>,
}

impl InMemoryTransaction {
    fn user_link(&self, key: &PairKey) -> Option<&UserDriverLink> {
        self.user_links
            .get(key)
            .or_else(|| self.state.user_links.get(key))
    }

    fn event_link(&self, key: &EventKey) -> Option<&EventDriverLink> {
        self.event_links
            .get(key)
            .or_else(|| self.state.event_links.get(key))
    }

    fn event_links_for(&self, user_id: &str, event_id: &str) -> Vec<EventDriverLink> {
        let mut keys: Vec<&EventKey> = self
            .state
            .event_links
            .keys()
            .chain(self.event_links.keys())
            .filter(|(u, _, e)| u == user_id && e == event_id)
            .collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .filter_map(|k| self.event_link(k).cloned())
            .collect()
    }
}

#[async_trait]
impl LinkTransaction for InMemoryTransaction {
    async fn lock_driver(&mut self, _driver_id: &str) -> Result<(), RepositoryError> {
        // The whole store is already held exclusively.
        Ok(())
    }

    async fn get_user_driver_link(
        &mut self,
        user_id: &str,
        driver_id: &str,
    ) -> Result<Option<UserDriverLink>, RepositoryError> {
        Ok(self
            .user_link(&(user_id.to_string(), driver_id.to_string()))
            .cloned())
    }

    async fn find_confirmed_link_for_driver(
        &mut self,
        driver_id: &str,
    ) -> Result<Option<UserDriverLink>, RepositoryError> {
        let mut keys: Vec<&PairKey> = self
            .state
            .user_links
            .keys()
            .chain(self.user_links.keys())
            .filter(|(_, d)| d == driver_id)
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys
            .into_iter()
            .filter_map(|k| self.user_link(k))
            .find(|l| l.status == LinkStatus::Confirmed)
            .cloned())
    }

    async fn upsert_user_driver_link(
        &mut self,
        link: &UserDriverLink,
    ) -> Result<(), RepositoryError> {
        let key = (link.user_id.clone(), link.driver_id.clone());
        if let Some(existing) = self.user_link(&key) {
            if existing.id != link.id {
                return Err(RepositoryError::Transient(format!(
                    "user_driver_links ({}, {}) already exists",
                    link.user_id, link.driver_id
                )));
            }
        }
        if link.status == LinkStatus::Confirmed {
            if let Some(other) = self.find_confirmed_link_for_driver(&link.driver_id).await? {
                if other.id != link.id {
                    return Err(RepositoryError::Storage(format!(
                        "driver {} already has a confirmed link",
                        link.driver_id
                    )));
                }
            }
        }
        self.user_links.insert(key, link.clone());
        Ok(())
    }

    async fn get_event_driver_links(
        &mut self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Vec<EventDriverLink>, RepositoryError> {
        Ok(self.event_links_for(user_id, event_id))
    }

    async fn get_event_driver_link_for_driver(
        &mut self,
        user_id: &str,
        driver_id: &str,
        event_id: &str,
    ) -> Result<Option<EventDriverLink>, RepositoryError> {
        let key = (
            user_id.to_string(),
            driver_id.to_string(),
            event_id.to_string(),
        );
        Ok(self.event_link(&key).cloned())
    }

    async fn upsert_event_driver_link(
        &mut self,
        link: &EventDriverLink,
    ) -> Result<(), RepositoryError> {
        let owner = (link.user_id.clone(), link.driver_id.clone());
        if self.user_link(&owner).map(|l| l.id) != Some(link.user_driver_link_id) {
            return Err(RepositoryError::Storage(format!(
                "event link for ({}, {}) references a missing user_driver_link {}",
                link.user_id, link.driver_id, link.user_driver_link_id
            )));
        }
        let key = (
            link.user_id.clone(),
            link.driver_id.clone(),
            link.event_id.clone(),
        );
        self.event_links.insert(key, link.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), RepositoryError> {
        if self.state.failing_commits > 0 {
            self.state.failing_commits -= 1;
            return Err(RepositoryError::Transient(
                "injected commit failure".to_string(),
            ));
        }
        let user_links = std::mem::take(&mut self.user_links);
        let event_links = std::mem::take(&mut self.event_links);
        self.state.user_links.extend(user_links);
        self.state.event_links.extend(event_links);
        Ok(())
    }
}
