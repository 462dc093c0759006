//! Link repository abstraction
//!
//! The persistence layer is an external collaborator. The core only needs the
//! identity reads below plus a transactional unit for link writes; one
//! transaction covers one (user, driver) reconciliation unit or one status
//! update. Implementations target Postgres (`database` feature) or memory.

use async_trait::async_trait;

use super::{EventDriver, EventDriverLink, UserDriverLink, UserIdentity};
use crate::error::RepositoryError;

/// Read access to identities plus transaction factory
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Every user with a declared racing identity
    async fn fetch_all_user_identities(&self) -> Result<Vec<UserIdentity>, RepositoryError>;

    /// Drivers entered in an event, with the transponder observed there
    async fn fetch_driver_identities_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<EventDriver>, RepositoryError>;

    /// All durable links of a user, any status
    async fn list_user_driver_links(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserDriverLink>, RepositoryError>;

    /// All durable links of a driver identity, any user and status
    async fn list_driver_links(
        &self,
        driver_id: &str,
    ) -> Result<Vec<UserDriverLink>, RepositoryError>;

    /// All per-event occurrences owned by one durable link
    async fn list_event_driver_links(
        &self,
        user_driver_link_id: uuid::Uuid,
    ) -> Result<Vec<EventDriverLink>, RepositoryError>;

    /// Start a transactional unit of work
    async fn begin(&self) -> Result<Box<dyn LinkTransaction>, RepositoryError>;
}

/// A unit of work over link rows. Dropping without `commit` discards writes.
#[async_trait]
pub trait LinkTransaction: Send {
    /// Serialize writers touching links of this driver until commit/rollback
    async fn lock_driver(&mut self, driver_id: &str) -> Result<(), RepositoryError>;

    async fn get_user_driver_link(
        &mut self,
        user_id: &str,
        driver_id: &str,
    ) -> Result<Option<UserDriverLink>, RepositoryError>;

    /// The confirmed link for a driver, whoever owns it
    async fn find_confirmed_link_for_driver(
        &mut self,
        driver_id: &str,
    ) -> Result<Option<UserDriverLink>, RepositoryError>;

    /// Insert or update, keyed by (user_id, driver_id)
    async fn upsert_user_driver_link(
        &mut self,
        link: &UserDriverLink,
    ) -> Result<(), RepositoryError>;

    /// Every occurrence for a user within one event (usually zero or one)
    async fn get_event_driver_links(
        &mut self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Vec<EventDriverLink>, RepositoryError>;

    async fn get_event_driver_link_for_driver(
        &mut self,
        user_id: &str,
        driver_id: &str,
        event_id: &str,
    ) -> Result<Option<EventDriverLink>, RepositoryError>;

    /// Insert or update, keyed by (user_id, driver_id, event_id)
    async fn upsert_event_driver_link(
        &mut self,
        link: &EventDriverLink,
    ) -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;
}
