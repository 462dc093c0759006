//! Postgres link store
//!
//! Reads identities from the ingestion-owned tables (`user_identities`,
//! `drivers`, `race_drivers`) and owns `user_driver_links` /
//! `event_driver_links` (see `migrations/0001_driver_links.sql`).
//!
//! Each transaction takes `pg_advisory_xact_lock(hashtext(driver_id))` before
//! touching a driver's links, so the reconciler and user review never race on
//! the same rows even across processes. Unique-constraint and serialization
//! failures surface as `RepositoryError::Transient` for the caller to retry.
//!
//! NOTE: All queries use runtime-checked sqlx::query() because the tables may
//! not exist when the crate is compiled.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{info, warn};
use uuid::Uuid;

use super::repository::{LinkStore, LinkTransaction};
use super::{DriverIdentity, EventDriver, EventDriverLink, UserDriverLink, UserIdentity};
use crate::error::RepositoryError;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/racing".to_string()),
            max_connections: std::env::var("DATABASE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

// ============================================================================
// Private FromRow types - converted to public types via TryFrom
// ============================================================================

#[derive(FromRow)]
struct UserIdentityRow {
    user_id: String,
    display_name: Option<String>,
    transponder_number: Option<String>,
}

impl From<UserIdentityRow> for UserIdentity {
    fn from(r: UserIdentityRow) -> Self {
        UserIdentity::new(
            r.user_id,
            r.display_name.unwrap_or_default(),
            r.transponder_number,
        )
    }
}

#[derive(FromRow)]
struct EventDriverRow {
    driver_id: String,
    display_name: Option<String>,
    driver_transponder: Option<String>,
    source_driver_id: String,
    event_transponder: Option<String>,
}

impl From<EventDriverRow> for EventDriver {
    fn from(r: EventDriverRow) -> Self {
        EventDriver::new(
            DriverIdentity::new(
                r.driver_id,
                r.display_name.unwrap_or_default(),
                r.driver_transponder,
                r.source_driver_id,
            ),
            r.event_transponder,
        )
    }
}

#[derive(FromRow)]
struct UserDriverLinkRow {
    id: Uuid,
    user_id: String,
    driver_id: String,
    status: String,
    match_type: String,
    similarity_score: f64,
    matcher_id: String,
    matcher_version: i32,
    created_at: DateTime<Utc>,
    matched_at: DateTime<Utc>,
    confirmed_at: Option<DateTime<Utc>>,
    rejected_at: Option<DateTime<Utc>>,
    conflict_reason: Option<String>,
}

impl TryFrom<UserDriverLinkRow> for UserDriverLink {
    type Error = RepositoryError;

    fn try_from(r: UserDriverLinkRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            user_id: r.user_id,
            driver_id: r.driver_id,
            status: parse_column(r.status)?,
            match_type: parse_column(r.match_type)?,
            similarity_score: r.similarity_score,
            matcher_id: r.matcher_id,
            matcher_version: r.matcher_version,
            created_at: r.created_at,
            matched_at: r.matched_at,
            confirmed_at: r.confirmed_at,
            rejected_at: r.rejected_at,
            conflict_reason: r.conflict_reason,
        })
    }
}

#[derive(FromRow)]
struct EventDriverLinkRow {
    id: Uuid,
    user_driver_link_id: Uuid,
    user_id: String,
    driver_id: String,
    event_id: String,
    match_type: String,
    similarity_score: f64,
    transponder_number: Option<String>,
    matched_at: DateTime<Utc>,
    reviewed_at: Option<DateTime<Utc>>,
}

impl TryFrom<EventDriverLinkRow> for EventDriverLink {
    type Error = RepositoryError;

    fn try_from(r: EventDriverLinkRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: r.id,
            user_driver_link_id: r.user_driver_link_id,
            user_id: r.user_id,
            driver_id: r.driver_id,
            event_id: r.event_id,
            match_type: parse_column(r.match_type)?,
            similarity_score: r.similarity_score,
            transponder_number: r.transponder_number,
            matched_at: r.matched_at,
            reviewed_at: r.reviewed_at,
        })
    }
}

fn parse_column<T>(raw: String) -> Result<T, RepositoryError>
where
    T: TryFrom<String, Error = crate::error::LinkError>,
{
    T::try_from(raw).map_err(|e| RepositoryError::Storage(e.to_string()))
}

fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>, RepositoryError>
where
    T: TryFrom<R, Error = RepositoryError>,
{
    rows.into_iter().map(T::try_from).collect()
}

const USER_LINK_COLUMNS: &str = r#"
    id, user_id, driver_id, status, match_type, similarity_score, matcher_id,
    matcher_version, created_at, matched_at, confirmed_at, rejected_at, conflict_reason
"#;

const EVENT_LINK_COLUMNS: &str = r#"
    id, user_driver_link_id, user_id, driver_id, event_id, match_type,
    similarity_score, transponder_number, matched_at, reviewed_at
"#;

// ============================================================================
// Store
// ============================================================================

/// sqlx/Postgres implementation of [`LinkStore`]
#[derive(Debug, Clone)]
pub struct PgLinkStore {
    pool: PgPool,
}

impl PgLinkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool using the given configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        info!(
            "Connecting to database: {}",
            mask_database_url(&config.database_url)
        );

        let mut options = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout);
        if let Some(idle_timeout) = config.idle_timeout {
            options = options.idle_timeout(idle_timeout);
        }

        let pool = options
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to database: {}", e);
                RepositoryError::from(e)
            })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LinkStore for PgLinkStore {
    async fn fetch_all_user_identities(&self) -> Result<Vec<UserIdentity>, RepositoryError> {
        let rows: Vec<UserIdentityRow> = sqlx::query_as(
            r#"
            SELECT user_id, display_name, transponder_number
            FROM user_identities
            WHERE display_name IS NOT NULL OR transponder_number IS NOT NULL
            ORDER BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(UserIdentity::from).collect())
    }

    async fn fetch_driver_identities_for_event(
        &self,
        event_id: &str,
    ) -> Result<Vec<EventDriver>, RepositoryError> {
        let rows: Vec<EventDriverRow> = sqlx::query_as(
            r#"
            SELECT DISTINCT ON (d.driver_id)
                d.driver_id,
                d.display_name,
                d.transponder_number AS driver_transponder,
                d.source_driver_id,
                rd.transponder_number AS event_transponder
            FROM race_drivers rd
            JOIN drivers d ON d.driver_id = rd.driver_id
            WHERE rd.event_id = $1
            ORDER BY d.driver_id, rd.transponder_number NULLS LAST
            "#,
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(EventDriver::from).collect())
    }

    async fn list_user_driver_links(
        &self,
        user_id: &str,
    ) -> Result<Vec<UserDriverLink>, RepositoryError> {
        let rows: Vec<UserDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {USER_LINK_COLUMNS} FROM user_driver_links WHERE user_id = $1 ORDER BY driver_id"
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_driver_links(
        &self,
        driver_id: &str,
    ) -> Result<Vec<UserDriverLink>, RepositoryError> {
        let rows: Vec<UserDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {USER_LINK_COLUMNS} FROM user_driver_links WHERE driver_id = $1 ORDER BY user_id"
        ))
        .bind(driver_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn list_event_driver_links(
        &self,
        user_driver_link_id: Uuid,
    ) -> Result<Vec<EventDriverLink>, RepositoryError> {
        let rows: Vec<EventDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_LINK_COLUMNS} FROM event_driver_links \
             WHERE user_driver_link_id = $1 ORDER BY event_id"
        ))
        .bind(user_driver_link_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    async fn begin(&self) -> Result<Box<dyn LinkTransaction>, RepositoryError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLinkTransaction { tx }))
    }
}

/// One Postgres transaction; rolls back on drop unless committed
struct PgLinkTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LinkTransaction for PgLinkTransaction {
    async fn lock_driver(&mut self, driver_id: &str) -> Result<(), RepositoryError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(driver_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn get_user_driver_link(
        &mut self,
        user_id: &str,
        driver_id: &str,
    ) -> Result<Option<UserDriverLink>, RepositoryError> {
        let row: Option<UserDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {USER_LINK_COLUMNS} FROM user_driver_links \
             WHERE user_id = $1 AND driver_id = $2 FOR UPDATE"
        ))
        .bind(user_id)
        .bind(driver_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(UserDriverLink::try_from).transpose()
    }

    async fn find_confirmed_link_for_driver(
        &mut self,
        driver_id: &str,
    ) -> Result<Option<UserDriverLink>, RepositoryError> {
        let row: Option<UserDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {USER_LINK_COLUMNS} FROM user_driver_links \
             WHERE driver_id = $1 AND status = 'confirmed'"
        ))
        .bind(driver_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(UserDriverLink::try_from).transpose()
    }

    async fn upsert_user_driver_link(
        &mut self,
        link: &UserDriverLink,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_driver_links
                (id, user_id, driver_id, status, match_type, similarity_score, matcher_id,
                 matcher_version, created_at, matched_at, confirmed_at, rejected_at,
                 conflict_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (user_id, driver_id) DO UPDATE SET
                status = EXCLUDED.status,
                match_type = EXCLUDED.match_type,
                similarity_score = EXCLUDED.similarity_score,
                matcher_id = EXCLUDED.matcher_id,
                matcher_version = EXCLUDED.matcher_version,
                matched_at = EXCLUDED.matched_at,
                confirmed_at = EXCLUDED.confirmed_at,
                rejected_at = EXCLUDED.rejected_at,
                conflict_reason = EXCLUDED.conflict_reason
            WHERE user_driver_links.id = EXCLUDED.id
            "#,
        )
        .bind(link.id)
        .bind(&link.user_id)
        .bind(&link.driver_id)
        .bind(link.status.as_str())
        .bind(link.match_type.as_str())
        .bind(link.similarity_score)
        .bind(&link.matcher_id)
        .bind(link.matcher_version)
        .bind(link.created_at)
        .bind(link.matched_at)
        .bind(link.confirmed_at)
        .bind(link.rejected_at)
        .bind(&link.conflict_reason)
        .execute(&mut *self.tx)
        .await
        .map_err(RepositoryError::from)
        .and_then(|result| {
            if result.rows_affected() == 0 {
                // Another writer created this pair with a different id first.
                Err(RepositoryError::Transient(format!(
                    "user_driver_links ({}, {}) already exists",
                    link.user_id, link.driver_id
                )))
            } else {
                Ok(())
            }
        })
    }

    async fn get_event_driver_links(
        &mut self,
        user_id: &str,
        event_id: &str,
    ) -> Result<Vec<EventDriverLink>, RepositoryError> {
        let rows: Vec<EventDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_LINK_COLUMNS} FROM event_driver_links \
             WHERE user_id = $1 AND event_id = $2 ORDER BY driver_id"
        ))
        .bind(user_id)
        .bind(event_id)
        .fetch_all(&mut *self.tx)
        .await?;
        convert_all(rows)
    }

    async fn get_event_driver_link_for_driver(
        &mut self,
        user_id: &str,
        driver_id: &str,
        event_id: &str,
    ) -> Result<Option<EventDriverLink>, RepositoryError> {
        let row: Option<EventDriverLinkRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_LINK_COLUMNS} FROM event_driver_links \
             WHERE user_id = $1 AND driver_id = $2 AND event_id = $3 FOR UPDATE"
        ))
        .bind(user_id)
        .bind(driver_id)
        .bind(event_id)
        .fetch_optional(&mut *self.tx)
        .await?;
        row.map(EventDriverLink::try_from).transpose()
    }

    async fn upsert_event_driver_link(
        &mut self,
        link: &EventDriverLink,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO event_driver_links
                (id, user_driver_link_id, user_id, driver_id, event_id, match_type,
                 similarity_score, transponder_number, matched_at, reviewed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (user_id, driver_id, event_id) DO UPDATE SET
                user_driver_link_id = EXCLUDED.user_driver_link_id,
                match_type = EXCLUDED.match_type,
                similarity_score = EXCLUDED.similarity_score,
                transponder_number = EXCLUDED.transponder_number,
                matched_at = EXCLUDED.matched_at,
                reviewed_at = EXCLUDED.reviewed_at
            "#,
        )
        .bind(link.id)
        .bind(link.user_driver_link_id)
        .bind(&link.user_id)
        .bind(&link.driver_id)
        .bind(&link.event_id)
        .bind(link.match_type.as_str())
        .bind(link.similarity_score)
        .bind(&link.transponder_number)
        .bind(link.matched_at)
        .bind(link.reviewed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Mask credentials in a database URL for logging
fn mask_database_url(url: &str) -> String {
    let Ok(parsed) = url::Url::parse(url) else {
        // Unparsable URLs may still carry credentials
        let chars: Vec<char> = url.chars().collect();
        return if chars.len() > 20 {
            let head: String = chars[..10].iter().collect();
            let tail: String = chars[chars.len() - 10..].iter().collect();
            format!("{}***{}", head, tail)
        } else {
            "***".to_string()
        };
    };

    let mut masked = parsed.clone();
    if parsed.password().is_some() {
        let _ = masked.set_password(Some("***"));
    }
    if parsed.query_pairs().any(|(key, _)| key == "password") {
        let pairs: Vec<(String, String)> = parsed
            .query_pairs()
            .map(|(key, value)| {
                let value = if key == "password" {
                    "***".to_string()
                } else {
                    value.into_owned()
                };
                (key.into_owned(), value)
            })
            .collect();
        masked.query_pairs_mut().clear().extend_pairs(pairs);
    }
    masked.to_string()
}
