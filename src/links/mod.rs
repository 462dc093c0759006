//! Link data model
//!
//! Two-tier model: a durable [`UserDriverLink`] per (user, driver) pair owns many
//! per-event [`EventDriverLink`] occurrences. Confirming or rejecting once
//! applies to every event of that driver identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LinkError;
use crate::identity_linking::normalize::normalize_name;
use crate::identity_linking::MatchResult;

pub mod locks;
pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;
pub mod repository;

pub use locks::DriverLocks;
pub use memory::InMemoryLinkStore;
#[cfg(feature = "database")]
pub use postgres::{DatabaseConfig, PgLinkStore};
pub use repository::{LinkStore, LinkTransaction};

// ============================================================================
// Status and match type
// ============================================================================

/// Review state of a durable user/driver link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Suggested,
    Confirmed,
    Rejected,
    Conflicted,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suggested => "suggested",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::Conflicted => "conflicted",
        }
    }

    /// Confirmed and rejected links only move again through an admin override.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Confirmed | Self::Rejected)
    }
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LinkStatus {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suggested" => Ok(Self::Suggested),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            "conflicted" => Ok(Self::Conflicted),
            _ => Err(LinkError::Validation(format!("Unknown link status: {}", s))),
        }
    }
}

impl TryFrom<String> for LinkStatus {
    type Error = LinkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Evidence that produced a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Transponder,
    Exact,
    Fuzzy,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transponder => "transponder",
            Self::Exact => "exact",
            Self::Fuzzy => "fuzzy",
        }
    }

    /// Higher is stronger evidence.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Transponder => 3,
            Self::Exact => 2,
            Self::Fuzzy => 1,
        }
    }
}

impl std::fmt::Display for MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for MatchType {
    type Err = LinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transponder" => Ok(Self::Transponder),
            "exact" => Ok(Self::Exact),
            "fuzzy" => Ok(Self::Fuzzy),
            _ => Err(LinkError::Validation(format!("Unknown match type: {}", s))),
        }
    }
}

impl TryFrom<String> for MatchType {
    type Error = LinkError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

// ============================================================================
// Identities
// ============================================================================

/// A user's self-declared racing identity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserIdentity {
    pub user_id: String,
    raw_display_name: String,
    normalized_name: String,
    pub transponder_number: Option<String>,
}

impl UserIdentity {
    pub fn new(
        user_id: impl Into<String>,
        raw_display_name: impl Into<String>,
        transponder_number: Option<String>,
    ) -> Self {
        let raw_display_name = raw_display_name.into();
        Self {
            user_id: user_id.into(),
            normalized_name: normalize_name(&raw_display_name),
            raw_display_name,
            transponder_number,
        }
    }

    pub fn raw_display_name(&self) -> &str {
        &self.raw_display_name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }

    /// Replace the display name and refresh the cached comparison key.
    pub fn set_display_name(&mut self, raw_display_name: impl Into<String>) {
        self.raw_display_name = raw_display_name.into();
        self.normalized_name = normalize_name(&self.raw_display_name);
    }
}

/// A scraped driver record from an ingestion source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriverIdentity {
    pub driver_id: String,
    raw_display_name: String,
    normalized_name: String,
    pub transponder_number: Option<String>,
    pub source_driver_id: String,
}

impl DriverIdentity {
    pub fn new(
        driver_id: impl Into<String>,
        raw_display_name: impl Into<String>,
        transponder_number: Option<String>,
        source_driver_id: impl Into<String>,
    ) -> Self {
        let raw_display_name = raw_display_name.into();
        Self {
            driver_id: driver_id.into(),
            normalized_name: normalize_name(&raw_display_name),
            raw_display_name,
            transponder_number,
            source_driver_id: source_driver_id.into(),
        }
    }

    pub fn raw_display_name(&self) -> &str {
        &self.raw_display_name
    }

    pub fn normalized_name(&self) -> &str {
        &self.normalized_name
    }
}

/// A driver's entry in one event, with the transponder observed there
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventDriver {
    pub identity: DriverIdentity,
    pub transponder_number: Option<String>,
}

impl EventDriver {
    pub fn new(identity: DriverIdentity, transponder_number: Option<String>) -> Self {
        Self {
            identity,
            transponder_number,
        }
    }

    /// The event-observed transponder, else the driver's stored one.
    pub fn effective_transponder(&self) -> Option<&str> {
        non_blank(self.transponder_number.as_deref())
            .or_else(|| non_blank(self.identity.transponder_number.as_deref()))
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Links
// ============================================================================

/// Durable, cross-event link between one user and one driver identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDriverLink {
    pub id: Uuid,
    pub user_id: String,
    pub driver_id: String,
    pub status: LinkStatus,
    pub match_type: MatchType,
    pub similarity_score: f64,
    pub matcher_id: String,
    pub matcher_version: i32,
    pub created_at: DateTime<Utc>,
    pub matched_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub conflict_reason: Option<String>,
}

impl UserDriverLink {
    /// New link for a first match. Status is `Suggested` unless a conflict
    /// reason is given, in which case it is `Conflicted`.
    pub fn from_match(
        user_id: &str,
        driver_id: &str,
        result: &MatchResult,
        conflict_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let status = if conflict_reason.is_some() {
            LinkStatus::Conflicted
        } else {
            LinkStatus::Suggested
        };
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            driver_id: driver_id.to_string(),
            status,
            match_type: result.match_type,
            similarity_score: result.similarity_score,
            matcher_id: result.matcher_id.to_string(),
            matcher_version: result.matcher_version,
            created_at: now,
            matched_at: now,
            confirmed_at: None,
            rejected_at: None,
            conflict_reason,
        }
    }

    /// Adopt stronger evidence. Returns false (and leaves the link untouched)
    /// unless the new score is strictly higher. Status never changes here.
    pub fn improve_with(&mut self, result: &MatchResult, now: DateTime<Utc>) -> bool {
        if result.similarity_score <= self.similarity_score {
            return false;
        }
        self.match_type = result.match_type;
        self.similarity_score = result.similarity_score;
        self.matcher_id = result.matcher_id.to_string();
        self.matcher_version = result.matcher_version;
        self.matched_at = now;
        true
    }
}

/// Match evidence recorded on an event occurrence
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evidence {
    pub match_type: MatchType,
    pub similarity_score: f64,
}

impl From<&MatchResult> for Evidence {
    fn from(result: &MatchResult) -> Self {
        Self {
            match_type: result.match_type,
            similarity_score: result.similarity_score,
        }
    }
}

/// The best evidence a durable link has accumulated so far.
impl From<&UserDriverLink> for Evidence {
    fn from(link: &UserDriverLink) -> Self {
        Self {
            match_type: link.match_type,
            similarity_score: link.similarity_score,
        }
    }
}

/// One occurrence of a user/driver link in a specific event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDriverLink {
    pub id: Uuid,
    pub user_driver_link_id: Uuid,
    pub user_id: String,
    pub driver_id: String,
    pub event_id: String,
    pub match_type: MatchType,
    pub similarity_score: f64,
    pub transponder_number: Option<String>,
    pub matched_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
}

impl EventDriverLink {
    pub fn new(
        owner: &UserDriverLink,
        event_id: &str,
        evidence: impl Into<Evidence>,
        transponder_number: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let evidence = evidence.into();
        Self {
            id: Uuid::new_v4(),
            user_driver_link_id: owner.id,
            user_id: owner.user_id.clone(),
            driver_id: owner.driver_id.clone(),
            event_id: event_id.to_string(),
            match_type: evidence.match_type,
            similarity_score: evidence.similarity_score,
            transponder_number,
            matched_at: now,
            reviewed_at: None,
        }
    }

    /// Overwrite match fields from a fresh evaluation of the same event.
    /// Returns true if anything changed; `matched_at` only moves on change.
    pub fn refresh(
        &mut self,
        owner: &UserDriverLink,
        evidence: impl Into<Evidence>,
        transponder_number: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        let evidence = evidence.into();
        let changed = self.user_driver_link_id != owner.id
            || self.match_type != evidence.match_type
            || self.similarity_score != evidence.similarity_score
            || self.transponder_number != transponder_number;
        if changed {
            self.user_driver_link_id = owner.id;
            self.match_type = evidence.match_type;
            self.similarity_score = evidence.similarity_score;
            self.transponder_number = transponder_number;
            self.matched_at = now;
        }
        changed
    }

    /// Ordering key for picking the strongest occurrence among several.
    pub(crate) fn evidence_key(&self) -> (u8, f64) {
        (self.match_type.rank(), self.similarity_score)
    }
}

/// Pick the strongest occurrence: match type rank, then score, then driver id.
pub(crate) fn strongest_event_link(links: Vec<EventDriverLink>) -> Option<EventDriverLink> {
    links.into_iter().max_by(|a, b| {
        let (rank_a, score_a) = a.evidence_key();
        let (rank_b, score_b) = b.evidence_key();
        rank_a
            .cmp(&rank_b)
            .then(score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| b.driver_id.cmp(&a.driver_id))
    })
}
