//! Driver matcher
//!
//! Decides whether a user's declared identity and a scraped driver record refer
//! to the same person. Decision order, first applicable wins:
//! 1. Equal transponder numbers (unless the source carries no transponder data)
//! 2. Equal normalized names
//! 3. Fuzzy similarity at or above the suggestion floor

use serde::Serialize;

use super::similarity::{similarity_with, SimilarityWeights};
use crate::config::LinkingConfig;
use crate::links::{DriverIdentity, MatchType, UserIdentity};

/// Identifier stamped on every link this matcher produces
pub const MATCHER_ID: &str = "driver-name-matcher";

/// Bump whenever scoring changes so historical links can be re-evaluated
pub const MATCHER_VERSION: i32 = 1;

/// Outcome of a successful match
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub match_type: MatchType,
    pub similarity_score: f64,
    pub matcher_id: &'static str,
    pub matcher_version: i32,
}

impl MatchResult {
    fn new(match_type: MatchType, similarity_score: f64) -> Self {
        Self {
            match_type,
            similarity_score,
            matcher_id: MATCHER_ID,
            matcher_version: MATCHER_VERSION,
        }
    }
}

/// Pure matching decision between a user identity and a driver identity
#[derive(Debug, Clone)]
pub struct DriverMatcher {
    suggest_min: f64,
    weights: SimilarityWeights,
}

impl Default for DriverMatcher {
    fn default() -> Self {
        Self::new(&LinkingConfig::default())
    }
}

impl DriverMatcher {
    pub fn new(config: &LinkingConfig) -> Self {
        Self {
            suggest_min: config.suggest_min,
            weights: config.weights,
        }
    }

    /// Match using the driver's stored transponder number.
    pub fn match_driver(
        &self,
        user: &UserIdentity,
        driver: &DriverIdentity,
        skip_transponder: bool,
    ) -> Option<MatchResult> {
        self.match_with_transponder(
            user,
            driver,
            driver.transponder_number.as_deref(),
            skip_transponder,
        )
    }

    /// Match using an explicit driver-side transponder number, typically the
    /// value observed in a specific event.
    pub fn match_with_transponder(
        &self,
        user: &UserIdentity,
        driver: &DriverIdentity,
        driver_transponder: Option<&str>,
        skip_transponder: bool,
    ) -> Option<MatchResult> {
        if !skip_transponder
            && transponders_equal(user.transponder_number.as_deref(), driver_transponder)
        {
            return Some(MatchResult::new(MatchType::Transponder, 1.0));
        }

        let user_key = user.normalized_name();
        let driver_key = driver.normalized_name();
        if user_key.is_empty() || driver_key.is_empty() {
            return None;
        }

        if user_key == driver_key {
            return Some(MatchResult::new(MatchType::Exact, 1.0));
        }

        let score = similarity_with(user_key, driver_key, &self.weights);
        (score >= self.suggest_min).then(|| MatchResult::new(MatchType::Fuzzy, score))
    }
}

/// Transponder numbers match when both are present, non-blank and equal after
/// trimming. Comparison is case sensitive.
fn transponders_equal(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(str::trim), b.map(str::trim)) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, transponder: Option<&str>) -> UserIdentity {
        UserIdentity::new("user-1", name, transponder.map(str::to_string))
    }

    fn driver(name: &str, transponder: Option<&str>) -> DriverIdentity {
        DriverIdentity::new("driver-1", name, transponder.map(str::to_string), "src-1")
    }

    #[test]
    fn test_fuzzy_single_letter_difference() {
        let matcher = DriverMatcher::default();
        let result = matcher
            .match_driver(&user("Jayson Brenton", None), &driver("Jason Brenton", None), true)
            .unwrap();
        assert_eq!(result.match_type, MatchType::Fuzzy);
        assert!(result.similarity_score >= LinkingConfig::default().suggest_min);
        assert!(result.similarity_score < 1.0);
    }

    #[test]
    fn test_exact_with_double_space() {
        let matcher = DriverMatcher::default();
        let result = matcher
            .match_driver(&user("Jayson Brenton", None), &driver("Jayson  Brenton", None), true)
            .unwrap();
        assert_eq!(result.match_type, MatchType::Exact);
        assert_eq!(result.similarity_score, 1.0);
    }

    #[test]
    fn test_truncated_name_does_not_match() {
        let matcher = DriverMatcher::default();
        assert!(matcher
            .match_driver(&user("Jayson Brenton", None), &driver("Jayson B.", None), true)
            .is_none());
    }

    #[test]
    fn test_transponder_wins_over_name_mismatch() {
        let matcher = DriverMatcher::default();
        let result = matcher
            .match_driver(
                &user("Jayson Brenton", Some("1234567")),
                &driver("Someone Else", Some(" 1234567 ")),
                false,
            )
            .unwrap();
        assert_eq!(result.match_type, MatchType::Transponder);
        assert_eq!(result.similarity_score, 1.0);
    }

    #[test]
    fn test_transponder_beats_fuzzy() {
        let matcher = DriverMatcher::default();
        let result = matcher
            .match_driver(
                &user("Jayson Brenton", Some("42")),
                &driver("Jason Brenton", Some("42")),
                false,
            )
            .unwrap();
        assert_eq!(result.match_type, MatchType::Transponder);
    }

    #[test]
    fn test_skip_transponder_ignores_numbers() {
        let matcher = DriverMatcher::default();
        assert!(matcher
            .match_driver(
                &user("Jayson Brenton", Some("42")),
                &driver("Someone Else", Some("42")),
                true,
            )
            .is_none());
    }

    #[test]
    fn test_transponder_is_case_sensitive() {
        let matcher = DriverMatcher::default();
        assert!(matcher
            .match_driver(
                &user("Jayson Brenton", Some("abc")),
                &driver("Someone Else", Some("ABC")),
                false,
            )
            .is_none());
    }

    #[test]
    fn test_blank_transponders_do_not_match() {
        assert!(!transponders_equal(Some("  "), Some("  ")));
        assert!(!transponders_equal(None, Some("1")));
    }

    #[test]
    fn test_empty_names_never_match() {
        let matcher = DriverMatcher::default();
        assert!(matcher
            .match_driver(&user("RC Team", None), &driver("Club", None), true)
            .is_none());
    }

    #[test]
    fn test_event_transponder_overrides_stored() {
        let matcher = DriverMatcher::default();
        let result = matcher
            .match_with_transponder(
                &user("Jayson Brenton", Some("777")),
                &driver("Someone Else", Some("111")),
                Some("777"),
                false,
            )
            .unwrap();
        assert_eq!(result.match_type, MatchType::Transponder);
    }

    #[test]
    fn test_provenance_stamped() {
        let matcher = DriverMatcher::default();
        let result = matcher
            .match_driver(&user("John Doe", None), &driver("Doe John", None), true)
            .unwrap();
        assert_eq!(result.matcher_id, MATCHER_ID);
        assert_eq!(result.matcher_version, MATCHER_VERSION);
    }
}
