//! Linking configuration
//!
//! Thresholds and retry/concurrency knobs for the reconciler. Values come from
//! the environment with hard defaults, the same way `DatabaseConfig` does.

use std::time::Duration;

use tracing::warn;

use crate::identity_linking::SimilarityWeights;

/// Tunable thresholds and runtime settings for driver linking
#[derive(Debug, Clone)]
pub struct LinkingConfig {
    /// Minimum fuzzy score to surface a suggestion (`SUGGEST_MIN`)
    pub suggest_min: f64,
    /// Minimum fuzzy score treated as high confidence for conflict detection
    pub auto_link_min: f64,
    /// Similarity blend weights
    pub weights: SimilarityWeights,
    /// Attempts after the first for transient repository failures
    pub max_retries: u32,
    /// Base delay between retries, multiplied by the attempt number
    pub retry_backoff: Duration,
    /// Pairs persisted concurrently during one reconciliation run
    pub concurrency: usize,
}

impl Default for LinkingConfig {
    fn default() -> Self {
        Self {
            suggest_min: 0.65,
            auto_link_min: 0.85,
            weights: SimilarityWeights::default(),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            concurrency: 8,
        }
    }
}

impl LinkingConfig {
    /// Build from `DRIVER_LINK_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            suggest_min: env_or("DRIVER_LINK_SUGGEST_MIN", defaults.suggest_min),
            auto_link_min: env_or("DRIVER_LINK_AUTO_LINK_MIN", defaults.auto_link_min),
            weights: defaults.weights,
            max_retries: env_or("DRIVER_LINK_MAX_RETRIES", defaults.max_retries),
            retry_backoff: Duration::from_millis(env_or(
                "DRIVER_LINK_RETRY_BACKOFF_MS",
                defaults.retry_backoff.as_millis() as u64,
            )),
            concurrency: env_or("DRIVER_LINK_CONCURRENCY", defaults.concurrency).max(1),
        }
    }
}

fn env_or<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "Ignoring unparsable setting");
            default
        }),
        Err(_) => default,
    }
}
