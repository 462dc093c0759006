//! Driver identity matching
//!
//! Pure, side-effect free building blocks used by the reconciler:
//! - `normalize` - canonical comparison keys for free-text names
//! - `similarity` - token overlap + edit distance scoring
//! - `matcher` - transponder / exact / fuzzy decision

pub mod matcher;
pub mod normalize;
pub mod similarity;

pub use matcher::{DriverMatcher, MatchResult, MATCHER_ID, MATCHER_VERSION};
pub use normalize::{normalize_driver_name, normalize_name};
pub use similarity::{similarity, similarity_with, SimilarityWeights};
