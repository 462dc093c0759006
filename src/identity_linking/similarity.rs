//! Similarity scoring between normalized driver names.
//!
//! Blends two signals:
//! 1. Token-set overlap (Jaccard-style, with partial credit for near-identical
//!    tokens) - tolerates reordering and added/removed tokens such as suffixes
//! 2. Normalized Levenshtein similarity over the full key - catches single
//!    character misspellings ("jayson" vs "jason")
//!
//! Inputs must already be normalized with
//! [`normalize_name`](super::normalize::normalize_name).

use strsim::normalized_levenshtein;

use super::normalize::tokens;

/// Blend weights for the similarity score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityWeights {
    /// Weight for token-set overlap (default 0.7)
    pub token_weight: f64,
    /// Weight for full-string edit similarity (default 0.3)
    pub edit_weight: f64,
    /// Minimum per-token edit similarity for a token pair to count as shared (default 0.8)
    pub token_match_floor: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            token_weight: 0.7,
            edit_weight: 0.3,
            token_match_floor: 0.8,
        }
    }
}

/// Score two normalized names in `[0, 1]` using default weights.
pub fn similarity(a: &str, b: &str) -> f64 {
    similarity_with(a, b, &SimilarityWeights::default())
}

/// Score two normalized names in `[0, 1]`.
pub fn similarity_with(a: &str, b: &str, weights: &SimilarityWeights) -> f64 {
    // Fast path: identical keys
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let overlap = token_overlap(a, b, weights.token_match_floor);
    let edit = normalized_levenshtein(a, b);

    let total = weights.token_weight + weights.edit_weight;
    if total <= 0.0 {
        return 0.0;
    }

    ((overlap * weights.token_weight + edit * weights.edit_weight) / total).clamp(0.0, 1.0)
}

/// Jaccard-style overlap: shared / (|A| + |B| - shared).
///
/// Each token of the shorter side is greedily paired with its most similar
/// unused token on the other side; a pair contributes its edit similarity when
/// that reaches `floor`, otherwise nothing.
pub fn token_overlap(a: &str, b: &str, floor: f64) -> f64 {
    let a_tokens = tokens(a);
    let b_tokens = tokens(b);
    if a_tokens.is_empty() || b_tokens.is_empty() {
        return 0.0;
    }

    let (short, long) = if a_tokens.len() <= b_tokens.len() {
        (&a_tokens, &b_tokens)
    } else {
        (&b_tokens, &a_tokens)
    };

    let mut used = vec![false; long.len()];
    let mut shared = 0.0;

    for token in short.iter() {
        let best = long
            .iter()
            .enumerate()
            .filter(|(idx, _)| !used[*idx])
            .map(|(idx, other)| (idx, token_similarity(token, other)))
            .max_by(|x, y| x.1.partial_cmp(&y.1).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((idx, score)) = best {
            if score >= floor {
                used[idx] = true;
                shared += score;
            }
        }
    }

    let union = (a_tokens.len() + b_tokens.len()) as f64 - shared;
    if union <= 0.0 {
        return 0.0;
    }
    shared / union
}

fn token_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        1.0
    } else {
        normalized_levenshtein(a, b)
    }
}
