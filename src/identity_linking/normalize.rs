//! Driver name normalization
//!
//! Turns a free-text display name into a canonical comparison key:
//! - Unicode NFKC fold
//! - ASCII lowercase conversion (locale independent)
//! - `&` expanded to the token `and`
//! - Hyphens between words become spaces, other punctuation is dropped
//! - Noise tokens (`rc`, `team`, `club`, `raceway`, `inc`) removed
//! - Tokens sorted lexicographically and joined with single spaces

use smallvec::SmallVec;
use unicode_normalization::UnicodeNormalization;

/// Whole tokens that carry no identity information in scraped result lists
const NOISE_TOKENS: &[&str] = &["rc", "team", "club", "raceway", "inc"];

/// Normalize a driver or user display name for matching.
///
/// `None` and blank input produce an empty key.
///
/// # Examples
///
/// ```
/// use driver_link::identity_linking::normalize::normalize_driver_name;
///
/// assert_eq!(normalize_driver_name(Some("Doe, John")), "doe john");
/// assert_eq!(normalize_driver_name(Some("Mary-Jane Watson RC")), "jane mary watson");
/// assert_eq!(normalize_driver_name(None), "");
/// ```
pub fn normalize_driver_name(raw: Option<&str>) -> String {
    match raw {
        Some(s) => normalize_name(s),
        None => String::new(),
    }
}

/// Normalize a display name. Same as [`normalize_driver_name`] for present input.
pub fn normalize_name(raw: &str) -> String {
    let folded: Vec<char> = raw.nfkc().collect();
    let mut cleaned = String::with_capacity(folded.len());

    for (i, &c) in folded.iter().enumerate() {
        match c {
            '&' => cleaned.push_str(" and "),
            '-' => {
                let joins_words = i > 0
                    && folded[i - 1].is_alphanumeric()
                    && folded.get(i + 1).is_some_and(|n| n.is_alphanumeric());
                if joins_words {
                    cleaned.push(' ');
                }
            }
            c if c.is_whitespace() => cleaned.push(' '),
            c if c.is_alphanumeric() => cleaned.push(c.to_ascii_lowercase()),
            _ => {}
        }
    }

    let mut tokens: SmallVec<[&str; 6]> = cleaned
        .split_whitespace()
        .filter(|t| !is_noise_token(t))
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Split an already normalized key into its tokens.
pub fn tokens(normalized: &str) -> SmallVec<[&str; 6]> {
    normalized.split_whitespace().collect()
}

fn is_noise_token(token: &str) -> bool {
    NOISE_TOKENS.contains(&token)
}
