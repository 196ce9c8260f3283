//! Ad text preparation for embedding generation.
//!
//! 1. Trim each field
//! 2. Skip empty fields
//! 3. Join the rest with a single space
//! 4. Truncate to max length with ellipsis

/// Maximum text length for embedding input (characters, not tokens)
const MAX_TEXT_LENGTH: usize = 512;

/// Ellipsis suffix when text is truncated
const TRUNCATION_SUFFIX: &str = "...";

/// Compose the embeddable text of an ad from its text fields.
///
/// Returns `None` if every field is missing or blank.
pub fn compose_ad_text<'a>(fields: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    let parts: Vec<&str> = fields
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();

    if parts.is_empty() {
        return None;
    }

    Some(truncate_text(&parts.join(" ")))
}

/// Truncate text to MAX_TEXT_LENGTH characters, adding ellipsis if truncated.
fn truncate_text(text: &str) -> String {
    if text.chars().count() <= MAX_TEXT_LENGTH {
        return text.to_string();
    }

    let max_chars = MAX_TEXT_LENGTH - TRUNCATION_SUFFIX.len();
    let truncated: String = text.chars().take(max_chars).collect();

    format!("{}{}", truncated, TRUNCATION_SUFFIX)
}
