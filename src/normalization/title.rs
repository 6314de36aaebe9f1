use strsim::jaro_winkler;

/// Search key for a game title.
///
/// Drops every character that is neither alphanumeric nor whitespace, lowercases,
/// and collapses whitespace runs into single spaces. Non-ASCII letters survive so
/// localized titles stay searchable.
pub fn normalize_title(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Jaro-Winkler similarity between two titles after normalization, in `0.0..=1.0`.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    jaro_winkler(&normalize_title(a), &normalize_title(b))
}
