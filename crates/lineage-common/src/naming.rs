//! File name helpers

use regex::Regex;
use std::sync::OnceLock;

/// Longest label fragment used in a result file name
pub const MAX_STEM_LENGTH: usize = 100;

#[allow(clippy::expect_used)]
fn disallowed() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9\-]").expect("static pattern"))
}

#[allow(clippy::expect_used)]
fn dash_runs() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"-+").expect("static pattern"))
}

/// Turn a free-form label into a filesystem-safe stem.
///
/// Lowercases, maps spaces to dashes, drops anything outside `[a-z0-9-]`,
/// collapses dash runs, trims leading/trailing dashes and crops the result
/// to [`MAX_STEM_LENGTH`] characters.
pub fn safe_stem(label: &str) -> String {
    let lowered = label.to_lowercase().replace(' ', "-");
    let stripped = disallowed().replace_all(&lowered, "");
    let collapsed = dash_runs().replace_all(&stripped, "-");
    let trimmed = collapsed.trim_matches('-');

    let cropped: String = trimmed.chars().take(MAX_STEM_LENGTH).collect();
    cropped.trim_end_matches('-').to_string()
}

/// Join stem fragments with single dashes, skipping empty ones
pub fn join_stem(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-");
    dash_runs().replace_all(&joined, "-").into_owned()
}
