//! Best-effort confidence extraction from free-form summary text.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::Confidence;

static EXPLICIT_MARKER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)\bconfidence\b[\s*_]*[:=\-][\s*_]*(high|medium|low)\b").ok()
});

/// Explicit `confidence: <level>` markers win, the last one if several.
/// Otherwise the highest level in a markdown table's Confidence column.
pub fn classify(text: &str) -> Confidence {
    explicit_marker(text)
        .or_else(|| table_column(text))
        .unwrap_or(Confidence::Unknown)
}

fn explicit_marker(text: &str) -> Option<Confidence> {
    let regex = EXPLICIT_MARKER.as_ref()?;
    regex
        .captures_iter(text)
        .last()
        .and_then(|caps| caps.get(1))
        .and_then(|level| level.as_str().parse().ok())
}

fn table_column(text: &str) -> Option<Confidence> {
    let mut column = None;
    let mut best: Option<Confidence> = None;

    for line in text.lines().map(str::trim) {
        if !line.starts_with('|') {
            column = None;
            continue;
        }
        let cells: Vec<&str> = line.trim_matches('|').split('|').map(str::trim).collect();
        match column {
            None => {
                column = cells
                    .iter()
                    .position(|cell| cell.trim_matches('*').eq_ignore_ascii_case("confidence"));
            }
            Some(idx) => {
                if let Some(level) = cells.get(idx).and_then(|cell| level_in(cell)) {
                    best = best.max(Some(level));
                }
            }
        }
    }
    best
}

fn level_in(cell: &str) -> Option<Confidence> {
    let lower = cell.to_ascii_lowercase();
    [Confidence::High, Confidence::Medium, Confidence::Low]
        .into_iter()
        .find(|level| lower.contains(level.as_ref()))
}
