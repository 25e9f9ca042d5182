use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_SCORE: u8 = 100;

/// Labels an auditor may put in front of its numeric verdict, longest first.
pub const SCORE_LABELS: &[&str] = &[
    "quality score",
    "similarity score",
    "fidelity score",
    "final score",
    "pontuação",
    "pontuacao",
    "score",
    "nota",
];

static SCORE_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    let labels = SCORE_LABELS
        .iter()
        .map(|label| regex::escape(label).replace(' ', r"\s+"))
        .collect::<Vec<String>>()
        .join("|");
    Regex::new(&format!(r"(?i)\b(?:{labels})\b\D*?(\d+)")).ok()
});

/// Pull the first labelled score out of free-form audit text.
///
/// Anything unexpected (no label, no number, more than three digits, a value
/// above 100) yields 0, which the caller treats as a failed audit.
pub fn extract_score(audit_text: &str) -> u8 {
    let Some(pattern) = SCORE_PATTERN.as_ref() else {
        return 0;
    };
    let Some(digits) = pattern
        .captures(audit_text)
        .and_then(|captures| captures.get(1))
        .map(|found| found.as_str())
    else {
        return 0;
    };
    if digits.len() > 3 {
        return 0;
    }
    match digits.parse::<u8>() {
        Ok(value) if value <= MAX_SCORE => value,
        _ => 0,
    }
}
