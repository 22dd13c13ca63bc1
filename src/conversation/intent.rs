//! Keyword intent classification for the patient's spoken choice.
//!
//! Matching runs on lowercased text with ASCII punctuation removed. A keyword
//! matches as a substring of the whole text or as a whole word. Categories
//! are checked in a fixed order: emergency, contact, refusal, then the
//! too-short and default fallbacks.

use serde::Serialize;

const EMERGENCY_KEYWORDS: &[&str] = &["911", "nine", "emergency", "ambulance", "help"];
const CONTACT_KEYWORDS: &[&str] = &["family", "contact", "relative", "someone"];
const REFUSAL_KEYWORDS: &[&str] = &["neither", "no", "none", "dont", "nope", "nothing"];
const NEGATION_PATTERNS: &[&str] = &["no 911", "dont call", "not 911", "no emergency"];

/// Partials containing one of these act immediately
const URGENT_PARTIAL_TOKENS: &[&str] = &["911", "nine one one"];

/// Shortest cleaned text that is worth treating as an unclear answer
const MIN_ANSWER_CHARS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinueReason {
    TooShort,
    Unclear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Emergency,
    Contact,
    Neither,
    Continue(ContinueReason),
}

impl Intent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Intent::Continue(_))
    }
}

/// Lowercase and strip ASCII punctuation
pub fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .to_lowercase()
}

fn mentions_any(cleaned: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|k| cleaned.contains(k))
        || cleaned
            .split_whitespace()
            .any(|word| keywords.contains(&word))
}

pub fn classify(text: &str) -> Intent {
    let cleaned = normalize(text);

    if mentions_any(&cleaned, EMERGENCY_KEYWORDS) {
        if NEGATION_PATTERNS.iter().any(|neg| cleaned.contains(neg)) {
            return Intent::Neither;
        }
        return Intent::Emergency;
    }
    if mentions_any(&cleaned, CONTACT_KEYWORDS) {
        return Intent::Contact;
    }
    if mentions_any(&cleaned, REFUSAL_KEYWORDS) {
        return Intent::Neither;
    }
    if cleaned.trim().chars().count() < MIN_ANSWER_CHARS {
        return Intent::Continue(ContinueReason::TooShort);
    }
    Intent::Continue(ContinueReason::Unclear)
}

/// Whether a partial transcript should be classified without waiting for a commit
pub fn is_urgent_partial(text: &str) -> bool {
    let lower = text.to_lowercase();
    URGENT_PARTIAL_TOKENS.iter().any(|t| lower.contains(t))
}
