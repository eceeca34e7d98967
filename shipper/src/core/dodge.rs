//! Library of evasive phrasings that signal the agent avoided the task.

use std::sync::LazyLock;

use regex::Regex;

const PATTERNS: &[(&str, &str)] = &[
    ("apology", r"(?i)\bI(?:'m| am) (?:so |very )?sorry\b"),
    ("apology", r"(?i)\bI apologi[sz]e\b"),
    (
        "refusal",
        r"(?i)\bI (?:cannot|can't|can not|won't|will not|am unable to|am not able to)\b",
    ),
    ("refusal", r"(?i)\bI(?:'m| am) (?:unable|not able) to\b"),
    ("refusal", r"(?i)\bas an ai\b"),
    (
        "scope",
        r"(?i)\b(?:beyond|outside) (?:my|the) (?:scope|capabilities|abilities)\b",
    ),
    ("deferral", r"(?i)\bleft as an exercise\b"),
    (
        "deferral",
        r"(?i)\byou (?:will need|need|may want|might want|should) to (?:implement|complete|write|add|fill in) (?:this|it|the rest)\b",
    ),
    ("deferral", r"(?i)\bimplement (?:this|the rest) yourself\b"),
    ("deferral", r"(?i)\b(?:rest|remainder) of the (?:code|implementation|file) (?:goes|would go) here\b"),
    (
        "clarification",
        r"(?i)\bI(?:'d| would) need more (?:information|context|details)\b",
    ),
];

static DODGE_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    PATTERNS
        .iter()
        .map(|(label, pattern)| {
            let regex = Regex::new(pattern).expect("dodge pattern should be valid");
            (*label, regex)
        })
        .collect()
});

/// A matched evasive phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DodgeMatch {
    pub label: &'static str,
    pub phrase: String,
}

/// Return the first evasive phrase found in `text`, if any.
pub fn detect_dodge(text: &str) -> Option<DodgeMatch> {
    DODGE_PATTERNS.iter().find_map(|(label, regex)| {
        regex.find(text).map(|m| DodgeMatch {
            label,
            phrase: m.as_str().to_string(),
        })
    })
}
