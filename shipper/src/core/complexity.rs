//! Structural classification and splitting of TODO instructions.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Complexity;

/// Instructions longer than this are always treated as complex.
pub const COMPLEX_CHAR_THRESHOLD: usize = 600;
/// Distinct action verbs at or above this count make an instruction complex.
pub const COMPLEX_VERB_THRESHOLD: usize = 3;

const ACTION_VERBS: &[&str] = &[
    "add",
    "build",
    "change",
    "create",
    "delete",
    "document",
    "extract",
    "fix",
    "implement",
    "introduce",
    "migrate",
    "move",
    "refactor",
    "remove",
    "rename",
    "replace",
    "rewrite",
    "support",
    "test",
    "update",
    "upgrade",
    "write",
];

const HEDGES: &[&str] = &[
    "maybe",
    "perhaps",
    "somehow",
    "something",
    "stuff",
    "whatever",
    "etc",
    "things",
    "better",
    "nicer",
];

static BULLET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(.+)$").expect("bullet pattern should be valid")
});

static THEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i),?\s+(?:and\s+)?then\s+").expect("then pattern should be valid")
});

fn words(instruction: &str) -> Vec<String> {
    instruction
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Distinct action verbs present in `instruction`, in alphabetical order.
pub fn action_verbs(instruction: &str) -> Vec<&'static str> {
    let words: BTreeSet<String> = words(instruction).into_iter().collect();
    ACTION_VERBS
        .iter()
        .copied()
        .filter(|verb| words.contains(*verb))
        .collect()
}

fn bullet_items(instruction: &str) -> Vec<String> {
    instruction
        .lines()
        .filter_map(|line| BULLET.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim().to_string()))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Classify an instruction from its length, verb count, asks and hedging.
pub fn classify_instruction(instruction: &str) -> Complexity {
    let trimmed = instruction.trim();
    let words = words(trimmed);
    let verbs = action_verbs(trimmed);
    let hedged = words.iter().any(|w| HEDGES.contains(&w.as_str()));

    if words.len() < 3 || (verbs.is_empty() && hedged) {
        return Complexity::Ambiguous;
    }
    let asks = trimmed.matches('?').count();
    if trimmed.chars().count() > COMPLEX_CHAR_THRESHOLD
        || verbs.len() >= COMPLEX_VERB_THRESHOLD
        || asks > 1
        || bullet_items(trimmed).len() > 1
    {
        return Complexity::Complex;
    }
    Complexity::Simple
}

/// Split an instruction into ordered sub-instructions.
///
/// Bullet or numbered lines win when present; otherwise the text is cut at
/// sentence ends and at "then" conjunctions. Always returns at least one part.
pub fn split_instruction(instruction: &str) -> Vec<String> {
    let trimmed = instruction.trim();
    let bullets = bullet_items(trimmed);
    if bullets.len() > 1 {
        return bullets;
    }

    let mut parts = Vec::new();
    for sentence in split_sentences(trimmed) {
        for piece in THEN.split(&sentence) {
            let piece = piece.trim().trim_end_matches(['.', ';']).trim();
            if !piece.is_empty() {
                parts.push(piece.to_string());
            }
        }
    }
    if parts.is_empty() {
        parts.push(trimmed.to_string());
    }
    parts
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        current.push(c);
        let boundary = c == '\n'
            || (matches!(c, '.' | '!' | '?' | ';')
                && chars.peek().is_none_or(|next| next.is_whitespace()));
        if boundary {
            sentences.push(std::mem::take(&mut current));
        }
    }
    sentences.push(current);
    sentences
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_or_hedged_instructions_are_ambiguous() {
        assert_eq!(classify_instruction("fix it"), Complexity::Ambiguous);
        assert_eq!(
            classify_instruction("make the landing page nicer somehow"),
            Complexity::Ambiguous
        );
    }

    #[test]
    fn single_ask_is_simple() {
        assert_eq!(
            classify_instruction("Add a CHANGELOG entry for release notes"),
            Complexity::Simple
        );
    }

    #[test]
    fn many_verbs_or_bullets_are_complex() {
        assert_eq!(
            classify_instruction("Rename the parser module, update its tests and remove the old shim"),
            Complexity::Complex
        );
        assert_eq!(
            classify_instruction("Handle config:\n- add a default path\n- document the env override"),
            Complexity::Complex
        );
        assert_eq!(
            classify_instruction(&format!("Add docs {}", "word ".repeat(200))),
            Complexity::Complex
        );
    }

    #[test]
    fn split_prefers_bullets() {
        let parts = split_instruction("Handle config:\n- add a default path\n2. document the env override");
        assert_eq!(parts, vec!["add a default path", "document the env override"]);
    }

    #[test]
    fn split_cuts_sentences_and_then() {
        let parts = split_instruction(
            "Create src/util.rs with a slugify helper, then update README.md. Remove old.txt.",
        );
        assert_eq!(
            parts,
            vec![
                "Create src/util.rs with a slugify helper",
                "update README.md",
                "Remove old.txt"
            ]
        );
    }

    #[test]
    fn split_keeps_single_instruction() {
        assert_eq!(split_instruction("Add a license file"), vec!["Add a license file"]);
    }

    #[test]
    fn action_verbs_are_distinct() {
        assert_eq!(
            action_verbs("add tests, add docs, fix build"),
            vec!["add", "build", "fix"]
        );
    }
}
