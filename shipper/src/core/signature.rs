//! Error signature derivation.
//!
//! Volatile substrings (timestamps, ids, paths, numbers) are replaced by
//! placeholders before hashing, so structurally identical failures collapse to
//! one signature even when their surface text differs.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use sha2::{Digest, Sha256};

const DIGEST_HEX_LEN: usize = 16;
const HEX_PLACEHOLDER: &str = "<hex>";

static VOLATILE: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (
            r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?",
            "<ts>",
        ),
        (
            r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
            "<id>",
        ),
        (r"(?i)\b(?:exec|todo|snap)-[\w-]+", "<id>"),
        (r"(?i)\b[0-9a-f]{7,64}\b", HEX_PLACEHOLDER),
        (r"(?:[A-Za-z]:)?[\w.-]*(?:[/\\][\w.-]+)+", "<path>"),
        (r"\d+", "<n>"),
    ]
    .into_iter()
    .map(|(pattern, placeholder)| {
        let regex = Regex::new(pattern).expect("signature pattern should be valid");
        (regex, placeholder)
    })
    .collect()
});

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern should be valid"));

/// Strip volatile tokens and canonicalize case and spacing.
pub fn normalize_message(message: &str) -> String {
    let mut normalized = message.to_string();
    for (regex, placeholder) in VOLATILE.iter() {
        normalized = regex
            .replace_all(&normalized, |caps: &Captures<'_>| {
                let token = &caps[0];
                // Hex runs without a digit are ordinary words ("defaced", "effaced").
                if *placeholder == HEX_PLACEHOLDER
                    && !token.bytes().any(|b| b.is_ascii_digit())
                {
                    token.to_string()
                } else {
                    (*placeholder).to_string()
                }
            })
            .into_owned();
    }
    WHITESPACE
        .replace_all(normalized.trim(), " ")
        .to_lowercase()
}

/// Signature for an error: `<kind>:<digest of kind + normalized message>`.
pub fn derive_signature(error_type: &str, message: &str) -> String {
    let normalized = normalize_message(message);
    let mut hasher = Sha256::new();
    hasher.update(error_type.as_bytes());
    hasher.update(b"\n");
    hasher.update(normalized.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}{}", signature_prefix(error_type), &digest[..DIGEST_HEX_LEN])
}

/// Prefix shared by every signature of `error_type`.
pub fn signature_prefix(error_type: &str) -> String {
    format!("{error_type}:")
}
