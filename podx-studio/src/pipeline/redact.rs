//! Scrubbing of secret values from process output.

use regex::Regex;
use std::sync::LazyLock;

use crate::domain::REDACTED;

/// Token-shaped strings that are scrubbed even when the value is not a known secret.
static TOKEN_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"sk-[A-Za-z0-9_\-]{8,}", REDACTED),
        (r"secret_[A-Za-z0-9]{8,}", REDACTED),
        (r"ntn_[A-Za-z0-9]{8,}", REDACTED),
        (r"hf_[A-Za-z0-9]{8,}", REDACTED),
        (r"(?i)(bearer\s+)[A-Za-z0-9._\-]+", "${1}***REDACTED***"),
        (
            r"(?i)((?:api[_-]?key|token|password|secret)\s*[=:]\s*)[^\s,;]+",
            "${1}***REDACTED***",
        ),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("static regex is valid"),
            replacement,
        )
    })
    .collect()
});

/// Values shorter than this are not scrubbed literally; they would match
/// ordinary words.
const MIN_SECRET_LEN: usize = 4;

/// Replace known secret values and token-shaped strings with the redaction marker.
pub fn redact(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();

    for secret in secrets.iter().filter(|s| s.len() >= MIN_SECRET_LEN) {
        out = out.replace(secret, REDACTED);
    }

    for (pattern, replacement) in TOKEN_PATTERNS.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }

    out
}
