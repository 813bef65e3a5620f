//! Secret detection and redaction for values that end up in traces and stored runs.
//!
//! Chains routinely carry provider credentials (LLM API keys, bearer tokens, database URLs)
//! as ordinary inputs. These helpers find them by field name, by well-known token formats,
//! and by an entropy heuristic, and replace them with [`REDACTED`].

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

/// Replacement written in place of a secret.
pub const REDACTED: &str = "[REDACTED]";

const MIN_SECRET_LENGTH: usize = 20;
const HIGH_ENTROPY_THRESHOLD: f64 = 3.5;
const MIN_UNIQUE_CHARACTERS: usize = 8;

const SENSITIVE_KEY_FRAGMENTS: &[&str] = &[
    "api_key",
    "apikey",
    "access_key",
    "auth_token",
    "authorization",
    "bearer",
    "client_secret",
    "cookie",
    "passphrase",
    "password",
    "private_key",
    "refresh_token",
    "secret",
    "session_token",
    "token",
];

static TOKEN_FORMATS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"sk-ant-[A-Za-z0-9_\-]{20,}",
        r"sk-(?:proj-)?[A-Za-z0-9_\-]{20,}",
        r"(?:gh[oprsu]|github_pat)_[A-Za-z0-9_]{22,}",
        r"xox[aboprs]-(?:\d+-)+[0-9A-Za-z]+",
        r"AIzaSy[A-Za-z0-9_\-]{33}",
        r"hf_[A-Za-z0-9]{30,}",
        r"eyJ[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+\.[A-Za-z0-9_\-]+",
        r"(?:postgres(?:ql)?|mysql|rediss?|amqps?|mongodb(?:\+srv)?)://[^\s:/@]+:[^\s@]+@[^\s]+",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

static INLINE_ASSIGNMENTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)(authorization:\s*)([^\s]+(?:\s+[^\s]+)?)",
        r"(?i)(\bbearer\s+)([A-Za-z0-9\-._~+/]+=*)",
        r"(?i)((?:api[_-]?key|auth[_-]?token|access[_-]?token|token|secret|password)\s*[:=]\s*)([^\s,;]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Whether a field name suggests its value is a credential.
///
/// Matching ignores case and treats `-`, `.` and spaces like `_`, so `X-Api-Key`,
/// `openai_api_key`, and `apiKey` all match.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized: String = key
        .chars()
        .map(|character| match character {
            '-' | '.' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();
    let compact = normalized.replace('_', "");
    SENSITIVE_KEY_FRAGMENTS
        .iter()
        .any(|fragment| normalized.contains(fragment) || compact.contains(&fragment.replace('_', "")))
}

/// Redact credentials embedded in free text, keeping the surrounding key names.
pub fn redact_sensitive(input: &str) -> String {
    let mut redacted = input.to_string();
    for pattern in INLINE_ASSIGNMENTS.iter() {
        redacted = pattern.replace_all(&redacted, format!("${{1}}{REDACTED}")).into_owned();
    }
    for pattern in TOKEN_FORMATS.iter() {
        redacted = pattern.replace_all(&redacted, REDACTED).into_owned();
    }
    redacted
}

/// Whether a standalone value looks like a credential.
pub fn is_secret(value: &str) -> bool {
    let trimmed = value.trim().trim_matches(|character| matches!(character, '"' | '\'' | '`'));
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.contains("-----BEGIN ") && trimmed.contains("PRIVATE KEY") {
        return true;
    }
    let whole_value_matches = |pattern: &Regex| {
        pattern
            .find(trimmed)
            .is_some_and(|found| found.start() == 0 && found.end() == trimmed.len())
    };
    if TOKEN_FORMATS.iter().any(whole_value_matches) {
        return true;
    }
    looks_like_high_entropy_token(trimmed)
}

/// Recursively redact a JSON value.
///
/// Values under sensitive keys are replaced outright; other strings are replaced when they
/// look like a secret and scrubbed of inline credentials otherwise.
pub fn redact_json(value: &Value) -> Value {
    match value {
        Value::String(text) if is_secret(text) => Value::String(REDACTED.to_string()),
        Value::String(text) => Value::String(redact_sensitive(text)),
        Value::Array(items) => Value::Array(items.iter().map(redact_json).collect()),
        Value::Object(map) => Value::Object(redact_json_map(map)),
        other => other.clone(),
    }
}

/// [`redact_json`] applied to every entry of an object.
pub fn redact_json_map(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .map(|(key, value)| {
            if is_sensitive_key(key) && !value.is_null() {
                (key.clone(), Value::String(REDACTED.to_string()))
            } else {
                (key.clone(), redact_json(value))
            }
        })
        .collect()
}

fn looks_like_high_entropy_token(value: &str) -> bool {
    if value.chars().count() < MIN_SECRET_LENGTH || value.chars().any(char::is_whitespace) {
        return false;
    }

    let mut frequencies: HashMap<char, usize> = HashMap::new();
    let (mut lowercase, mut uppercase, mut digit) = (false, false, false);
    for character in value.chars() {
        *frequencies.entry(character).or_insert(0) += 1;
        lowercase |= character.is_ascii_lowercase();
        uppercase |= character.is_ascii_uppercase();
        digit |= character.is_ascii_digit();
    }

    let length = value.chars().count() as f64;
    let entropy = frequencies.values().fold(0.0, |entropy, count| {
        let probability = *count as f64 / length;
        entropy - probability * probability.log2()
    });

    lowercase && uppercase && digit && frequencies.len() >= MIN_UNIQUE_CHARACTERS && entropy >= HIGH_ENTROPY_THRESHOLD
}
