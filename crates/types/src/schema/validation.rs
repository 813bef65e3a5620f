//! Declarative value validation shared by the resolver and the action registry.
//!
//! The rules mirror what chain authors can express in a field's `validate` block:
//! - Enumerations must include the candidate (text and JSON forms compare equal).
//! - Pattern and length limits only apply to strings.
//! - Non-string values are rejected when string-only rules are present.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use super::FieldValidation;

static COMPILED_PATTERNS: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Compile a validation pattern once and reuse it for every later check.
pub fn compiled_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut cache = COMPILED_PATTERNS.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(regex) = cache.get(pattern) {
        return Ok(regex.clone());
    }
    let regex = Regex::new(pattern)?;
    cache.insert(pattern.to_string(), regex.clone());
    Ok(regex)
}

/// Validate a JSON candidate against the declared rules.
pub fn validate_candidate_value(candidate: &Value, validation: &FieldValidation) -> Result<(), String> {
    if !validation.allowed_values.is_empty()
        && !validation
            .allowed_values
            .iter()
            .any(|allowed| json_values_match(allowed, candidate))
    {
        return Err("value is not in the allowed set".to_string());
    }

    let Value::String(text) = candidate else {
        if validation.pattern.is_some() || validation.min_length.is_some() || validation.max_length.is_some() {
            return Err("value must be text to satisfy validation rules".to_string());
        }
        return Ok(());
    };

    let length = text.chars().count();
    if let Some(min_length) = validation.min_length
        && length < min_length
    {
        return Err(format!("value must be at least {} characters", min_length));
    }
    if let Some(max_length) = validation.max_length
        && length > max_length
    {
        return Err(format!("value must be at most {} characters", max_length));
    }
    if let Some(pattern) = &validation.pattern {
        let regex = compiled_pattern(pattern).map_err(|error| format!("invalid pattern '{}': {}", pattern, error))?;
        if !regex.is_match(text) {
            return Err(format!("value must match the pattern {}", pattern));
        }
    }
    Ok(())
}

fn json_values_match(expected: &Value, candidate: &Value) -> bool {
    if expected == candidate {
        return true;
    }
    match (expected, candidate) {
        (Value::String(expected_text), Value::String(candidate_text)) => expected_text == candidate_text,
        (Value::String(expected_text), other) => expected_text == &other.to_string(),
        (other, Value::String(candidate_text)) => match serde_json::from_str::<Value>(candidate_text) {
            Ok(parsed) => other == &parsed,
            Err(_) => false,
        },
        _ => false,
    }
}
