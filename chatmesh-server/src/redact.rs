//! Log sanitizing for envelope payloads.
//!
//! Snapshots carry base64 profile photos and messages can carry base64
//! audio, which would flood the logs. Long base64-looking strings are cut
//! to their first 10 characters followed by `...`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static BASE64: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9+/=_-]+$").ok());
static BASE64_RUN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9+/=_-]{20,}").ok());

const KEEP: usize = 10;
const UNCONDITIONAL_LEN: usize = 64;
const FIELD_HINTS: &[&str] = &["base64", "audio", "photo", "content", "file"];

fn truncate(value: &str) -> String {
    match value.char_indices().nth(KEEP) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

fn should_truncate(field: Option<&str>, value: &str) -> bool {
    let trimmed = value.trim();
    let looks_like_base64 = BASE64.as_ref().is_some_and(|re| re.is_match(trimmed));
    if trimmed.len() <= KEEP || !looks_like_base64 {
        return false;
    }
    if let Some(field) = field {
        let field = field.to_ascii_lowercase();
        if FIELD_HINTS.iter().any(|hint| field.contains(hint)) {
            return true;
        }
    }
    trimmed.len() > UNCONDITIONAL_LEN
}

fn sanitize_value(value: &mut Value, field: Option<&str>) {
    match value {
        Value::Object(map) => {
            for (name, child) in map.iter_mut() {
                sanitize_value(child, Some(name));
            }
        }
        Value::Array(items) => {
            for item in items {
                sanitize_value(item, field);
            }
        }
        Value::String(s) if should_truncate(field, s) => {
            *s = truncate(s.trim());
        }
        _ => {}
    }
}

/// Sanitized copy of a JSON value, serialized for logging.
pub fn for_log(value: &Value) -> String {
    let mut copy = value.clone();
    sanitize_value(&mut copy, None);
    copy.to_string()
}

/// Sanitize a raw line. Falls back to truncating any long base64 run when
/// the line is not valid JSON.
pub fn line_for_log(line: &str) -> String {
    match serde_json::from_str::<Value>(line) {
        Ok(value) => for_log(&value),
        Err(_) => match BASE64_RUN.as_ref() {
            Some(re) => re
                .replace_all(line, |caps: &regex::Captures<'_>| truncate(&caps[0]))
                .into_owned(),
            None => line.to_string(),
        },
    }
}
