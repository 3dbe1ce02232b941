//! Canonical error text and fingerprints.
//!
//! The fingerprint is the dedup key for AI diagnosis, schema-heal history
//! and loop breaking, so it must be deterministic for identical input.

use crate::db::models::ErrorReport;

/// Characters of normalized text kept in a fingerprint.
pub const FINGERPRINT_LEN: usize = 200;

/// Description plus every console entry, one per line.
///
/// `console_errors` is expected to be a JSON array of strings or objects with
/// `error`/`message` and optional `stack`. Anything that does not parse as an
/// array is appended verbatim.
pub fn canonical_text(description: &str, console_errors: Option<&str>) -> String {
    let mut parts: Vec<String> = Vec::new();
    let description = description.trim();
    if !description.is_empty() {
        parts.push(description.to_string());
    }

    let Some(raw) = console_errors.map(str::trim).filter(|s| !s.is_empty()) else {
        return parts.join("\n");
    };

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(entries)) => {
            for entry in entries {
                if let Some(line) = console_entry_text(&entry) {
                    parts.push(line);
                }
            }
        }
        _ => parts.push(raw.to_string()),
    }

    parts.join("\n")
}

fn console_entry_text(entry: &serde_json::Value) -> Option<String> {
    match entry {
        serde_json::Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        serde_json::Value::Object(map) => {
            let message = map
                .get("error")
                .or_else(|| map.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim();
            let stack = map.get("stack").and_then(|v| v.as_str()).unwrap_or("").trim();
            let line = match (message.is_empty(), stack.is_empty()) {
                (true, true) => return None,
                (false, true) => message.to_string(),
                (true, false) => stack.to_string(),
                (false, false) => format!("{message}\n{stack}"),
            };
            Some(line)
        }
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Whitespace-collapsed prefix of `text`, at most [`FINGERPRINT_LEN`] chars.
pub fn fingerprint(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(FINGERPRINT_LEN).collect()
}

/// Canonical text and fingerprint for a stored report.
pub fn for_report(report: &ErrorReport) -> (String, String) {
    let text = canonical_text(&report.description, report.console_errors.as_deref());
    let fp = fingerprint(&text);
    (text, fp)
}
