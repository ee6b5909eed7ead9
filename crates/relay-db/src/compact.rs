//! Result-blob compaction.
//!
//! Raw action results may carry arbitrarily large captured output. The store
//! never persists `stdout`/`stderr`, distills a short `error_summary` from
//! stderr-like fields on failure, and bounds the final JSON string: past the
//! limit only a core-fields envelope survives, flagged with the truncation
//! marker.

use serde_json::{Map, Value, json};

/// Hard cap on the persisted `result_json` string, in characters.
pub const DEFAULT_MAX_RESULT_CHARS: usize = 60_000;

/// Characters of stderr retained in `error_summary`.
const ERROR_SUMMARY_CHARS: usize = 500;

/// Fields that survive truncation to the core envelope.
const CORE_KEYS: [&str; 4] = ["success", "exit_code", "message", "command"];

/// Marker field set on a truncated result.
pub const TRUNCATED_KEY: &str = "truncated";

/// Compact a raw action result into the bounded string persisted as
/// `result_json`.
///
/// Stream output is stripped unconditionally; everything else passes through
/// until the serialized form exceeds `max_chars`, at which point only the
/// core envelope is kept.
pub fn compact_result(raw: &Value, max_chars: usize) -> String {
    let compacted = match raw {
        Value::Object(fields) => Value::Object(strip_streams(fields)),
        other => other.clone(),
    };

    let serialized = compacted.to_string();
    if serialized.chars().count() <= max_chars {
        return serialized;
    }

    let mut core = Map::new();
    if let Value::Object(fields) = &compacted {
        for key in CORE_KEYS {
            if let Some(value) = fields.get(key) {
                core.insert(key.to_owned(), value.clone());
            }
        }
        if let Some(summary) = fields.get("error_summary") {
            core.insert("error_summary".to_owned(), summary.clone());
        }
    }
    core.insert(TRUNCATED_KEY.to_owned(), json!(true));
    Value::Object(core).to_string()
}

/// Drop `stdout`/`stderr`, extracting `error_summary` from stderr first when
/// the result reports failure.
fn strip_streams(fields: &Map<String, Value>) -> Map<String, Value> {
    let mut out = fields.clone();

    let succeeded = fields
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    if !succeeded && !out.contains_key("error_summary") {
        if let Some(stderr) = fields.get("stderr").and_then(Value::as_str) {
            let trimmed = stderr.trim();
            if !trimmed.is_empty() {
                let mut summary: String = trimmed.chars().take(ERROR_SUMMARY_CHARS).collect();
                if trimmed.chars().count() > ERROR_SUMMARY_CHARS {
                    summary.push_str("...");
                }
                out.insert("error_summary".to_owned(), json!(summary));
            }
        }
    }

    out.remove("stdout");
    out.remove("stderr");
    out
}
