//! The default row-pipeline adapter.
//!
//! `spec.md` treats row-level validation and numeric aggregation as an
//! external, pure-function collaborator supplied to the engine. This crate
//! is one concrete such collaborator: given `{rows: [...], config: {...}}`,
//! it validates each row, optionally drops required-field nulls, dedupes on
//! a configured key set, and computes summary numeric stats — mirroring the
//! most feature-complete processing variant found in the source corpus.
//!
//! Whether a pipeline sleeps between rows is left as a policy decision for
//! the pipeline implementation, not the engine (`spec.md` §9) — this
//! implementation does not sleep, to keep it deterministic for tests and
//! callers that don't want artificial latency.

use std::collections::HashSet;

use async_trait::async_trait;
use jobqueue_core::{JobStage, ProgressReporter, RowPipeline};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
struct RowConfig {
    #[serde(alias = "requiredFields", default)]
    required_fields: Vec<String>,
    #[serde(alias = "dedupeOn", default)]
    dedupe_on: Vec<String>,
    #[serde(alias = "dropNulls", default)]
    drop_nulls: bool,
    #[serde(alias = "strictMode", default)]
    strict_mode: bool,
    #[serde(alias = "numericField", default)]
    numeric_field: Option<String>,
}

fn is_null(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn validate_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => match domain.rsplit_once('.') {
            Some((host, tld)) => !host.is_empty() && tld.len() >= 2,
            None => false,
        },
        _ => false,
    }
}

fn validate_age(value: &Value) -> bool {
    let age = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    matches!(age, Some(a) if a > 0.0 && a < 100.0)
}

fn validate_name(value: &Value) -> bool {
    match value {
        Value::String(s) => s.trim().chars().count() > 2,
        _ => false,
    }
}

fn row_is_valid(row: &serde_json::Map<String, Value>) -> bool {
    if let Some(email) = row.get("email") {
        let as_text = email.as_str().map(str::to_string).unwrap_or_else(|| email.to_string());
        if !validate_email(&as_text) {
            return false;
        }
    }
    if let Some(age) = row.get("age") {
        if !validate_age(age) {
            return false;
        }
    }
    if let Some(name) = row.get("name") {
        if !validate_name(name) {
            return false;
        }
    }
    true
}

struct ProcessResult {
    valid_rows: Vec<serde_json::Map<String, Value>>,
    invalid_rows: u64,
    duplicates_removed: u64,
    nulls_dropped: u64,
}

fn process_rows(rows: &[Value], config: &RowConfig) -> ProcessResult {
    let required_set: HashSet<&str> = config.required_fields.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut valid_rows = Vec::new();
    let mut invalid_rows = 0u64;
    let mut nulls_dropped = 0u64;
    let mut duplicates_removed = 0u64;

    for row in rows {
        let Some(row) = row.as_object() else {
            invalid_rows += 1;
            continue;
        };

        if !row_is_valid(row) {
            invalid_rows += 1;
            continue;
        }

        if !config.required_fields.is_empty() {
            let missing_field = config
                .required_fields
                .iter()
                .any(|f| !row.contains_key(f));
            if missing_field {
                invalid_rows += 1;
                continue;
            }
            let missing_value = config
                .required_fields
                .iter()
                .any(|f| row.get(f).map(is_null).unwrap_or(true));
            if missing_value {
                if config.drop_nulls {
                    nulls_dropped += 1;
                }
                invalid_rows += 1;
                continue;
            }
        }

        if config.strict_mode && !required_set.is_empty() {
            let has_extra = row.keys().any(|k| !required_set.contains(k.as_str()));
            if has_extra {
                invalid_rows += 1;
                continue;
            }
        }

        if config.drop_nulls && row.values().any(is_null) {
            nulls_dropped += 1;
            invalid_rows += 1;
            continue;
        }

        if !config.dedupe_on.is_empty() {
            let key: Vec<String> = config
                .dedupe_on
                .iter()
                .map(|f| row.get(f).map(|v| v.to_string()).unwrap_or_default())
                .collect();
            if !seen.insert(key) {
                duplicates_removed += 1;
                continue;
            }
        }

        valid_rows.push(row.clone());
    }

    ProcessResult {
        valid_rows,
        invalid_rows,
        duplicates_removed,
        nulls_dropped,
    }
}

fn compute_numeric_stats(rows: &[serde_json::Map<String, Value>], field: &str) -> Option<Value> {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|row| row.get(field))
        .filter_map(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse::<f64>().ok(),
            _ => None,
        })
        .collect();
    if values.is_empty() {
        return None;
    }
    let sum: f64 = values.iter().sum();
    let avg = sum / values.len() as f64;
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Some(serde_json::json!({
        "field": field,
        "sum": sum,
        "avg": avg,
        "min": min,
        "max": max,
    }))
}

/// Builds the `output_result` summary for a `{rows, config}` input payload.
pub fn build_output_result(payload: &Value) -> Value {
    let rows: Vec<Value> = payload
        .get("rows")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let config: RowConfig = payload
        .get("config")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();

    let total_processed = rows.len();
    let processed = process_rows(&rows, &config);
    let numeric_stats = config
        .numeric_field
        .as_deref()
        .and_then(|field| compute_numeric_stats(&processed.valid_rows, field));

    let mut output = serde_json::Map::new();
    output.insert("totalProcessed".into(), total_processed.into());
    output.insert("totalValid".into(), processed.valid_rows.len().into());
    output.insert("totalInvalid".into(), processed.invalid_rows.into());
    output.insert(
        "duplicatesRemoved".into(),
        processed.duplicates_removed.into(),
    );
    output.insert("nullsDropped".into(), processed.nulls_dropped.into());
    if let Some(stats) = numeric_stats {
        output.insert("numericStats".into(), stats);
    }
    if !processed.valid_rows.is_empty() {
        let sample: Vec<Value> = processed
            .valid_rows
            .into_iter()
            .take(50)
            .map(Value::Object)
            .collect();
        output.insert("outputData".into(), Value::Array(sample));
    }
    Value::Object(output)
}

/// The default [`RowPipeline`]: reports a single progress update for
/// validation and finalizing, then runs the row pipeline synchronously.
pub struct DefaultRowPipeline;

#[async_trait]
impl RowPipeline for DefaultRowPipeline {
    async fn run(
        &self,
        input_payload: &Value,
        reporter: &dyn ProgressReporter,
    ) -> anyhow::Result<Value> {
        let total_rows = input_payload
            .get("rows")
            .and_then(Value::as_array)
            .map(|rows| rows.len() as u64)
            .unwrap_or(0);

        reporter
            .report(25, 0, Some(JobStage::Processing))
            .await?;

        let output = build_output_result(input_payload);

        reporter
            .report(90, total_rows, Some(JobStage::Finalizing))
            .await?;

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_and_aggregates_rows() {
        let payload = serde_json::json!({
            "rows": [
                {"name": "John Doe", "email": "john@example.com", "age": 25},
                {"name": "Jo", "email": "bad-email", "age": 200},
                {"name": "Jane Doe", "email": "jane@example.com", "age": 30},
            ],
            "config": {"numericField": "age"},
        });
        let output = build_output_result(&payload);
        assert_eq!(output["totalProcessed"], 3);
        assert_eq!(output["totalValid"], 2);
        assert_eq!(output["totalInvalid"], 1);
        assert_eq!(output["numericStats"]["field"], "age");
    }

    #[test]
    fn dedupes_on_configured_key() {
        let payload = serde_json::json!({
            "rows": [
                {"name": "Alice Smith", "email": "a@example.com"},
                {"name": "Alice Smith", "email": "a@example.com"},
            ],
            "config": {"dedupeOn": ["email"]},
        });
        let output = build_output_result(&payload);
        assert_eq!(output["totalValid"], 1);
        assert_eq!(output["duplicatesRemoved"], 1);
    }

    #[test]
    fn missing_required_field_with_drop_nulls_counts_as_null_dropped() {
        let payload = serde_json::json!({
            "rows": [
                {"name": "Bob Jones", "email": "bob@example.com", "extra": ""},
            ],
            "config": {"requiredFields": ["extra"], "dropNulls": true},
        });
        let output = build_output_result(&payload);
        assert_eq!(output["totalValid"], 0);
        assert_eq!(output["nullsDropped"], 1);
    }
}
