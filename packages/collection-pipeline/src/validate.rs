//! Candidate cleaning and structural validation.
//!
//! Cleaning normalizes what the adapters hand us (trimmed strings, no empty
//! values); validation decides whether a candidate counts toward `valid` or
//! `errors` in the batch assessment. Validation failures are counted, never
//! retried, never stored.

use serde_json::Value;

use crate::types::CandidateRecord;

/// Why a candidate failed structural validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    NotAnObject,
    EmptyPayload,
    InvalidDate { value: String },
    InvalidUrl { value: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::NotAnObject => write!(f, "payload is not a JSON object"),
            ValidationError::EmptyPayload => write!(f, "payload has no usable fields"),
            ValidationError::InvalidDate { value } => write!(f, "unparseable date '{value}'"),
            ValidationError::InvalidUrl { value } => write!(f, "invalid URL '{value}'"),
        }
    }
}

/// Clean a payload in place: trim strings, drop empty strings and nulls,
/// collapse internal whitespace, strip empty items from arrays.
pub fn clean_payload(payload: &Value) -> Value {
    match payload {
        Value::Object(map) => {
            let mut cleaned = serde_json::Map::new();
            for (key, value) in map {
                match value {
                    Value::String(s) => {
                        let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
                        if !collapsed.is_empty() {
                            cleaned.insert(key.clone(), Value::String(collapsed));
                        }
                    }
                    Value::Null => {}
                    other => {
                        cleaned.insert(key.clone(), clean_payload(other));
                    }
                }
            }
            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| !matches!(item, Value::Null))
                .filter(|item| !matches!(item, Value::String(s) if s.trim().is_empty()))
                .map(clean_payload)
                .collect(),
        ),
        Value::String(s) => Value::String(s.split_whitespace().collect::<Vec<_>>().join(" ")),
        other => other.clone(),
    }
}

/// Structural validation: the payload must be a non-empty object, and a
/// `date` or `url` field, when present, must parse.
pub fn validate_candidate(candidate: &CandidateRecord) -> Result<(), ValidationError> {
    let Some(object) = candidate.payload.as_object() else {
        return Err(ValidationError::NotAnObject);
    };
    if object.is_empty() {
        return Err(ValidationError::EmptyPayload);
    }

    if let Some(Value::String(raw)) = object.get("date") {
        if parse_date(raw).is_none() {
            return Err(ValidationError::InvalidDate { value: raw.clone() });
        }
    }

    if let Some(Value::String(raw)) = object.get("url") {
        let parsed = url::Url::parse(raw);
        let ok = matches!(parsed, Ok(ref u) if u.scheme() == "http" || u.scheme() == "https");
        if !ok {
            return Err(ValidationError::InvalidUrl { value: raw.clone() });
        }
    }

    Ok(())
}

fn parse_date(raw: &str) -> Option<chrono::NaiveDate> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    for format in ["%Y-%m-%d", "%d/%m/%Y", "%m/%d/%Y"] {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}

/// Descriptive fields a useful record usually carries at least two of.
const DESCRIPTIVE_FIELDS: &[&str] = &["title", "content", "description", "summary"];

/// Warnings for records that validate but look thin. Surfaced on the job
/// result, never counted as errors.
pub fn batch_warnings(candidates: &[CandidateRecord]) -> Vec<String> {
    let mut warnings = Vec::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let Some(object) = candidate.payload.as_object() else {
            continue;
        };
        let missing: Vec<&str> = DESCRIPTIVE_FIELDS
            .iter()
            .filter(|field| !object.contains_key(**field))
            .copied()
            .collect();
        if missing.len() >= DESCRIPTIVE_FIELDS.len() - 1 {
            warnings.push(format!(
                "record {index} ({}) is missing most descriptive fields: {}",
                candidate.fingerprint,
                missing.join(", ")
            ));
        }
    }
    warnings
}
