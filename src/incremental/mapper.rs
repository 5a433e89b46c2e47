// ABOUTME: Maps source field names to destination columns and coerces JSON values
// ABOUTME: Dates become timestamps, arrays are routed through the relationship classifier

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use super::relationship::RelationshipClassifier;
use super::schema_type::Convention;
use crate::store::SqlValue;

const NAIVE_DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Maps source records field by field onto destination columns.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    classifier: RelationshipClassifier,
}

impl FieldMapper {
    pub fn new(classifier: RelationshipClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &RelationshipClassifier {
        &self.classifier
    }

    /// Destination column name for `field` under `convention`.
    ///
    /// ```
    /// # use api_replicator::incremental::{Convention, FieldMapper};
    /// assert_eq!(FieldMapper::map_field("2nd Payment %", Convention::Raw), "2nd Payment %");
    /// assert_eq!(FieldMapper::map_field("2nd Payment %", Convention::Normalized), "2nd_payment_");
    /// ```
    pub fn map_field(field: &str, convention: Convention) -> String {
        match convention {
            Convention::Raw => field.to_string(),
            Convention::Normalized => normalize(field),
        }
    }

    /// Convert a source value into the value bound for its column.
    pub fn coerce_value(&self, value: &Value, field: &str) -> SqlValue {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    SqlValue::Decimal(Decimal::from(u))
                } else {
                    n.as_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null)
                }
            }
            Value::String(s) => match parse_date(s) {
                Some(ts) => SqlValue::Timestamp(ts),
                None => SqlValue::Text(s.clone()),
            },
            Value::Array(items) => self.coerce_array(items, field),
            Value::Object(_) => SqlValue::Json(value.clone()),
        }
    }

    fn coerce_array(&self, items: &[Value], field: &str) -> SqlValue {
        if items.is_empty() {
            return SqlValue::Null;
        }

        let strings: Option<Vec<&str>> = items.iter().map(Value::as_str).collect();
        match strings {
            Some(strings) if self.classifier.is_relationship_array(&strings, field) => {
                SqlValue::TextArray(strings.into_iter().map(str::to_string).collect())
            }
            _ => SqlValue::Json(Value::Array(items.to_vec())),
        }
    }
}

/// Lowercase, with every run of non-alphanumeric characters collapsed to `_`.
fn normalize(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut in_separator = false;
    for ch in field.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            in_separator = false;
        } else if !in_separator {
            out.push('_');
            in_separator = true;
        }
    }
    out
}

fn looks_like_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 10
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && bytes[4] == b'-'
        && bytes[5..7].iter().all(u8::is_ascii_digit)
        && bytes[7] == b'-'
        && bytes[8..10].iter().all(u8::is_ascii_digit)
}

/// Parse ISO-8601-like strings: with or without fractional seconds, with a
/// `Z` or numeric offset or no zone at all (read as UTC), or date-only.
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if !looks_like_date(value) {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, DATE_FORMAT) {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }

    tracing::debug!("Date-like value '{}' kept as text", value);
    None
}
