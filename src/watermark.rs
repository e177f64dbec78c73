//! Watermark values are stored as text. Ordering tries integers, decimals
//! and timestamps before falling back to plain string comparison.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;
use std::cmp::Ordering;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn compare(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.trim(), b.trim());
    if let (Ok(x), Ok(y)) = (a.parse::<i64>(), b.parse::<i64>()) {
        return x.cmp(&y);
    }
    if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
        if let Some(ord) = x.partial_cmp(&y) {
            return ord;
        }
    }
    if let (Some(x), Some(y)) = (parse_timestamp(a), parse_timestamp(b)) {
        return x.cmp(&y);
    }
    a.cmp(b)
}

/// Text form of a watermark cell; NULL has none
pub fn from_json(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Largest of the given values
pub fn max<'a, I>(values: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .max_by(|a, b| compare(a, b))
        .map(str::to_string)
}

/// New watermark after a successful copy. Never moves backwards.
pub fn advance(current: Option<&str>, observed: Option<&str>) -> Option<String> {
    match (current, observed) {
        (None, None) => None,
        (Some(c), None) => Some(c.to_string()),
        (None, Some(o)) => Some(o.to_string()),
        (Some(c), Some(o)) => {
            if compare(o, c) == Ordering::Greater {
                Some(o.to_string())
            } else {
                Some(c.to_string())
            }
        }
    }
}
