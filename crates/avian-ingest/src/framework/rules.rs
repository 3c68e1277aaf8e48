//! Declarative validation predicates over raw record fields
//!
//! A [`RuleSet`] evaluates every rule and reports every failure, so a
//! rejected record carries the full list of problems. Range, bounding-box
//! and timestamp rules only judge fields that are present; presence itself
//! is the job of [`Rule::Required`].

use crate::framework::types::{as_f64, RawRecord, ValidationOutcome};
use avian_common::types::{parse_timestamp, BoundingBox};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    /// Field is present, non-null and not an empty string
    Required { field: String },

    /// Numeric field within `[min, max]`
    Range { field: String, min: f64, max: f64 },

    /// Coordinate fields inside a box
    BoundingBox {
        lat: String,
        lon: String,
        bbox: BoundingBox,
    },

    /// Timestamp field parses and is not later than the evaluation time
    NotInFuture { field: String },

    /// Timestamp field parses and is not earlier than `epoch`
    NotBefore { field: String, epoch: DateTime<Utc> },

    /// Field value is one of `allowed` (case-insensitive)
    OneOf { field: String, allowed: Vec<String> },

    /// Ordinal grade no worse than `max`; `grades` runs best to worst and
    /// unknown grades rank as the worst
    MaxGrade {
        field: String,
        grades: Vec<String>,
        max: String,
    },
}

impl Rule {
    pub fn required(field: impl Into<String>) -> Self {
        Rule::Required {
            field: field.into(),
        }
    }

    pub fn range(field: impl Into<String>, min: f64, max: f64) -> Self {
        Rule::Range {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn bounding_box(lat: impl Into<String>, lon: impl Into<String>, bbox: BoundingBox) -> Self {
        Rule::BoundingBox {
            lat: lat.into(),
            lon: lon.into(),
            bbox,
        }
    }

    pub fn not_in_future(field: impl Into<String>) -> Self {
        Rule::NotInFuture {
            field: field.into(),
        }
    }

    pub fn not_before(field: impl Into<String>, epoch: DateTime<Utc>) -> Self {
        Rule::NotBefore {
            field: field.into(),
            epoch,
        }
    }

    /// Failure reasons for `record`, empty when the rule holds
    pub fn check(&self, record: &RawRecord, now: DateTime<Utc>) -> Vec<String> {
        match self {
            Rule::Required { field } => match record.field(field) {
                None => vec![format!("missing required field: {field}")],
                Some(Value::String(s)) if s.trim().is_empty() => {
                    vec![format!("missing required field: {field}")]
                },
                Some(_) => Vec::new(),
            },
            Rule::Range { field, min, max } => match numeric(record, field) {
                Numeric::Absent => Vec::new(),
                Numeric::Invalid(raw) => vec![format!("{field} is not numeric: {raw}")],
                Numeric::Value(v) if v < *min || v > *max => {
                    vec![format!("{field} {v} outside [{min}, {max}]")]
                },
                Numeric::Value(_) => Vec::new(),
            },
            Rule::BoundingBox { lat, lon, bbox } => {
                let mut reasons = Vec::new();
                match numeric(record, lat) {
                    Numeric::Invalid(raw) => reasons.push(format!("{lat} is not numeric: {raw}")),
                    Numeric::Value(v) if !bbox.contains_lat(v) => reasons.push(format!(
                        "latitude {v} outside [{}, {}]",
                        bbox.min_lat, bbox.max_lat
                    )),
                    _ => {},
                }
                match numeric(record, lon) {
                    Numeric::Invalid(raw) => reasons.push(format!("{lon} is not numeric: {raw}")),
                    Numeric::Value(v) if !bbox.contains_lon(v) => reasons.push(format!(
                        "longitude {v} outside [{}, {}]",
                        bbox.min_lon, bbox.max_lon
                    )),
                    _ => {},
                }
                reasons
            },
            Rule::NotInFuture { field } => match timestamp(record, field) {
                Stamp::Absent => Vec::new(),
                Stamp::Invalid(raw) => vec![format!("{field} is not a recognizable timestamp: {raw}")],
                Stamp::Value(ts) if ts > now => vec![format!("{field} {ts} is in the future")],
                Stamp::Value(_) => Vec::new(),
            },
            Rule::NotBefore { field, epoch } => match timestamp(record, field) {
                Stamp::Absent => Vec::new(),
                Stamp::Invalid(raw) => vec![format!("{field} is not a recognizable timestamp: {raw}")],
                Stamp::Value(ts) if ts < *epoch => {
                    vec![format!("{field} {ts} is before {}", epoch.date_naive())]
                },
                Stamp::Value(_) => Vec::new(),
            },
            Rule::OneOf { field, allowed } => match record.text_field(field) {
                None => Vec::new(),
                Some(value) if allowed.iter().any(|a| a.eq_ignore_ascii_case(&value)) => Vec::new(),
                Some(value) => vec![format!("{field} '{value}' not one of {}", allowed.join(", "))],
            },
            Rule::MaxGrade { field, grades, max } => {
                let rank = |g: &str| {
                    grades
                        .iter()
                        .position(|x| x.eq_ignore_ascii_case(g))
                        .unwrap_or(grades.len())
                };
                let value = record.text_field(field).unwrap_or_default();
                if rank(&value) > rank(max) {
                    vec![format!("{field} '{value}' below threshold {max}")]
                } else {
                    Vec::new()
                }
            },
        }
    }
}

enum Numeric {
    Absent,
    Invalid(String),
    Value(f64),
}

fn numeric(record: &RawRecord, field: &str) -> Numeric {
    match record.field(field) {
        None => Numeric::Absent,
        Some(Value::String(s)) if s.trim().is_empty() => Numeric::Absent,
        Some(value) => match as_f64(value) {
            Some(v) if v.is_finite() => Numeric::Value(v),
            _ => Numeric::Invalid(value.to_string()),
        },
    }
}

enum Stamp {
    Absent,
    Invalid(String),
    Value(DateTime<Utc>),
}

fn timestamp(record: &RawRecord, field: &str) -> Stamp {
    match record.field(field) {
        None => Stamp::Absent,
        Some(Value::String(s)) if s.trim().is_empty() => Stamp::Absent,
        Some(Value::String(s)) => match parse_timestamp(s) {
            Some(ts) => Stamp::Value(ts),
            None => Stamp::Invalid(s.clone()),
        },
        Some(other) => Stamp::Invalid(other.to_string()),
    }
}

/// Ordered collection of rules
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn with(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn evaluate(&self, record: &RawRecord, now: DateTime<Utc>) -> ValidationOutcome {
        let reasons = self
            .rules
            .iter()
            .flat_map(|rule| rule.check(record, now))
            .collect();
        ValidationOutcome::from_reasons(reasons)
    }
}
