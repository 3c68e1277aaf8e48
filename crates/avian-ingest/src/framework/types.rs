//! Core record and run types

use crate::framework::download::DownloadSummary;
use avian_common::checksum::content_hash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Ordered field map of a standardized record
pub type Fields = Map<String, Value>;

pub const RAW_HASH_FIELD: &str = "_raw_hash";
pub const INGESTION_TIMESTAMP_FIELD: &str = "_ingestion_timestamp";
pub const BATCH_ID_FIELD: &str = "_batch_id";

/// Record exactly as received from a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Source-native id, or derived from content when the source has none
    pub record_id: String,
    pub source_system: String,
    /// Wall-clock time at fetch
    pub ingestion_timestamp: DateTime<Utc>,
    pub data: Value,
}

impl RawRecord {
    pub fn new(
        source_system: impl Into<String>,
        record_id: impl Into<String>,
        data: Value,
        ingestion_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            source_system: source_system.into(),
            ingestion_timestamp,
            data,
        }
    }

    /// sha256 of the canonical JSON of `data`
    pub fn content_hash(&self) -> String {
        content_hash(&self.data)
    }

    /// Look up a dotted path such as `coords.lat`; JSON null counts as absent
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.data, path)
    }

    pub fn str_field(&self, path: &str) -> Option<&str> {
        self.field(path).and_then(Value::as_str)
    }

    /// Numeric value of a field stored either as a number or a numeric string
    pub fn f64_field(&self, path: &str) -> Option<f64> {
        self.field(path).and_then(as_f64)
    }

    /// Field rendered as text (strings verbatim, numbers and bools formatted)
    pub fn text_field(&self, path: &str) -> Option<String> {
        self.field(path).and_then(as_text)
    }
}

pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(value, |current, key| current.get(key))
        .filter(|v| !v.is_null())
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Result of running a rule set over a raw record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub accepted: bool,
    /// Every failing check, in rule order
    pub reasons: Vec<String>,
}

impl ValidationOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            reasons: Vec::new(),
        }
    }

    pub fn from_reasons(reasons: Vec<String>) -> Self {
        Self {
            accepted: reasons.is_empty(),
            reasons,
        }
    }

    /// Fold in additional checks
    pub fn merge(mut self, extra: Vec<String>) -> Self {
        self.reasons.extend(extra);
        self.accepted = self.reasons.is_empty();
        self
    }
}

/// A raw record paired with its validation outcome
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRecord {
    raw: RawRecord,
    outcome: ValidationOutcome,
}

impl ValidatedRecord {
    pub fn new(raw: RawRecord, outcome: ValidationOutcome) -> Self {
        Self { raw, outcome }
    }

    pub fn raw(&self) -> &RawRecord {
        &self.raw
    }

    pub fn outcome(&self) -> &ValidationOutcome {
        &self.outcome
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome.accepted
    }

    pub fn into_raw(self) -> RawRecord {
        self.raw
    }
}

/// Schema-normalized record as written to a batch file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StandardizedRecord(Fields);

impl StandardizedRecord {
    /// Attach run-scoped metadata to transformed fields
    pub fn stamp(
        mut fields: Fields,
        raw_hash: String,
        ingestion_timestamp: DateTime<Utc>,
        batch_id: &str,
    ) -> Self {
        fields.insert(RAW_HASH_FIELD.to_string(), Value::String(raw_hash));
        fields.insert(
            INGESTION_TIMESTAMP_FIELD.to_string(),
            Value::String(ingestion_timestamp.to_rfc3339()),
        );
        fields.insert(BATCH_ID_FIELD.to_string(), Value::String(batch_id.to_string()));
        Self(fields)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn raw_hash(&self) -> Option<&str> {
        self.str_field(RAW_HASH_FIELD)
    }

    pub fn batch_id(&self) -> Option<&str> {
        self.str_field(BATCH_ID_FIELD)
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }

    /// Fields with the run-scoped metadata removed
    pub fn content_fields(&self) -> Fields {
        let mut fields = self.0.clone();
        fields.remove(INGESTION_TIMESTAMP_FIELD);
        fields.remove(BATCH_ID_FIELD);
        fields
    }
}

/// Half-open time range `[start, end)` handed to a source's fetch
///
/// Sources whose upstream only reports calendar dates (xeno-canto upload
/// dates, mortality report dates) cannot honor the instant bounds. They
/// compare dates instead and keep the end day, so a record dated on
/// `end.date_naive()` is included even though [`contains`](Self::contains)
/// would exclude instants at or after `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// Reference or aggregate rows a source publishes alongside its batch
///
/// Rows bypass validation and the checkpoint; they are written verbatim as
/// JSON lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub name: String,
    pub rows: Vec<Value>,
}

impl Dataset {
    pub fn new(name: impl Into<String>, rows: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            rows,
        }
    }
}

/// Final outcome of one source run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionStatus {
    Success,
    Partial,
    Failed,
    Skipped,
}

impl IngestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionStatus::Success => "success",
            IngestionStatus::Partial => "partial",
            IngestionStatus::Failed => "failed",
            IngestionStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for IngestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics for one invocation of one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub source_id: String,
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: IngestionStatus,
    pub records_fetched: u64,
    pub records_validated: u64,
    pub records_failed: u64,
    /// Sampled, bounded list of problems
    pub error_messages: Vec<String>,
    pub window: Option<FetchWindow>,
    pub batch_path: Option<PathBuf>,
    pub checkpoint: Option<DateTime<Utc>>,
    pub downloads: Option<DownloadSummary>,
    /// Side datasets written next to the batch
    #[serde(default)]
    pub datasets: Vec<PathBuf>,
    #[serde(skip)]
    errors_dropped: u64,
}

impl RunMetadata {
    pub fn new(source_id: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let source_id = source_id.into();
        let batch_id = batch_id_for(&source_id, started_at);
        Self {
            source_id,
            batch_id,
            started_at,
            completed_at: None,
            status: IngestionStatus::Failed,
            records_fetched: 0,
            records_validated: 0,
            records_failed: 0,
            error_messages: Vec::new(),
            window: None,
            batch_path: None,
            checkpoint: None,
            downloads: None,
            datasets: Vec::new(),
            errors_dropped: 0,
        }
    }

    /// Append an error message unless `cap` messages are already kept
    pub fn push_error(&mut self, message: impl Into<String>, cap: usize) {
        if self.error_messages.len() < cap {
            self.error_messages.push(message.into());
        } else {
            self.errors_dropped += 1;
        }
    }

    /// Messages that did not fit under the cap
    pub fn errors_dropped(&self) -> u64 {
        self.errors_dropped
    }

    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }
}

/// `{source_id}_{YYYYmmdd_HHMMSS}`
pub fn batch_id_for(source_id: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}", source_id, at.format("%Y%m%d_%H%M%S"))
}
