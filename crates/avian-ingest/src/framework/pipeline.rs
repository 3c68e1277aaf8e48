//! Per-record validate -> transform -> hash

use crate::framework::source::Source;
use crate::framework::types::{RawRecord, StandardizedRecord, ValidatedRecord};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// What became of one raw record
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Accepted(StandardizedRecord),
    Rejected { record_id: String, reasons: Vec<String> },
}

impl PipelineOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PipelineOutcome::Accepted(_))
    }
}

/// Runs a source's validate and transform stages for one run
pub struct RecordPipeline<'a> {
    source: &'a dyn Source,
    batch_id: String,
    run_timestamp: DateTime<Utc>,
}

impl<'a> RecordPipeline<'a> {
    /// `run_timestamp` and `batch_id` are stamped on every accepted record
    pub fn new(source: &'a dyn Source, batch_id: impl Into<String>, run_timestamp: DateTime<Utc>) -> Self {
        Self {
            source,
            batch_id: batch_id.into(),
            run_timestamp,
        }
    }

    pub fn process(&self, raw: RawRecord) -> PipelineOutcome {
        let outcome = self.source.validate(&raw);
        if !outcome.accepted {
            debug!(record_id = %raw.record_id, reasons = ?outcome.reasons, "Record rejected");
            return PipelineOutcome::Rejected {
                record_id: raw.record_id,
                reasons: outcome.reasons,
            };
        }

        let validated = ValidatedRecord::new(raw, outcome);
        match self.source.transform(&validated) {
            Ok(fields) => PipelineOutcome::Accepted(StandardizedRecord::stamp(
                fields,
                validated.raw().content_hash(),
                self.run_timestamp,
                &self.batch_id,
            )),
            Err(err) => {
                let raw = validated.into_raw();
                warn!(
                    record_id = %raw.record_id,
                    error = %err,
                    raw = %raw.data,
                    "Transform failed, rejecting record"
                );
                PipelineOutcome::Rejected {
                    record_id: raw.record_id,
                    reasons: vec![format!("transform failed: {err}")],
                }
            },
        }
    }
}
