//! Dead-bird reports from the DWHC pathology network and Sovon citizen reports
//!
//! Exports are dropped into a directory as `;`-separated CSV (Excel on a
//! Dutch locale, so a BOM is common) or JSON. Each network names its columns
//! differently; rows are mapped onto one raw layout before validation.

use crate::config::{MortalityConfig, MortalityFormat};
use crate::error::{IngestError, Result, TransformError};
use crate::framework::clock::Clock;
use crate::framework::rules::{Rule, RuleSet};
use crate::framework::source::Source;
use crate::framework::types::{Fields, FetchWindow, RawRecord, ValidatedRecord, ValidationOutcome};
use crate::reference::{province_name, species_code_for, usuv_result, usuv_tested};
use crate::sources::local_records;
use async_trait::async_trait;
use avian_common::checksum::short_content_hash;
use avian_common::types::parse_date;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SOURCE_ID: &str = "mortality_surveillance";

/// Reporting network a CSV export came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Dwhc,
    Sovon,
}

impl Network {
    /// Raw field name and the column names it may appear under
    fn columns(&self) -> &'static [(&'static str, &'static [&'static str])] {
        match self {
            Network::Dwhc => &[
                ("case_id", &["case_id", "CaseID"]),
                ("species_reported", &["species", "Species"]),
                ("report_date", &["date_found", "DateFound"]),
                ("submission_date", &["date_submitted", "DateSubmitted"]),
                ("latitude", &["latitude", "Lat"]),
                ("longitude", &["longitude", "Lon"]),
                ("province", &["province", "Province"]),
                ("municipality", &["municipality", "Municipality"]),
                ("usuv_tested", &["usuv_tested", "USUV_Tested"]),
                ("usuv_result", &["usuv_result", "USUV_Result"]),
                ("pathology_findings", &["pathology", "Pathology"]),
                ("cause_of_death", &["cause_death", "CauseOfDeath"]),
                ("co_infections", &["co_infections", "CoInfections"]),
            ],
            Network::Sovon => &[
                ("report_id", &["report_id", "ReportID"]),
                ("species_reported", &["species", "Soort"]),
                ("report_date", &["date", "Datum"]),
                ("latitude", &["lat", "Latitude"]),
                ("longitude", &["lon", "Longitude"]),
                ("province", &["province", "Provincie"]),
                ("count", &["count", "Aantal"]),
                ("description", &["description", "Omschrijving"]),
                ("observer_notes", &["notes", "Opmerkingen"]),
            ],
        }
    }

    fn reporter_type(&self) -> &'static str {
        match self {
            Network::Dwhc => "dwhc",
            Network::Sovon => "sovon",
        }
    }

    /// DWHC files announce themselves by name; otherwise the configured format decides
    fn for_file(name: &str, format: MortalityFormat) -> Self {
        if name.to_ascii_lowercase().contains("dwhc") || format == MortalityFormat::DwhcCsv {
            Network::Dwhc
        } else {
            Network::Sovon
        }
    }
}

/// Map a `;`-separated export onto raw report objects
pub fn parse_csv(text: &str, network: Network) -> Result<Vec<Value>> {
    let text = text.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut reports = Vec::new();
    for row in reader.records() {
        let row = row?;
        let cells: HashMap<&str, &str> = headers.iter().zip(row.iter()).collect();

        let mut report = Map::new();
        for (field, aliases) in network.columns() {
            let value = aliases
                .iter()
                .find_map(|alias| cells.get(alias).copied())
                .unwrap_or_default();
            report.insert((*field).to_string(), json!(value));
        }
        if network == Network::Sovon {
            if report.get("count").and_then(Value::as_str).is_some_and(str::is_empty) {
                report.insert("count".into(), json!("1"));
            }
            // citizen reports are not lab tested
            report.insert("usuv_tested".into(), json!("NT"));
            report.insert("usuv_result".into(), Value::Null);
        }
        report.insert("reporter_type".into(), json!(network.reporter_type()));
        reports.push(Value::Object(report));
    }
    Ok(reports)
}

/// An array of reports, `{"records": [...]}`, or a single report object
pub fn parse_json(text: &str) -> Result<Vec<Value>> {
    let parsed: Value = serde_json::from_str(text)?;
    let reports = match parsed {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("records") {
            Some(Value::Array(items)) => items,
            _ => vec![Value::Object(object)],
        },
        other => {
            return Err(IngestError::Parse(format!(
                "expected an array or object of reports, got {other}"
            )))
        },
    };
    Ok(reports.into_iter().filter(Value::is_object).collect())
}

/// `case_id`, else `report_id`, else a digest of the report
pub fn report_id(report: &Value) -> String {
    ["case_id", "report_id"]
        .iter()
        .filter_map(|key| report.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .find(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| short_content_hash(report, 12))
}

/// Reports are dated by day and the end day is included (see [`FetchWindow`]);
/// undated reports are kept for validation to reject
fn reported_in_window(report: &Value, window: &FetchWindow) -> bool {
    match report.get("report_date").and_then(Value::as_str).and_then(parse_date) {
        Some(day) => window.start.date_naive() <= day && day <= window.end.date_naive(),
        None => true,
    }
}

fn is_report_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("csv" | "json")
    )
}

async fn report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_report_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub struct MortalitySource {
    config: MortalityConfig,
    clock: Arc<dyn Clock>,
    rules: RuleSet,
}

impl MortalitySource {
    pub fn new(config: MortalityConfig, clock: Arc<dyn Clock>) -> Self {
        let rules = RuleSet::new(vec![
            Rule::required("species_reported"),
            Rule::required("report_date"),
            Rule::bounding_box("latitude", "longitude", config.bounds),
            Rule::not_in_future("report_date"),
            Rule::not_before("report_date", config.epoch()),
        ]);
        Self { config, clock, rules }
    }

    fn parse_file(&self, path: &Path, text: &str) -> Result<Vec<Value>> {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));
        if is_json {
            parse_json(text)
        } else {
            parse_csv(text, Network::for_file(name, self.config.format))
        }
    }

    async fn read_window(&self, window: FetchWindow) -> Result<Vec<RawRecord>> {
        let files = report_files(&self.config.input_path).await?;
        let fetched_at = self.clock.now();
        let mut records = Vec::new();

        for file in files {
            let text = tokio::fs::read_to_string(&file).await?;
            let reports = match self.parse_file(&file, &text) {
                Ok(reports) => reports,
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Skipping unreadable report file");
                    continue;
                },
            };
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let before = records.len();
            records.extend(
                reports
                    .into_iter()
                    .filter(|r| reported_in_window(r, &window))
                    .map(|report| into_record(report, &file_name, fetched_at)),
            );
            debug!(file = %file_name, records = records.len() - before, "Parsed report file");
        }
        info!(records = records.len(), start = %window.start, end = %window.end, "Loaded mortality reports");
        Ok(records)
    }
}

fn into_record(mut report: Value, file_name: &str, fetched_at: DateTime<Utc>) -> RawRecord {
    let id = report_id(&report);
    if let Some(fields) = report.as_object_mut() {
        fields.insert("_source_file".into(), json!(file_name));
    }
    RawRecord::new(SOURCE_ID, id, report, fetched_at)
}

#[async_trait]
impl Source for MortalitySource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(30)
    }

    async fn connect(&self) -> Result<()> {
        let dir = &self.config.input_path;
        if !tokio::fs::try_exists(dir).await? {
            warn!(path = %dir.display(), "Mortality input directory missing, creating it");
            tokio::fs::create_dir_all(dir).await?;
            return Ok(());
        }
        let files = report_files(dir)
            .await
            .map_err(|e| IngestError::connect(SOURCE_ID, e.to_string()))?;
        info!(path = %dir.display(), files = files.len(), format = self.config.format.as_str(), "Found mortality report files");
        Ok(())
    }

    fn fetch(&self, window: FetchWindow, cancel: CancellationToken) -> BoxStream<'_, Result<RawRecord>> {
        local_records(self.read_window(window), cancel)
    }

    fn validate(&self, record: &RawRecord) -> ValidationOutcome {
        self.rules.evaluate(record, self.clock.now())
    }

    fn transform(&self, record: &ValidatedRecord) -> std::result::Result<Fields, TransformError> {
        let raw = record.raw();
        let species = raw
            .str_field("species_reported")
            .ok_or_else(|| TransformError::missing("species_reported"))?;
        let report_date = raw
            .str_field("report_date")
            .and_then(parse_date)
            .ok_or_else(|| TransformError::new("report_date", "not a recognizable date"))?;

        let province = raw.str_field("province").unwrap_or_default();
        let reporter_type = raw.str_field("reporter_type").unwrap_or("unknown");
        let count = raw
            .f64_field("count")
            .filter(|c| *c >= 0.0)
            .map(|c| c as u64)
            .unwrap_or(1);

        let mut fields = Fields::new();
        fields.insert("report_id".into(), json!(raw.record_id));
        fields.insert("report_date".into(), json!(report_date.format("%Y-%m-%d").to_string()));
        fields.insert("species_reported".into(), json!(species));
        fields.insert("species_code".into(), json!(species_code_for(species).unwrap_or_default()));
        fields.insert("latitude".into(), json!(raw.f64_field("latitude")));
        fields.insert("longitude".into(), json!(raw.f64_field("longitude")));
        fields.insert("province".into(), json!(province_name(province).unwrap_or(province)));
        fields.insert("municipality".into(), json!(raw.str_field("municipality").unwrap_or_default()));
        fields.insert("count".into(), json!(count));
        fields.insert(
            "usuv_tested".into(),
            json!(raw.text_field("usuv_tested").is_some_and(|t| usuv_tested(&t))),
        );
        fields.insert(
            "usuv_positive".into(),
            json!(raw.text_field("usuv_result").and_then(|r| usuv_result(&r))),
        );
        fields.insert("pathology_notes".into(), json!(raw.str_field("pathology_findings").unwrap_or_default()));
        fields.insert("cause_of_death".into(), json!(raw.str_field("cause_of_death").unwrap_or_default()));
        fields.insert("co_infections".into(), json!(raw.str_field("co_infections").unwrap_or_default()));
        fields.insert("reporter_type".into(), json!(reporter_type));
        fields.insert(
            "source_network".into(),
            json!(if reporter_type == "dwhc" { "DWHC" } else { "Sovon" }),
        );
        fields.insert("source_file".into(), json!(raw.str_field("_source_file").unwrap_or_default()));
        fields.insert("source_system".into(), json!(SOURCE_ID));
        Ok(fields)
    }

    fn checkpoint_field(&self) -> &str {
        "report_date"
    }
}
