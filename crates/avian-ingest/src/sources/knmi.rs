//! KNMI hourly station observations
//!
//! Reads the `uurgeg_*` exports published by KNMI: a `#`-commented preamble,
//! a header line starting `# STN,` and comma-separated rows with padded
//! cells. Measurements are integers in tenths of their unit.

use crate::config::KnmiConfig;
use crate::error::{IngestError, Result, TransformError};
use crate::framework::clock::Clock;
use crate::framework::rules::{Rule, RuleSet};
use crate::framework::source::Source;
use crate::framework::types::{Fields, FetchWindow, RawRecord, ValidatedRecord, ValidationOutcome};
use crate::reference::knmi_station;
use crate::sources::local_records;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use futures::stream::BoxStream;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SOURCE_ID: &str = "knmi_weather";

/// Columns stored in tenths that the transform scales to whole units
const TENTHS: &[(&str, &str)] = &[
    ("T", "temperature_c"),
    ("TX", "temp_max_c"),
    ("TN", "temp_min_c"),
    ("RH", "precipitation_mm"),
    ("FF", "wind_speed_ms"),
    ("FX", "wind_gust_ms"),
    ("P", "pressure_hpa"),
    ("SQ", "sunshine_hours"),
];

/// Columns passed through unscaled
const UNITS: &[(&str, &str)] = &[
    ("DD", "wind_direction_deg"),
    ("U", "humidity_pct"),
    ("N", "cloud_cover_oktas"),
];

/// `YYYYMMDD` plus an hour-ending `HH` in 1..=24
pub fn observation_time(date: &str, hour: &str) -> Option<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(date.trim(), "%Y%m%d").ok()?;
    let hour: i64 = hour.trim().parse().ok()?;
    if !(0..=24).contains(&hour) {
        return None;
    }
    let midnight = Utc.from_utc_datetime(&day.and_time(NaiveTime::default()));
    Some(midnight + Duration::hours(hour))
}

fn cell_value(cell: &str) -> Value {
    cell.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(cell))
}

/// Parse one export into raw records within `window`
///
/// `stations` filters by station id; an empty list keeps every station.
pub fn parse_hourly(
    text: &str,
    stations: &[String],
    window: &FetchWindow,
    fetched_at: DateTime<Utc>,
) -> Result<Vec<RawRecord>> {
    let mut lines = text.lines();
    let Some(header) = lines.by_ref().find(|l| l.trim_start().starts_with("# STN,")) else {
        return Err(IngestError::Parse("no '# STN,' header line".to_string()));
    };
    let body: Vec<&str> = std::iter::once(header.trim_start().trim_start_matches('#'))
        .chain(lines.filter(|l| !l.trim_start().starts_with('#') && !l.trim().is_empty()))
        .collect();

    let body = body.join("\n");
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(body.as_bytes());
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut data = Map::new();
        for (column, cell) in headers.iter().zip(row.iter()) {
            if !cell.is_empty() {
                data.insert(column.to_string(), cell_value(cell));
            }
        }

        let station_id = row.get(0).unwrap_or_default().to_string();
        if !stations.is_empty() && !stations.iter().any(|s| *s == station_id) {
            continue;
        }
        let (date, hour) = (row.get(1).unwrap_or_default(), row.get(2).unwrap_or_default());
        let observed = observation_time(date, hour);
        if let Some(ts) = observed {
            if !window.contains(ts) {
                continue;
            }
        }

        data.insert("station_id".into(), json!(station_id));
        if let Some(ts) = observed {
            data.insert("timestamp".into(), json!(ts.to_rfc3339()));
        }
        if let Some(station) = knmi_station(&station_id) {
            data.insert("station_name".into(), json!(station.name));
            data.insert("latitude".into(), json!(station.lat));
            data.insert("longitude".into(), json!(station.lon));
            data.insert("province".into(), json!(station.province));
        }

        let hour: u32 = hour.trim().parse().unwrap_or_default();
        let record_id = format!("{station_id}_{}{hour:02}", date.trim());
        records.push(RawRecord::new(SOURCE_ID, record_id, Value::Object(data), fetched_at));
    }
    Ok(records)
}

fn is_hourly_export(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    (name.starts_with("uurgeg_") && name.ends_with(".txt")) || name.ends_with(".csv")
}

async fn export_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_file() && is_hourly_export(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub struct KnmiSource {
    config: KnmiConfig,
    clock: Arc<dyn Clock>,
    rules: RuleSet,
}

impl KnmiSource {
    pub fn new(config: KnmiConfig, clock: Arc<dyn Clock>) -> Self {
        let (t_min, t_max) = config.temperature_range;
        let (u_min, u_max) = config.humidity_range;
        let rules = RuleSet::new(vec![
            Rule::required("station_id"),
            Rule::required("timestamp"),
            Rule::bounding_box("latitude", "longitude", config.bounds),
            Rule::range("T", t_min, t_max),
            Rule::range("U", u_min, u_max),
        ]);
        Self { config, clock, rules }
    }

    async fn read_window(&self, window: FetchWindow) -> Result<Vec<RawRecord>> {
        let files = export_files(&self.config.input_path).await?;
        let fetched_at = self.clock.now();
        let mut records = Vec::new();
        for file in files {
            let text = tokio::fs::read_to_string(&file).await?;
            match parse_hourly(&text, &self.config.stations, &window, fetched_at) {
                Ok(parsed) => {
                    debug!(file = %file.display(), records = parsed.len(), "Parsed hourly export");
                    records.extend(parsed);
                },
                Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable hourly export"),
            }
        }
        info!(records = records.len(), start = %window.start, end = %window.end, "Loaded KNMI observations");
        Ok(records)
    }
}

/// Tenths to whole units; `-1` marks a trace amount for RH and SQ
fn scale_tenths(column: &str, value: f64) -> f64 {
    if matches!(column, "RH" | "SQ") && value < 0.0 {
        0.0
    } else {
        value / 10.0
    }
}

#[async_trait]
impl Source for KnmiSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(7)
    }

    async fn connect(&self) -> Result<()> {
        let dir = &self.config.input_path;
        if !tokio::fs::try_exists(dir).await? {
            warn!(path = %dir.display(), "KNMI input directory missing, creating it");
            tokio::fs::create_dir_all(dir).await?;
            return Ok(());
        }
        let files = export_files(dir)
            .await
            .map_err(|e| IngestError::connect(SOURCE_ID, e.to_string()))?;
        info!(path = %dir.display(), files = files.len(), "Found KNMI hourly exports");
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
        let station_id = raw
            .text_field("station_id")
            .ok_or_else(|| TransformError::missing("station_id"))?;
        let timestamp = raw
            .str_field("timestamp")
            .ok_or_else(|| TransformError::missing("timestamp"))?;

        let mut fields = Fields::new();
        fields.insert("observation_id".into(), json!(raw.record_id));
        fields.insert("timestamp".into(), json!(timestamp));
        fields.insert("station_id".into(), json!(station_id));
        fields.insert("station_name".into(), json!(raw.str_field("station_name")));
        fields.insert("latitude".into(), json!(raw.f64_field("latitude")));
        fields.insert("longitude".into(), json!(raw.f64_field("longitude")));
        fields.insert("province".into(), json!(raw.str_field("province")));
        for (column, name) in TENTHS {
            let value = raw.f64_field(column).map(|v| scale_tenths(column, v));
            fields.insert((*name).into(), json!(value));
        }
        for (column, name) in UNITS {
            fields.insert((*name).into(), json!(raw.f64_field(column)));
        }
        fields.insert("source_system".into(), json!(SOURCE_ID));
        Ok(fields)
    }
}
