//! Xeno-canto reference recordings
//!
//! The API pages by number (`page=1..numPages`); the page number travels as
//! the opaque cursor. Upload dates are filtered client-side because the
//! query language has no upload-date predicate.

use crate::config::{grade_rank, XenoCantoConfig, QUALITY_GRADES};
use crate::error::{IngestError, Result, TransformError, TransportError};
use crate::framework::clock::Clock;
use crate::framework::download::AudioAsset;
use crate::framework::pagination::{Page, PageSource, PaginatedFetcher};
use crate::framework::rules::{Rule, RuleSet};
use crate::framework::source::Source;
use crate::framework::transport::HttpClient;
use crate::framework::types::{
    as_f64, as_text, Fields, FetchWindow, RawRecord, StandardizedRecord, ValidatedRecord, ValidationOutcome,
};
use crate::reference::{find_species, species_code_for};
use crate::sources::{cancelled, end_on_cancel};
use async_trait::async_trait;
use avian_common::types::{parse_date, BoundingBox};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const SOURCE_ID: &str = "xeno_canto";

/// `"{scientific} cnt:{country} q:A,B"` with every grade up to the threshold
pub fn build_query(scientific: &str, country: &str, quality_threshold: &str) -> String {
    let mut parts = vec![scientific.to_string()];
    if !country.trim().is_empty() {
        parts.push(format!("cnt:{}", country.trim()));
    }
    if let Some(rank) = grade_rank(quality_threshold) {
        parts.push(format!("q:{}", QUALITY_GRADES[..=rank].join(",")));
    }
    parts.join(" ")
}

/// `m:ss` or `h:mm:ss` to seconds
pub fn parse_length(length: &str) -> Option<u64> {
    length
        .trim()
        .split(':')
        .try_fold(0u64, |acc, part| part.trim().parse::<u64>().ok().map(|v| acc * 60 + v))
        .filter(|_| !length.trim().is_empty())
}

fn https(url: &str) -> String {
    if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    }
}

/// Uploads are dated by day, so the window is compared by calendar date,
/// end day included (see [`FetchWindow`])
fn uploaded_in_window(recording: &Value, window: &FetchWindow) -> bool {
    match recording.get("uploaded").and_then(Value::as_str).and_then(parse_date) {
        Some(day) => window.start.date_naive() <= day && day <= window.end.date_naive(),
        None => true,
    }
}

/// Recordings of one species, one numbered page at a time
struct RecordingPages {
    http: Arc<HttpClient>,
    api_url: String,
    query: String,
}

#[async_trait]
impl PageSource for RecordingPages {
    type Item = Value;

    async fn fetch_page(&self, cursor: Option<String>) -> std::result::Result<Page<Value>, TransportError> {
        let page: u32 = cursor.as_deref().and_then(|c| c.parse().ok()).unwrap_or(1);
        let response = self
            .http
            .get_json(&self.api_url, &[("query", self.query.clone()), ("page", page.to_string())])
            .await?;

        let num_pages = response.get("numPages").and_then(as_f64).unwrap_or(1.0) as u32;
        let recordings = response
            .get("recordings")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(query = %self.query, page, num_pages, received = recordings.len(), "Fetched recordings page");

        Ok(if page < num_pages {
            Page::with_next(recordings, (page + 1).to_string())
        } else {
            Page::last(recordings)
        })
    }
}

pub struct XenoCantoSource {
    config: XenoCantoConfig,
    http: Arc<HttpClient>,
    clock: Arc<dyn Clock>,
    audio_dir: PathBuf,
    rules: RuleSet,
}

impl XenoCantoSource {
    pub fn new(config: XenoCantoConfig, http: Arc<HttpClient>, clock: Arc<dyn Clock>, audio_dir: PathBuf) -> Self {
        let rules = RuleSet::new(vec![
            Rule::required("id"),
            Rule::required("gen"),
            Rule::required("sp"),
            Rule::required("file"),
            Rule::MaxGrade {
                field: "q".into(),
                grades: QUALITY_GRADES.iter().map(|g| g.to_string()).collect(),
                max: config.quality_threshold.clone(),
            },
            Rule::bounding_box("lat", "lng", BoundingBox::world()),
        ]);
        Self {
            config,
            http,
            clock,
            audio_dir,
            rules,
        }
    }

    fn species_stream(
        &self,
        scientific: String,
        window: FetchWindow,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<RawRecord>> {
        let query = build_query(&scientific, &self.config.country, &self.config.quality_threshold);
        info!(species = %scientific, query = %query, "Fetching recordings");

        let pages = RecordingPages {
            http: self.http.clone(),
            api_url: self.config.api_url.clone(),
            query,
        };
        let clock = self.clock.clone();
        PaginatedFetcher::new(format!("xeno-canto {scientific}"), pages, self.clock.clone())
            .rate_limit(self.page_delay())
            .cancel_on(cancel)
            .into_stream()
            .try_filter(move |recording| futures::future::ready(uploaded_in_window(recording, &window)))
            .map_ok(move |recording| recording_record(recording, &scientific, clock.now()))
            .boxed()
    }

    fn page_delay(&self) -> Duration {
        Duration::from_millis(self.config.page_delay_ms)
    }
}

fn recording_record(mut recording: Value, queried: &str, fetched_at: chrono::DateTime<chrono::Utc>) -> RawRecord {
    let record_id = recording
        .get("id")
        .and_then(as_text)
        .unwrap_or_default();
    if let Some(fields) = recording.as_object_mut() {
        fields.insert("_species_queried".into(), json!(queried));
    }
    RawRecord::new(SOURCE_ID, record_id, recording, fetched_at)
}

#[async_trait]
impl Source for XenoCantoSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::days(30)
    }

    async fn connect(&self) -> Result<()> {
        let query = format!("cnt:{}", self.config.country);
        let response = self
            .http
            .get_json(&self.config.api_url, &[("query", query), ("page", "1".to_string())])
            .await
            .map_err(|e| IngestError::connect(SOURCE_ID, e.to_string()))?;
        let total = response.get("numRecordings").and_then(as_f64).unwrap_or(0.0) as u64;
        info!(recordings = total, country = %self.config.country, "Connected to xeno-canto");
        Ok(())
    }

    fn fetch(&self, window: FetchWindow, cancel: CancellationToken) -> BoxStream<'_, Result<RawRecord>> {
        let delay = self.page_delay();
        let recordings = stream::iter(self.config.target_species.clone().into_iter().enumerate())
            .then(move |(index, species)| {
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        info!(species = %species, "Cancelled before species");
                        return cancelled();
                    }
                    // pace species the same way as pages
                    if index > 0 {
                        self.clock.sleep(delay).await;
                    }
                    self.species_stream(species, window, cancel)
                }
            })
            .flatten()
            .boxed();
        end_on_cancel(recordings)
    }

    fn validate(&self, record: &RawRecord) -> ValidationOutcome {
        self.rules.evaluate(record, self.clock.now())
    }

    fn transform(&self, record: &ValidatedRecord) -> std::result::Result<Fields, TransformError> {
        let raw = record.raw();
        let id = raw.text_field("id").ok_or_else(|| TransformError::missing("id"))?;
        let file = raw.str_field("file").ok_or_else(|| TransformError::missing("file"))?;

        let scientific = format!(
            "{} {}",
            raw.str_field("gen").unwrap_or_default(),
            raw.str_field("sp").unwrap_or_default()
        );
        let common = raw
            .str_field("en")
            .map(str::to_string)
            .or_else(|| find_species(&scientific).map(|s| s.common.to_string()))
            .unwrap_or_default();
        let species_code = species_code_for(&scientific)
            .map(str::to_string)
            .unwrap_or_else(|| scientific.clone());

        let mut fields = Fields::new();
        fields.insert("recording_id".into(), json!(format!("XC{id}")));
        fields.insert("species_scientific".into(), json!(scientific));
        fields.insert("species_common".into(), json!(common));
        fields.insert("species_code".into(), json!(species_code));
        fields.insert("latitude".into(), json!(raw.f64_field("lat")));
        fields.insert("longitude".into(), json!(raw.f64_field("lng")));
        fields.insert("country".into(), json!(raw.str_field("cnt").unwrap_or_default()));
        fields.insert("location_name".into(), json!(raw.str_field("loc").unwrap_or_default()));
        fields.insert("recording_date".into(), json!(raw.str_field("date").unwrap_or_default()));
        fields.insert("recording_time".into(), json!(raw.str_field("time").unwrap_or_default()));
        fields.insert("quality_rating".into(), json!(raw.str_field("q").unwrap_or_default()));
        fields.insert("length_seconds".into(), json!(raw.str_field("length").and_then(parse_length)));
        fields.insert("audio_url".into(), json!(https(file)));
        fields.insert("sonogram_url".into(), json!(raw.str_field("sono.full").map(https)));
        fields.insert("recordist".into(), json!(raw.str_field("rec").unwrap_or_default()));
        fields.insert("remarks".into(), json!(raw.str_field("rmk").unwrap_or_default()));
        fields.insert("vocalization_type".into(), json!(raw.str_field("type").unwrap_or_default()));
        fields.insert("license".into(), json!(raw.str_field("lic").map(https)));
        fields.insert("uploaded_date".into(), json!(raw.str_field("uploaded")));
        fields.insert("source_system".into(), json!(SOURCE_ID));
        Ok(fields)
    }

    fn checkpoint_field(&self) -> &str {
        "uploaded_date"
    }

    fn audio_asset(&self, record: &StandardizedRecord) -> Option<AudioAsset> {
        let url = record.str_field("audio_url").filter(|u| !u.is_empty())?;
        let recording_id = record.str_field("recording_id")?;
        Some(AudioAsset::new(url, self.audio_dir.join(format!("{recording_id}.mp3")), None))
    }
}
