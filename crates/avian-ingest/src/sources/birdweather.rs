//! BirdWeather acoustic detections over GraphQL
//!
//! Stations inside the configured bounding box are discovered first; each
//! station's detections in the fetch window are then paged through in
//! ascending time order. Both listings use relay-style connections
//! (`pageInfo { hasNextPage endCursor }`). Stations whose last update
//! predates the window start are not queried for detections.
//!
//! When enabled, the species taxonomy, BirdNET app sightings and the
//! aggregate counts for the window are published as side datasets.

use crate::config::BirdWeatherConfig;
use crate::error::{IngestError, Result, TransformError, TransportError};
use crate::framework::clock::Clock;
use crate::framework::download::AudioAsset;
use crate::framework::pagination::{Page, PageSource, PaginatedFetcher};
use crate::framework::rules::{Rule, RuleSet};
use crate::framework::source::Source;
use crate::framework::transport::HttpClient;
use crate::framework::types::{
    as_text, Dataset, Fields, FetchWindow, RawRecord, StandardizedRecord, ValidatedRecord, ValidationOutcome,
};
use crate::reference::{is_usuv_species_code, species_code_for};
use crate::sources::{cancelled, end_on_cancel};
use async_trait::async_trait;
use avian_common::checksum::short_content_hash;
use avian_common::types::parse_timestamp;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SOURCE_ID: &str = "birdweather";

const STATIONS_QUERY: &str = r#"
query Stations($ne: InputLocation, $sw: InputLocation, $cursor: String, $query: String) {
  stations(ne: $ne, sw: $sw, query: $query, first: 50, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    totalCount
    nodes { id name country continent coords { lat lon } updatedAt }
  }
}
"#;

const DETECTIONS_QUERY: &str = r#"
query Detections(
  $stationIds: [ID!], $start: ISO8601DateTime, $end: ISO8601DateTime, $cursor: String,
  $minScore: Float, $minConfidence: Float, $validSoundscape: Boolean, $recordingModes: [String!],
  $timeOfDayGte: Int, $timeOfDayLte: Int, $countries: [String!], $continents: [String!],
  $eclipse: Boolean
) {
  detections(
    stationIds: $stationIds
    period: { start: $start, end: $end }
    scoreGte: $minScore
    confidenceGte: $minConfidence
    validSoundscape: $validSoundscape
    recordingModes: $recordingModes
    timeOfDayGte: $timeOfDayGte
    timeOfDayLte: $timeOfDayLte
    countries: $countries
    continents: $continents
    eclipse: $eclipse
    first: 100
    after: $cursor
    order: ASC
  ) {
    pageInfo { hasNextPage endCursor }
    nodes {
      id
      timestamp
      confidence
      score
      probability
      species { id commonName scientificName ebirdCode }
      coords { lat lon }
      soundscape { id url duration filesize startTime endTime mode }
      station { id name country }
      eclipse
    }
  }
}
"#;

const SPECIES_QUERY: &str = r#"
query SpeciesMetadata($cursor: String) {
  searchSpecies(query: "", first: 100, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    nodes {
      id commonName scientificName alpha alpha6 ebirdCode
      birdweatherUrl ebirdUrl wikipediaUrl wikipediaSummary
      imageUrl imageCredit imageLicense
    }
  }
}
"#;

const BIRDNET_SIGHTINGS_QUERY: &str = r#"
query BirdnetSightings(
  $start: ISO8601DateTime, $end: ISO8601DateTime, $ne: InputLocation, $sw: InputLocation, $cursor: String
) {
  birdnetSightings(period: { start: $start, end: $end }, ne: $ne, sw: $sw, first: 100, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    nodes {
      id timestamp score certainty location
      coords { lat lon }
      species { id commonName scientificName }
    }
  }
}
"#;

const COUNTS_QUERY: &str = r#"
query Counts($period: InputDuration) {
  counts(period: $period) {
    detections species stations birdnet
    breakdown { stations { type count } }
  }
}
"#;

const DAILY_COUNTS_QUERY: &str = r#"
query DailyDetectionCounts($period: InputDuration) {
  dailyDetectionCounts(period: $period) {
    date dayOfYear
    counts { count species { id commonName } }
  }
}
"#;

/// Extract `data.{field}` from a GraphQL response
///
/// An `errors` array without usable data is terminal: the query itself is
/// wrong or unauthorized, and repeating it cannot help.
pub fn graphql_data<'a>(response: &'a Value, field: &str) -> std::result::Result<&'a Value, TransportError> {
    let errors: Vec<String> = response
        .get("errors")
        .and_then(Value::as_array)
        .map(|errs| {
            errs.iter()
                .map(|e| e.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string())
                .collect()
        })
        .unwrap_or_default();

    match response.get("data").and_then(|d| d.get(field)).filter(|v| !v.is_null()) {
        Some(data) => {
            if !errors.is_empty() {
                warn!(field, errors = ?errors, "GraphQL response carried partial errors");
            }
            Ok(data)
        },
        None if !errors.is_empty() => {
            Err(TransportError::terminal(format!("GraphQL errors: {}", errors.join("; "))))
        },
        None => Err(TransportError::terminal(format!("GraphQL response missing data.{field}"))),
    }
}

/// Convert a relay connection into a page of nodes
pub fn connection_page(connection: &Value) -> Page<Value> {
    let items = connection
        .get("nodes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let page_info = connection.get("pageInfo");
    Page {
        items,
        next_cursor: page_info
            .and_then(|p| p.get("endCursor"))
            .and_then(Value::as_str)
            .map(str::to_string),
        has_next: page_info
            .and_then(|p| p.get("hasNextPage"))
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

/// One GraphQL connection addressed by `$cursor`
struct GraphQlPages {
    http: Arc<HttpClient>,
    endpoint: String,
    query: &'static str,
    field: &'static str,
    variables: Value,
}

#[async_trait]
impl PageSource for GraphQlPages {
    type Item = Value;

    async fn fetch_page(&self, cursor: Option<String>) -> std::result::Result<Page<Value>, TransportError> {
        let mut variables = self.variables.clone();
        variables["cursor"] = json!(cursor);
        let body = json!({ "query": self.query, "variables": variables });

        let response = self.http.post_json(&self.endpoint, &body).await?;
        Ok(connection_page(graphql_data(&response, self.field)?))
    }
}

pub struct BirdWeatherSource {
    config: BirdWeatherConfig,
    http: Arc<HttpClient>,
    clock: Arc<dyn Clock>,
    audio_dir: PathBuf,
    rules: RuleSet,
}

impl BirdWeatherSource {
    pub fn new(config: BirdWeatherConfig, http: Arc<HttpClient>, clock: Arc<dyn Clock>, audio_dir: PathBuf) -> Self {
        let rules = RuleSet::new(vec![
            Rule::required("id"),
            Rule::required("timestamp"),
            Rule::required("species"),
            Rule::required("confidence"),
            Rule::range("confidence", config.confidence_min, config.confidence_max),
            Rule::bounding_box("coords.lat", "coords.lon", config.bounds),
            Rule::not_in_future("timestamp"),
        ]);
        Self {
            config,
            http,
            clock,
            audio_dir,
            rules,
        }
    }

    fn stations(&self) -> GraphQlPages {
        GraphQlPages {
            http: self.http.clone(),
            endpoint: self.config.endpoint.clone(),
            query: STATIONS_QUERY,
            field: "stations",
            variables: json!({
                "ne": self.config.bounds.north_east(),
                "sw": self.config.bounds.south_west(),
                "query": self.config.station_query,
            }),
        }
    }

    fn detections(&self, station_id: &str, window: FetchWindow) -> GraphQlPages {
        let c = &self.config;
        GraphQlPages {
            http: self.http.clone(),
            endpoint: c.endpoint.clone(),
            query: DETECTIONS_QUERY,
            field: "detections",
            variables: json!({
                "stationIds": [station_id],
                "start": window.start.to_rfc3339(),
                "end": window.end.to_rfc3339(),
                "minScore": c.min_score,
                "minConfidence": c.min_confidence,
                "validSoundscape": c.valid_soundscape,
                "recordingModes": c.recording_modes,
                "timeOfDayGte": c.time_of_day_gte,
                "timeOfDayLte": c.time_of_day_lte,
                "countries": c.countries,
                "continents": c.continents,
                "eclipse": c.eclipse,
            }),
        }
    }

    fn species_listing(&self) -> GraphQlPages {
        GraphQlPages {
            http: self.http.clone(),
            endpoint: self.config.endpoint.clone(),
            query: SPECIES_QUERY,
            field: "searchSpecies",
            variables: json!({}),
        }
    }

    fn birdnet_sightings(&self, window: FetchWindow) -> GraphQlPages {
        GraphQlPages {
            http: self.http.clone(),
            endpoint: self.config.endpoint.clone(),
            query: BIRDNET_SIGHTINGS_QUERY,
            field: "birdnetSightings",
            variables: json!({
                "start": window.start.to_rfc3339(),
                "end": window.end.to_rfc3339(),
                "ne": self.config.bounds.north_east(),
                "sw": self.config.bounds.south_west(),
            }),
        }
    }

    /// One unpaged query, returning `data.{field}`
    async fn query_field(&self, query: &str, field: &str, variables: Value) -> Result<Value> {
        let body = json!({ "query": query, "variables": variables });
        let response = self.http.post_json(&self.config.endpoint, &body).await?;
        Ok(graphql_data(&response, field)?.clone())
    }

    /// Every node of a listing, stamped with the ingestion time
    async fn collect_listing(
        &self,
        label: &str,
        pages: GraphQlPages,
        delay_ms: u64,
        cancel: CancellationToken,
    ) -> Result<Vec<Value>> {
        let ingested_at = Value::String(self.clock.now().to_rfc3339());
        PaginatedFetcher::new(label, pages, self.clock.clone())
            .rate_limit(Duration::from_millis(delay_ms))
            .cancel_on(cancel)
            .into_stream()
            .map_ok(move |mut node| {
                if let Some(fields) = node.as_object_mut() {
                    fields.insert("_ingested_at".into(), ingested_at.clone());
                }
                node
            })
            .try_collect()
            .await
    }

    async fn aggregates(&self, window: FetchWindow) -> Result<Vec<Dataset>> {
        let period = json!({ "from": window.start.to_rfc3339(), "to": window.end.to_rfc3339() });

        let mut counts = self
            .query_field(COUNTS_QUERY, "counts", json!({ "period": &period }))
            .await?;
        if let Some(fields) = counts.as_object_mut() {
            fields.insert("period".into(), period.clone());
        }

        let daily = self
            .query_field(DAILY_COUNTS_QUERY, "dailyDetectionCounts", json!({ "period": &period }))
            .await?;
        let days = match daily {
            Value::Array(days) => days,
            other => vec![other],
        };
        info!(days = days.len(), "Fetched detection counts");

        Ok(vec![Dataset::new("counts", vec![counts]), Dataset::new("daily_counts", days)])
    }

    fn station_detections(
        &self,
        station: Value,
        window: FetchWindow,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<RawRecord>> {
        if cancel.is_cancelled() {
            return cancelled();
        }
        let Some(station_id) = station.get("id").and_then(as_text) else {
            warn!(station = %station, "Skipping station without id");
            return stream::empty().boxed();
        };
        let last_active = station
            .get("updatedAt")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        if let Some(last_active) = last_active {
            if last_active.date_naive() < window.start.date_naive() {
                debug!(station = %station_id, last_active = %last_active, "Skipping station idle before the window");
                return stream::empty().boxed();
            }
        }

        let clock = self.clock.clone();
        PaginatedFetcher::new(
            format!("birdweather detections {station_id}"),
            self.detections(&station_id, window),
            self.clock.clone(),
        )
        .rate_limit(Duration::from_millis(self.config.detection_page_delay_ms))
        .cancel_on(cancel)
        .into_stream()
        .map_ok(move |node| detection_record(node, &station, clock.now()))
        .boxed()
    }
}

fn detection_record(mut node: Value, station: &Value, fetched_at: chrono::DateTime<chrono::Utc>) -> RawRecord {
    // older API versions omit the nested station on detections
    if let Some(fields) = node.as_object_mut() {
        if fields.get("station").map_or(true, Value::is_null) {
            fields.insert(
                "station".into(),
                json!({ "id": station.get("id"), "name": station.get("name") }),
            );
        }
    }
    let record_id = node
        .get("id")
        .and_then(as_text)
        .unwrap_or_else(|| short_content_hash(&node, 12));
    RawRecord::new(SOURCE_ID, record_id, node, fetched_at)
}

fn audio_extension(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    match file.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 5 => ext,
        _ => "flac",
    }
}

#[async_trait]
impl Source for BirdWeatherSource {
    fn id(&self) -> &str {
        SOURCE_ID
    }

    fn default_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(24)
    }

    async fn connect(&self) -> Result<()> {
        let page = self
            .stations()
            .fetch_page(None)
            .await
            .map_err(|e| IngestError::connect(SOURCE_ID, e.to_string()))?;
        info!(stations_on_first_page = page.items.len(), "Connected to BirdWeather");
        Ok(())
    }

    fn fetch(&self, window: FetchWindow, cancel: CancellationToken) -> BoxStream<'_, Result<RawRecord>> {
        let stations = PaginatedFetcher::new("birdweather stations", self.stations(), self.clock.clone())
            .rate_limit(Duration::from_millis(self.config.station_page_delay_ms))
            .cancel_on(cancel.clone())
            .into_stream();

        let detections = stations
            .map_ok(move |station| self.station_detections(station, window, cancel.clone()))
            .try_flatten()
            .boxed();
        end_on_cancel(detections)
    }

    fn validate(&self, record: &RawRecord) -> ValidationOutcome {
        self.rules.evaluate(record, self.clock.now())
    }

    fn transform(&self, record: &ValidatedRecord) -> std::result::Result<Fields, TransformError> {
        let raw = record.raw();
        let detection_id = raw.text_field("id").ok_or_else(|| TransformError::missing("id"))?;
        let timestamp = raw
            .str_field("timestamp")
            .ok_or_else(|| TransformError::missing("timestamp"))?;

        let scientific = raw.str_field("species.scientificName");
        let species_code = raw
            .str_field("species.ebirdCode")
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
            .or_else(|| scientific.and_then(species_code_for).map(str::to_string))
            .or_else(|| scientific.map(str::to_string))
            .unwrap_or_default();

        let mut fields = Fields::new();
        fields.insert("detection_id".into(), json!(detection_id));
        fields.insert("timestamp".into(), json!(timestamp));
        fields.insert("station_id".into(), json!(raw.text_field("station.id")));
        fields.insert("station_name".into(), json!(raw.str_field("station.name")));
        fields.insert("latitude".into(), json!(raw.f64_field("coords.lat")));
        fields.insert("longitude".into(), json!(raw.f64_field("coords.lon")));
        fields.insert("is_target_species".into(), json!(is_usuv_species_code(&species_code)));
        fields.insert("species_code".into(), json!(species_code));
        fields.insert("species_common".into(), json!(raw.str_field("species.commonName")));
        fields.insert("species_scientific".into(), json!(scientific));
        fields.insert("confidence".into(), json!(raw.f64_field("confidence")));
        fields.insert("score".into(), json!(raw.f64_field("score")));
        fields.insert("probability".into(), json!(raw.f64_field("probability")));
        fields.insert("audio_url".into(), json!(raw.str_field("soundscape.url")));
        fields.insert("soundscape_duration".into(), json!(raw.f64_field("soundscape.duration")));
        fields.insert(
            "soundscape_filesize".into(),
            json!(raw.f64_field("soundscape.filesize").map(|s| s as u64)),
        );
        fields.insert("source_system".into(), json!(SOURCE_ID));
        Ok(fields)
    }

    fn audio_asset(&self, record: &StandardizedRecord) -> Option<AudioAsset> {
        let url = record.str_field("audio_url")?;
        let detection_id = record.str_field("detection_id")?;
        let station_id = record.str_field("station_id").unwrap_or("unknown");
        let target = self
            .audio_dir
            .join(station_id)
            .join(format!("{detection_id}.{}", audio_extension(url)));
        let expected_size = record.get("soundscape_filesize").and_then(Value::as_u64);
        Some(AudioAsset::new(url, target, expected_size))
    }

    async fn datasets(&self, window: FetchWindow, cancel: CancellationToken) -> Result<Vec<Dataset>> {
        let c = &self.config;
        let mut datasets = Vec::new();

        if c.ingest_species_metadata {
            let species = self
                .collect_listing("birdweather species", self.species_listing(), c.station_page_delay_ms, cancel.clone())
                .await?;
            info!(species = species.len(), "Fetched species metadata");
            datasets.push(Dataset::new("species_metadata", species));
        }
        if c.ingest_birdnet_sightings {
            let sightings = self
                .collect_listing(
                    "birdnet sightings",
                    self.birdnet_sightings(window),
                    c.detection_page_delay_ms,
                    cancel.clone(),
                )
                .await?;
            info!(sightings = sightings.len(), "Fetched BirdNET sightings");
            datasets.push(Dataset::new("birdnet_sightings", sightings));
        }
        if c.ingest_aggregates {
            datasets.extend(self.aggregates(window).await?);
        }
        Ok(datasets)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::clock::ManualClock;
    use crate::framework::transport::HttpConfig;
    use chrono::{TimeZone, Utc};

    fn source() -> BirdWeatherSource {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap()));
        let http = Arc::new(HttpClient::new(&HttpConfig::default(), clock.clone()).unwrap());
        BirdWeatherSource::new(BirdWeatherConfig::default(), http, clock, PathBuf::from("/data/raw_audio/birdweather"))
    }

    fn detection() -> Value {
        json!({
            "id": "88123",
            "timestamp": "2024-08-14T05:31:12+02:00",
            "confidence": 0.87,
            "score": 7.4,
            "probability": 0.41,
            "species": {"id": "12", "commonName": "Eurasian Blackbird", "scientificName": "Turdus merula", "ebirdCode": null},
            "coords": {"lat": 52.09, "lon": 5.12},
            "soundscape": {"id": "s1", "url": "https://media.birdweather.com/soundscapes/abc.flac?x=1", "duration": 3.0, "filesize": 48213},
            "station": {"id": 431, "name": "Utrecht Oost"}
        })
    }

    fn raw(data: Value) -> RawRecord {
        RawRecord::new(SOURCE_ID, "88123", data, Utc::now())
    }

    #[test]
    fn test_graphql_errors_without_data_are_terminal() {
        let response = json!({"errors": [{"message": "Not authorized"}], "data": null});
        let err = graphql_data(&response, "stations").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("Not authorized"));
    }

    #[test]
    fn test_connection_page() {
        let connection = json!({
            "pageInfo": {"hasNextPage": true, "endCursor": "MjA"},
            "nodes": [{"id": 1}, {"id": 2}]
        });
        let page = connection_page(&connection);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_next);
        assert_eq!(page.next_cursor.as_deref(), Some("MjA"));
    }

    #[test]
    fn test_validation_collects_every_reason() {
        let source = source();
        let mut data = detection();
        data["confidence"] = json!(1.7);
        data["coords"] = json!({"lat": 48.8, "lon": 2.35});

        let outcome = source.validate(&raw(data));
        assert!(!outcome.accepted);
        assert_eq!(outcome.reasons.len(), 3, "{:?}", outcome.reasons);
        assert!(outcome.reasons[0].starts_with("confidence"));
    }

    #[test]
    fn test_missing_species_is_rejected() {
        let source = source();
        let mut data = detection();
        data["species"] = Value::Null;
        let outcome = source.validate(&raw(data));
        assert!(outcome.reasons.iter().any(|r| r.contains("species")));
    }

    #[test]
    fn test_transform_falls_back_to_lookup_code() {
        let source = source();
        let record = ValidatedRecord::new(raw(detection()), ValidationOutcome::accepted());
        let fields = source.transform(&record).unwrap();

        assert_eq!(fields["species_code"], json!("eurbla"));
        assert_eq!(fields["is_target_species"], json!(true));
        assert_eq!(fields["station_id"], json!("431"));
        assert_eq!(fields["soundscape_filesize"], json!(48213));
        assert_eq!(fields["source_system"], json!("birdweather"));
    }

    #[test]
    fn test_unknown_species_kept_verbatim() {
        let source = source();
        let mut data = detection();
        data["species"] = json!({"commonName": "House Sparrow", "scientificName": "Passer domesticus"});
        let record = ValidatedRecord::new(raw(data), ValidationOutcome::accepted());
        let fields = source.transform(&record).unwrap();
        assert_eq!(fields["species_code"], json!("Passer domesticus"));
        assert_eq!(fields["is_target_species"], json!(false));
    }

    #[test]
    fn test_detection_variables_carry_eclipse() {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap()));
        let http = Arc::new(HttpClient::new(&HttpConfig::default(), clock.clone()).unwrap());
        let config = BirdWeatherConfig {
            eclipse: Some(true),
            ..BirdWeatherConfig::default()
        };
        let eclipse_only = BirdWeatherSource::new(config, http, clock, PathBuf::from("/tmp"));
        let window = FetchWindow::new(
            Utc.with_ymd_and_hms(2024, 8, 14, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap(),
        );

        let pages = eclipse_only.detections("431", window);
        assert_eq!(pages.variables["eclipse"], json!(true));
        assert!(DETECTIONS_QUERY.contains("eclipse: $eclipse"));

        let unset = source().detections("431", window);
        assert_eq!(unset.variables["eclipse"], Value::Null);
    }

    #[tokio::test]
    async fn test_station_idle_before_window_is_skipped() {
        let source = source();
        let window = FetchWindow::new(
            Utc.with_ymd_and_hms(2024, 8, 14, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 8, 15, 0, 0, 0).unwrap(),
        );
        let station = json!({"id": "77", "name": "Zolder", "updatedAt": "2024-08-13T23:59:00Z"});

        let records: Vec<_> = source
            .station_detections(station, window, CancellationToken::new())
            .collect()
            .await;
        assert!(records.is_empty());
    }

    #[test]
    fn test_audio_asset_path() {
        let source = source();
        let record = ValidatedRecord::new(raw(detection()), ValidationOutcome::accepted());
        let fields = source.transform(&record).unwrap();
        let standardized = StandardizedRecord::stamp(fields, "h".into(), Utc::now(), "b");

        let asset = source.audio_asset(&standardized).unwrap();
        assert_eq!(asset.target, PathBuf::from("/data/raw_audio/birdweather/431/88123.flac"));
        assert_eq!(asset.expected_size, Some(48213));
    }
}
