//! Configuration management
//!
//! Settings come from three layers, later layers winning:
//!
//! 1. built-in defaults (every field has one)
//! 2. an optional YAML or JSON file, chosen by extension
//! 3. environment variables (a `.env` file is loaded first if present)

use crate::framework::transport::{HttpConfig, RetryPolicy};
use anyhow::{bail, Context};
use avian_common::types::BoundingBox;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Default root of all persisted output.
pub const DEFAULT_DATA_PATH: &str = "./data/biosurveillance";

/// Default BirdWeather GraphQL endpoint.
pub const DEFAULT_BIRDWEATHER_ENDPOINT: &str = "https://app.birdweather.com/graphql";

/// Default xeno-canto recordings endpoint.
pub const DEFAULT_XENO_CANTO_URL: &str = "https://xeno-canto.org/api/2/recordings";

/// Quality grades, best first.
pub const QUALITY_GRADES: &[&str] = &["A", "B", "C", "D", "E"];

/// Station discovery area around the Netherlands.
pub const BIRDWEATHER_BOUNDS: BoundingBox = BoundingBox::new(50.75, 53.7, 3.33, 7.22);

/// Plausible station coordinates for KNMI observations.
pub const KNMI_BOUNDS: BoundingBox = BoundingBox::new(50.0, 54.0, 3.0, 8.0);

/// Netherlands land area used for mortality reports.
pub const NETHERLANDS_BOUNDS: BoundingBox = BoundingBox::new(50.75, 53.47, 3.37, 7.21);

/// Ten USUV-susceptible species targeted by default.
pub const DEFAULT_TARGET_SPECIES: &[&str] = &[
    "Turdus merula",
    "Turdus philomelos",
    "Turdus viscivorus",
    "Pica pica",
    "Garrulus glandarius",
    "Chloris chloris",
    "Sturnus vulgaris",
    "Corvus corone",
    "Cyanistes caeruleus",
    "Parus major",
];

/// Commented template written by `init-config`.
pub const DEFAULT_CONFIG_YAML: &str = r#"# Avian biosurveillance ingestion settings
#
# Every key is optional. Environment variables override this file:
#   BIOSURVEILLANCE_DATA_PATH, PIPELINE_INCREMENTAL, PIPELINE_PARALLEL,
#   BIRDWEATHER_API_TOKEN, BIRDWEATHER_ENABLED, XENOCANTO_ENABLED,
#   XENOCANTO_DOWNLOAD_AUDIO, KNMI_ENABLED, KNMI_INPUT_PATH,
#   MORTALITY_ENABLED, MORTALITY_INPUT_PATH, MORTALITY_FORMAT

storage:
  # bronze/, checkpoints/ and raw_audio/ are created below this path
  base_path: ./data/biosurveillance

pipeline:
  incremental: true
  parallel_ingestion: false
  download_workers: 4
  max_error_messages: 100

retry:
  max_attempts: 5
  base_backoff_ms: 2000
  request_timeout_secs: 60

birdweather:
  enabled: true
  endpoint: https://app.birdweather.com/graphql
  # api_token: ""
  bounds: { min_lat: 50.75, max_lat: 53.7, min_lon: 3.33, max_lon: 7.22 }
  station_page_delay_ms: 200
  detection_page_delay_ms: 100
  confidence_min: 0.01
  confidence_max: 1.0
  # min_score: 0.5
  # min_confidence: 0.7
  # valid_soundscape: true
  # recording_modes: [live]
  # time_of_day_gte: 4
  # time_of_day_lte: 22
  # countries: [Netherlands]
  # continents: [Europe]
  # eclipse: false
  # side datasets written next to each batch
  ingest_species_metadata: false
  ingest_birdnet_sightings: false
  ingest_aggregates: false

xeno_canto:
  enabled: true
  api_url: https://xeno-canto.org/api/2/recordings
  country: Netherlands
  # A is best, E is worst; grades up to and including this one are kept
  quality_threshold: A
  page_delay_ms: 1000
  download_audio: false
  target_species:
    - Turdus merula
    - Turdus philomelos
    - Turdus viscivorus
    - Pica pica
    - Garrulus glandarius
    - Chloris chloris
    - Sturnus vulgaris
    - Corvus corone
    - Cyanistes caeruleus
    - Parus major

knmi:
  enabled: true
  # directory holding uurgeg_*.txt hourly station files
  input_path: ./data/knmi
  stations: ["260", "240", "344", "370", "380", "270", "280", "290", "375", "350"]
  bounds: { min_lat: 50.0, max_lat: 54.0, min_lon: 3.0, max_lon: 8.0 }
  temperature_range: [-500.0, 500.0]
  humidity_range: [0.0, 100.0]

mortality:
  enabled: true
  input_path: ./data/mortality_reports
  # dwhc_csv | sovon_csv | json
  format: dwhc_csv
  bounds: { min_lat: 50.75, max_lat: 53.47, min_lon: 3.37, max_lon: 7.21 }
  earliest_date: 2015-01-01
"#;

// ============================================================================
// Settings
// ============================================================================

/// Complete ingestion settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub retry: RetryConfig,
    pub birdweather: BirdWeatherConfig,
    pub xeno_canto: XenoCantoConfig,
    pub knmi: KnmiConfig,
    pub mortality: MortalityConfig,
}

impl Settings {
    /// Load defaults, then `path` if given, then the environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let settings = settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a YAML (`.yaml`/`.yml`) or JSON file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let settings = if is_yaml {
            serde_yaml::from_str(&text)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        };
        Ok(settings)
    }

    /// Overlay environment variables
    pub fn apply_env(mut self) -> anyhow::Result<Self> {
        if let Some(path) = env_var("BIOSURVEILLANCE_DATA_PATH") {
            self.storage.base_path = PathBuf::from(path);
        }
        if let Some(v) = env_bool("PIPELINE_INCREMENTAL")? {
            self.pipeline.incremental = v;
        }
        if let Some(v) = env_bool("PIPELINE_PARALLEL")? {
            self.pipeline.parallel_ingestion = v;
        }

        if let Some(token) = env_var("BIRDWEATHER_API_TOKEN") {
            self.birdweather.api_token = Some(token);
        }
        if let Some(v) = env_bool("BIRDWEATHER_ENABLED")? {
            self.birdweather.enabled = v;
        }

        if let Some(v) = env_bool("XENOCANTO_ENABLED")? {
            self.xeno_canto.enabled = v;
        }
        if let Some(v) = env_bool("XENOCANTO_DOWNLOAD_AUDIO")? {
            self.xeno_canto.download_audio = v;
        }

        if let Some(v) = env_bool("KNMI_ENABLED")? {
            self.knmi.enabled = v;
        }
        if let Some(path) = env_var("KNMI_INPUT_PATH") {
            self.knmi.input_path = PathBuf::from(path);
        }

        if let Some(v) = env_bool("MORTALITY_ENABLED")? {
            self.mortality.enabled = v;
        }
        if let Some(path) = env_var("MORTALITY_INPUT_PATH") {
            self.mortality.input_path = PathBuf::from(path);
        }
        if let Some(format) = env_var("MORTALITY_FORMAT") {
            self.mortality.format = format.parse()?;
        }

        Ok(self)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pipeline.download_workers == 0 {
            bail!("pipeline.download_workers must be greater than 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }

        for (name, bbox) in [
            ("birdweather.bounds", &self.birdweather.bounds),
            ("knmi.bounds", &self.knmi.bounds),
            ("mortality.bounds", &self.mortality.bounds),
        ] {
            bbox.validate().with_context(|| format!("Invalid {name}"))?;
        }

        let (lo, hi) = (self.birdweather.confidence_min, self.birdweather.confidence_max);
        if !(0.0..=1.0).contains(&lo) || !(0.0..=1.0).contains(&hi) || lo > hi {
            bail!("birdweather confidence range [{lo}, {hi}] must lie within [0, 1] with min <= max");
        }

        if grade_rank(&self.xeno_canto.quality_threshold).is_none() {
            bail!(
                "xeno_canto.quality_threshold '{}' is not one of {}",
                self.xeno_canto.quality_threshold,
                QUALITY_GRADES.join(", ")
            );
        }

        for (name, (lo, hi)) in [
            ("knmi.temperature_range", self.knmi.temperature_range),
            ("knmi.humidity_range", self.knmi.humidity_range),
        ] {
            if lo > hi {
                bail!("{name} [{lo}, {hi}] is inverted");
            }
        }

        if self.birdweather.enabled && self.birdweather.api_token.is_none() {
            tracing::debug!("No BirdWeather API token configured, using anonymous access");
        }

        Ok(())
    }
}

/// Position of a quality grade in [`QUALITY_GRADES`], case-insensitive
pub fn grade_rank(grade: &str) -> Option<usize> {
    let grade = grade.trim();
    QUALITY_GRADES.iter().position(|g| g.eq_ignore_ascii_case(grade))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str) -> anyhow::Result<Option<bool>> {
    let Some(raw) = env_var(name) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(Some(true)),
        "false" | "0" | "no" | "off" => Ok(Some(false)),
        other => bail!("{name} must be a boolean, got '{other}'"),
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub base_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(DEFAULT_DATA_PATH),
        }
    }
}

impl StorageConfig {
    pub fn bronze_dir(&self) -> PathBuf {
        self.base_path.join("bronze")
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.base_path.join("checkpoints")
    }

    pub fn raw_audio_dir(&self) -> PathBuf {
        self.base_path.join("raw_audio")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub incremental: bool,
    pub parallel_ingestion: bool,
    pub download_workers: usize,
    pub max_error_messages: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            incremental: true,
            parallel_ingestion: false,
            download_workers: 4,
            max_error_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 2000,
            request_timeout_secs: 60,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_backoff_ms))
    }

    pub fn http_config(&self, bearer_token: Option<String>) -> HttpConfig {
        HttpConfig {
            timeout: Duration::from_secs(self.request_timeout_secs),
            bearer_token,
            retry: self.policy(),
            ..HttpConfig::default()
        }
    }
}

/// BirdWeather GraphQL source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BirdWeatherConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_token: Option<String>,
    /// Station discovery area, also the accepted detection area
    pub bounds: BoundingBox,
    /// Optional station name filter
    pub station_query: Option<String>,
    pub station_page_delay_ms: u64,
    pub detection_page_delay_ms: u64,
    pub min_score: Option<f64>,
    pub min_confidence: Option<f64>,
    pub valid_soundscape: Option<bool>,
    pub recording_modes: Option<Vec<String>>,
    pub time_of_day_gte: Option<u32>,
    pub time_of_day_lte: Option<u32>,
    pub countries: Option<Vec<String>>,
    pub continents: Option<Vec<String>>,
    /// Restrict detections to ones made during (or outside) a solar eclipse
    pub eclipse: Option<bool>,
    pub confidence_min: f64,
    pub confidence_max: f64,
    /// Species taxonomy listing
    pub ingest_species_metadata: bool,
    /// BirdNET app sightings inside `bounds`
    pub ingest_birdnet_sightings: bool,
    /// Platform-wide and daily detection counts for the window
    pub ingest_aggregates: bool,
}

impl Default for BirdWeatherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: DEFAULT_BIRDWEATHER_ENDPOINT.to_string(),
            api_token: None,
            bounds: BIRDWEATHER_BOUNDS,
            station_query: None,
            station_page_delay_ms: 200,
            detection_page_delay_ms: 100,
            min_score: None,
            min_confidence: None,
            valid_soundscape: None,
            recording_modes: None,
            time_of_day_gte: None,
            time_of_day_lte: None,
            countries: None,
            continents: None,
            eclipse: None,
            confidence_min: 0.01,
            confidence_max: 1.0,
            ingest_species_metadata: false,
            ingest_birdnet_sightings: false,
            ingest_aggregates: false,
        }
    }
}

/// Xeno-canto REST source
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XenoCantoConfig {
    pub enabled: bool,
    pub api_url: String,
    pub country: String,
    pub quality_threshold: String,
    pub page_delay_ms: u64,
    pub target_species: Vec<String>,
    pub download_audio: bool,
}

impl Default for XenoCantoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_url: DEFAULT_XENO_CANTO_URL.to_string(),
            country: "Netherlands".to_string(),
            quality_threshold: "A".to_string(),
            page_delay_ms: 1000,
            target_species: DEFAULT_TARGET_SPECIES.iter().map(|s| s.to_string()).collect(),
            download_audio: false,
        }
    }
}

/// KNMI hourly station files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnmiConfig {
    pub enabled: bool,
    pub input_path: PathBuf,
    /// Station ids to keep; empty keeps every station in the files
    pub stations: Vec<String>,
    pub bounds: BoundingBox,
    /// Accepted `T` range in tenths of a degree
    pub temperature_range: (f64, f64),
    pub humidity_range: (f64, f64),
}

impl Default for KnmiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_path: PathBuf::from("./data/knmi"),
            stations: crate::reference::KNMI_STATIONS
                .iter()
                .map(|s| s.id.to_string())
                .collect(),
            bounds: KNMI_BOUNDS,
            temperature_range: (-500.0, 500.0),
            humidity_range: (0.0, 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MortalityFormat {
    DwhcCsv,
    SovonCsv,
    Json,
}

impl MortalityFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MortalityFormat::DwhcCsv => "dwhc_csv",
            MortalityFormat::SovonCsv => "sovon_csv",
            MortalityFormat::Json => "json",
        }
    }
}

impl FromStr for MortalityFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dwhc_csv" => Ok(MortalityFormat::DwhcCsv),
            "sovon_csv" => Ok(MortalityFormat::SovonCsv),
            "json" => Ok(MortalityFormat::Json),
            other => bail!("Unsupported mortality format '{other}' (expected dwhc_csv, sovon_csv or json)"),
        }
    }
}

/// DWHC and Sovon dead-bird reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MortalityConfig {
    pub enabled: bool,
    pub input_path: PathBuf,
    pub format: MortalityFormat,
    pub bounds: BoundingBox,
    /// Reports before this date predate USUV surveillance
    pub earliest_date: NaiveDate,
}

impl Default for MortalityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            input_path: PathBuf::from("./data/mortality_reports"),
            format: MortalityFormat::DwhcCsv,
            bounds: NETHERLANDS_BOUNDS,
            earliest_date: NaiveDate::from_ymd_opt(2015, 1, 1).unwrap_or_default(),
        }
    }
}

impl MortalityConfig {
    pub fn epoch(&self) -> DateTime<Utc> {
        Utc.from_utc_datetime(&self.earliest_date.and_time(NaiveTime::default()))
    }
}
