//! Concrete data sources
//!
//! | id                       | upstream                      | lookback |
//! |--------------------------|-------------------------------|----------|
//! | `birdweather`            | BirdWeather GraphQL API       | 24h      |
//! | `xeno_canto`             | xeno-canto REST API           | 30d      |
//! | `knmi_weather`           | KNMI hourly station files     | 7d       |
//! | `mortality_surveillance` | DWHC / Sovon report files     | 30d      |

pub mod birdweather;
pub mod knmi;
pub mod mortality;
pub mod xeno_canto;

use crate::config::Settings;
use crate::error::{IngestError, Result};
use crate::framework::clock::Clock;
use crate::framework::source::Source;
use crate::framework::transport::HttpClient;
use crate::framework::types::RawRecord;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use birdweather::BirdWeatherSource;
pub use knmi::KnmiSource;
pub use mortality::MortalitySource;
pub use xeno_canto::XenoCantoSource;

/// Registry of every source the orchestrator can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    BirdWeather,
    XenoCanto,
    Knmi,
    Mortality,
}

impl SourceKind {
    pub fn all() -> &'static [SourceKind] {
        &[
            SourceKind::BirdWeather,
            SourceKind::XenoCanto,
            SourceKind::Knmi,
            SourceKind::Mortality,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::BirdWeather => "birdweather",
            SourceKind::XenoCanto => "xeno_canto",
            SourceKind::Knmi => "knmi_weather",
            SourceKind::Mortality => "mortality_surveillance",
        }
    }

    pub fn enabled(&self, settings: &Settings) -> bool {
        match self {
            SourceKind::BirdWeather => settings.birdweather.enabled,
            SourceKind::XenoCanto => settings.xeno_canto.enabled,
            SourceKind::Knmi => settings.knmi.enabled,
            SourceKind::Mortality => settings.mortality.enabled,
        }
    }

    /// Whether audio should be fetched even without `--download-audio`
    pub fn downloads_audio_by_default(&self, settings: &Settings) -> bool {
        matches!(self, SourceKind::XenoCanto) && settings.xeno_canto.download_audio
    }

    /// Construct the source from settings
    pub fn build(&self, settings: &Settings, clock: Arc<dyn Clock>) -> Result<Arc<dyn Source>> {
        let audio_root = settings.storage.raw_audio_dir();
        let source: Arc<dyn Source> = match self {
            SourceKind::BirdWeather => {
                let http_config = settings
                    .retry
                    .http_config(settings.birdweather.api_token.clone());
                let http = Arc::new(HttpClient::new(&http_config, clock.clone())?);
                Arc::new(BirdWeatherSource::new(
                    settings.birdweather.clone(),
                    http,
                    clock,
                    audio_root.join(self.as_str()),
                ))
            },
            SourceKind::XenoCanto => {
                let http = Arc::new(HttpClient::new(&settings.retry.http_config(None), clock.clone())?);
                Arc::new(XenoCantoSource::new(
                    settings.xeno_canto.clone(),
                    http,
                    clock,
                    audio_root.join(self.as_str()),
                ))
            },
            SourceKind::Knmi => Arc::new(KnmiSource::new(settings.knmi.clone(), clock)),
            SourceKind::Mortality => Arc::new(MortalitySource::new(settings.mortality.clone(), clock)),
        };
        Ok(source)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = IngestError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "birdweather" => Ok(SourceKind::BirdWeather),
            "xeno_canto" | "xenocanto" => Ok(SourceKind::XenoCanto),
            "knmi_weather" | "knmi" => Ok(SourceKind::Knmi),
            "mortality_surveillance" | "mortality" => Ok(SourceKind::Mortality),
            other => Err(IngestError::Config(format!(
                "unknown source '{other}' (expected one of: {})",
                SourceKind::all()
                    .iter()
                    .map(|k| k.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }
}

/// Ends `records` right after the first [`IngestError::Cancelled`]
pub(crate) fn end_on_cancel<'a>(records: BoxStream<'a, Result<RawRecord>>) -> BoxStream<'a, Result<RawRecord>> {
    records
        .scan(false, |stopped, item| {
            if *stopped {
                return future::ready(None);
            }
            *stopped = matches!(item, Err(IngestError::Cancelled));
            future::ready(Some(item))
        })
        .boxed()
}

/// A stream that only reports cancellation
pub(crate) fn cancelled<'a>() -> BoxStream<'a, Result<RawRecord>> {
    stream::once(future::ready(Err(IngestError::Cancelled))).boxed()
}

/// Records loaded in one pass from local files. Cancellation ends the
/// stream with [`IngestError::Cancelled`].
pub(crate) fn local_records<'a, F>(load: F, cancel: CancellationToken) -> BoxStream<'a, Result<RawRecord>>
where
    F: Future<Output = Result<Vec<RawRecord>>> + Send + 'a,
{
    stream::once(load)
        .map_ok(|records| stream::iter(records.into_iter().map(Ok::<_, IngestError>)))
        .try_flatten()
        .scan(false, move |stopped, item| {
            let next = if *stopped {
                None
            } else if cancel.is_cancelled() {
                *stopped = true;
                Some(Err(IngestError::Cancelled))
            } else {
                Some(item)
            };
            future::ready(next)
        })
        .boxed()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::clock::SystemClock;

    #[test]
    fn test_parse_source_names() {
        assert_eq!("birdweather".parse::<SourceKind>().unwrap(), SourceKind::BirdWeather);
        assert_eq!("xeno-canto".parse::<SourceKind>().unwrap(), SourceKind::XenoCanto);
        assert_eq!("knmi_weather".parse::<SourceKind>().unwrap(), SourceKind::Knmi);
        assert_eq!("mortality".parse::<SourceKind>().unwrap(), SourceKind::Mortality);
        assert!("ebird".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_built_sources_carry_their_ids() {
        let settings = Settings::default();
        for kind in SourceKind::all() {
            let source = kind.build(&settings, Arc::new(SystemClock)).unwrap();
            assert_eq!(source.id(), kind.as_str());
        }
    }

    #[tokio::test]
    async fn test_end_on_cancel_yields_one_cancellation() {
        let items = stream::iter(vec![
            Ok(RawRecord::new("t", "1", serde_json::json!({}), chrono::Utc::now())),
            Err(IngestError::Cancelled),
            Err(IngestError::Cancelled),
            Ok(RawRecord::new("t", "2", serde_json::json!({}), chrono::Utc::now())),
        ])
        .boxed();

        let results: Vec<Result<RawRecord>> = end_on_cancel(items).collect().await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().record_id, "1");
        assert!(matches!(results[1], Err(IngestError::Cancelled)));
    }

    #[test]
    fn test_enabled_follows_settings() {
        let mut settings = Settings::default();
        settings.knmi.enabled = false;
        assert!(!SourceKind::Knmi.enabled(&settings));
        assert!(SourceKind::BirdWeather.enabled(&settings));
    }
}
