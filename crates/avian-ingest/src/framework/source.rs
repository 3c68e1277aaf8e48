//! Capability interface implemented once per upstream

use crate::error::{Result, TransformError};
use crate::framework::download::AudioAsset;
use crate::framework::types::{
    Dataset, Fields, FetchWindow, RawRecord, StandardizedRecord, ValidatedRecord, ValidationOutcome,
};
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// A data source the orchestrator can drive
///
/// The orchestrator depends only on this trait: it checks reachability with
/// [`connect`](Source::connect), pulls the lazy [`fetch`](Source::fetch)
/// stream through [`validate`](Source::validate) and
/// [`transform`](Source::transform), and reads the checkpoint field off the
/// standardized output.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier used for partitions, checkpoints and batch ids
    fn id(&self) -> &str;

    /// Window used when neither an explicit range nor a checkpoint exists
    fn default_lookback(&self) -> chrono::Duration;

    /// Connectivity check; an error fails the run without fetching
    async fn connect(&self) -> Result<()>;

    /// Lazy sequence of raw records in `window`. An `Err` item ends the
    /// fetch; items already yielded count as delivered.
    fn fetch(&self, window: FetchWindow, cancel: CancellationToken) -> BoxStream<'_, Result<RawRecord>>;

    fn validate(&self, record: &RawRecord) -> ValidationOutcome;

    /// Map an accepted record into the standardized schema. Pure: the same
    /// input always yields the same fields.
    fn transform(&self, record: &ValidatedRecord) -> std::result::Result<Fields, TransformError>;

    /// Standardized field whose maximum becomes the checkpoint
    fn checkpoint_field(&self) -> &str {
        "timestamp"
    }

    /// Audio file associated with an accepted record, if any
    fn audio_asset(&self, _record: &StandardizedRecord) -> Option<AudioAsset> {
        None
    }

    /// Side datasets for `window`, written next to the batch. An error is
    /// reported on the run but does not change its status.
    async fn datasets(&self, _window: FetchWindow, _cancel: CancellationToken) -> Result<Vec<Dataset>> {
        Ok(Vec::new())
    }
}
