//! Generic ingestion framework shared by every source
//!
//! Data flows one way: transport -> paginated fetch -> record pipeline ->
//! batch file + checkpoint. [`run::IngestionRun`] supervises a single
//! source invocation and aggregates its status.

pub mod checkpoint;
pub mod clock;
pub mod download;
pub mod pagination;
pub mod pipeline;
pub mod rules;
pub mod run;
pub mod source;
pub mod storage;
pub mod transport;
pub mod types;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use download::{AudioAsset, BulkDownloader, DownloadOutcome, DownloadSummary};
pub use pagination::{Page, PageSource, PaginatedFetcher};
pub use pipeline::{PipelineOutcome, RecordPipeline};
pub use rules::{Rule, RuleSet};
pub use run::{IngestionRun, RunEnvironment, RunOptions, RunState};
pub use source::Source;
pub use storage::{BatchFile, BatchStore};
pub use transport::{HttpClient, HttpConfig, RetryPolicy, RetryingTransport};
pub use types::{
    Dataset, Fields, FetchWindow, IngestionStatus, RawRecord, RunMetadata, StandardizedRecord,
    ValidatedRecord, ValidationOutcome,
};
