use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    Checkpoint, FetchCacheEntry, Manifest, MetricsSnapshot, NormalizedRecord, PartitionSummary,
    QuarantinedRecord, RawRecord, RawSnapshot, Run, Source, SourceKind, ValidatedRecord,
};
use crate::quality::MergePolicy;

/// Validators sent with a revalidating request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConditionalHeaders {
    pub if_none_match: Option<String>,
    pub if_modified_since: Option<String>,
}

impl ConditionalHeaders {
    pub fn from_entry(entry: &FetchCacheEntry) -> Self {
        Self {
            if_none_match: entry.etag.clone(),
            if_modified_since: entry.last_modified.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_none_match.is_none() && self.if_modified_since.is_none()
    }
}

/// Per-request fetch settings.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub user_agent: String,
    pub conditional: ConditionalHeaders,
}

/// What the fetch engine saw on the wire.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Fetches a page, honoring the policy's timeout and validators.
///
/// Implementations return `Ok` for any HTTP status; only transport failures
/// (timeouts, connect errors) are errors.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        url: &str,
        policy: &FetchPolicy,
    ) -> impl Future<Output = Result<FetchResult, AppError>> + Send;
}

/// Interpreted robots.txt rules for one origin.
pub trait RobotsPolicy: Send + Sync {
    fn allows(&self, url: &str, user_agent: &str) -> bool;
}

/// Policy used when an origin has no robots.txt.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl RobotsPolicy for AllowAll {
    fn allows(&self, _url: &str, _user_agent: &str) -> bool {
        true
    }
}

/// Loads robots rules for an origin (`scheme://host[:port]`).
pub trait RobotsSource: Send + Sync + Clone {
    fn load(
        &self,
        origin: &str,
        user_agent: &str,
    ) -> impl Future<Output = Result<Arc<dyn RobotsPolicy>, AppError>> + Send;
}

/// Records and pagination hint extracted from one page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    pub records: Vec<RawRecord>,
    pub next_page: Option<String>,
}

/// Turns page HTML into raw records for one source.
pub trait Extractor: Send + Sync {
    fn extract(&self, url: &str, html: &str) -> Result<ExtractedPage, AppError>;

    /// Pagination bound declared by the ruleset, if any.
    fn max_pages(&self) -> Option<u32> {
        None
    }
}

/// Creates the extractor for a source from its ruleset.
pub trait ExtractorFactory: Send + Sync + Clone {
    type Extractor: Extractor;

    fn create(&self, source: &Source) -> Result<Self::Extractor, AppError>;
}

/// Field-level cleanup of raw records.
pub trait Normalizer: Send + Sync + Clone {
    fn normalize(&self, raw: RawRecord) -> Result<NormalizedRecord, AppError>;
}

/// Durable per-source job progress.
pub trait CheckpointStore: Send + Sync + Clone {
    fn load_checkpoint(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Option<Checkpoint>, AppError>> + Send;

    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Remove the checkpoint of `source_id` if one of `owners` wrote it last.
    ///
    /// A checkpoint saved since by a concurrent job of the same source stays.
    fn clear_checkpoint(
        &self,
        source_id: &str,
        owners: &[Uuid],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn list_checkpoints(&self) -> impl Future<Output = Result<Vec<Checkpoint>, AppError>> + Send;
}

/// Conditional-request state, one entry per URL.
pub trait FetchCacheStore: Send + Sync + Clone {
    fn get_cache_entry(
        &self,
        url: &str,
    ) -> impl Future<Output = Result<Option<FetchCacheEntry>, AppError>> + Send;

    fn put_cache_entry(
        &self,
        entry: &FetchCacheEntry,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Bronze layer. A snapshot is never overwritten.
pub trait SnapshotStore: Send + Sync + Clone {
    fn put_snapshot(
        &self,
        snapshot: &RawSnapshot,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Holding area for rejected records.
pub trait QuarantineSink: Send + Sync + Clone {
    fn write_quarantine(
        &self,
        records: &[QuarantinedRecord],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn list_quarantined(
        &self,
    ) -> impl Future<Output = Result<Vec<QuarantinedRecord>, AppError>> + Send;
}

/// Silver/gold partitions, run markers and sealed manifests.
pub trait PartitionWriter: Send + Sync + Clone {
    /// Write the run marker used by crash recovery.
    fn open_run(&self, run: &Run) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Append validated records to the run's silver artifact.
    fn append_silver(
        &self,
        run: &Run,
        kind: SourceKind,
        records: &[ValidatedRecord],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Upsert the run's silver records into gold, one partition at a time.
    fn merge_run(
        &self,
        run: &Run,
        policy: &MergePolicy,
    ) -> impl Future<Output = Result<Vec<PartitionSummary>, AppError>> + Send;

    /// Write manifest and metrics. Fails if the run is already sealed.
    fn seal_run(
        &self,
        manifest: &Manifest,
        metrics: &MetricsSnapshot,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Runs with a marker but no manifest.
    fn unsealed_runs(&self) -> impl Future<Output = Result<Vec<Run>, AppError>> + Send;

    /// Sealed manifests, newest first.
    fn list_manifests(&self) -> impl Future<Output = Result<Vec<Manifest>, AppError>> + Send;
}

/// Last successful run per source, for the scheduler.
pub trait ScheduleStateStore: Send + Sync + Clone {
    fn load_schedule(
        &self,
    ) -> impl Future<Output = Result<HashMap<String, DateTime<Utc>>, AppError>> + Send;

    fn save_schedule(
        &self,
        state: &HashMap<String, DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Everything the pipeline persists.
pub trait Storage:
    CheckpointStore
    + FetchCacheStore
    + SnapshotStore
    + QuarantineSink
    + PartitionWriter
    + ScheduleStateStore
    + 'static
{
}

impl<T> Storage for T where
    T: CheckpointStore
        + FetchCacheStore
        + SnapshotStore
        + QuarantineSink
        + PartitionWriter
        + ScheduleStateStore
        + 'static
{
}
