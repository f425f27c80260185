//! Test utilities: mock implementations of the collaborator and storage traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Value, json};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    Checkpoint, DedupKey, FetchCacheEntry, Manifest, MetricsSnapshot, NormalizedRecord,
    PartitionKey, PartitionSummary, QuarantinedRecord, RawRecord, RawSnapshot, Run, Source,
    SourceKind, ValidatedRecord,
};
use crate::quality::{GoldRecord, MergePolicy};
use crate::runner::{JobEvent, JobReporter};
use crate::traits::{
    CheckpointStore, ConditionalHeaders, ExtractedPage, Extractor, ExtractorFactory,
    FetchCacheStore, FetchPolicy, FetchResult, Fetcher, Normalizer, PartitionWriter,
    QuarantineSink, RobotsPolicy, RobotsSource, ScheduleStateStore, SnapshotStore,
};

/// Body understood by [`MockExtractor`]: `{"records": [...], "next": url}`.
pub fn listing_page(records: Value, next: Option<&str>) -> String {
    json!({"records": records, "next": next}).to_string()
}

/// Fields of a listing that passes the built-in event schema.
pub fn event_fields(title: &str, day: &str) -> Value {
    json!({
        "title": title,
        "start": format!("{day}T19:00:00Z"),
        "venue_name": "Blue Room",
        "city": "Lyon",
        "country": "FR",
    })
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher serving pages from memory.
///
/// Scripted responses for a URL are served first, then the registered page.
/// Unknown URLs answer 404. A page registered with an ETag answers 304 to a
/// matching `If-None-Match`.
#[derive(Clone, Default)]
pub struct MockFetcher {
    pages: Arc<Mutex<HashMap<String, FetchResult>>>,
    scripted: Arc<Mutex<HashMap<String, VecDeque<Result<FetchResult, AppError>>>>>,
    hanging: Arc<Mutex<HashSet<String>>>,
    calls: Arc<Mutex<Vec<(String, ConditionalHeaders)>>>,
    hung: Arc<Notify>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(&self, url: &str, body: impl Into<String>) -> &Self {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            FetchResult {
                status: 200,
                body: body.into(),
                ..Default::default()
            },
        );
        self
    }

    pub fn page_with_etag(&self, url: &str, body: impl Into<String>, etag: &str) -> &Self {
        self.pages.lock().unwrap().insert(
            url.to_string(),
            FetchResult {
                status: 200,
                body: body.into(),
                etag: Some(etag.to_string()),
                ..Default::default()
            },
        );
        self
    }

    pub fn push(&self, url: &str, response: Result<FetchResult, AppError>) -> &Self {
        self.scripted
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn status(&self, url: &str, status: u16) -> &Self {
        self.push(
            url,
            Ok(FetchResult {
                status,
                ..Default::default()
            }),
        )
    }

    /// Requests for `url` never complete.
    pub fn hang(&self, url: &str) -> &Self {
        self.hanging.lock().unwrap().insert(url.to_string());
        self
    }

    pub fn unhang(&self, url: &str) {
        self.hanging.lock().unwrap().remove(url);
    }

    /// Notified when a request reaches a hanging URL.
    pub fn hung(&self) -> Arc<Notify> {
        self.hung.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(url, _)| url.clone())
            .collect()
    }

    pub fn conditional_calls(&self) -> Vec<(String, ConditionalHeaders)> {
        self.calls.lock().unwrap().clone()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, url: &str, policy: &FetchPolicy) -> Result<FetchResult, AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), policy.conditional.clone()));

        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(url)
            .and_then(|queue| queue.pop_front());
        if let Some(response) = scripted {
            return response;
        }

        if self.hanging.lock().unwrap().contains(url) {
            self.hung.notify_one();
            std::future::pending::<()>().await;
        }

        let page = self.pages.lock().unwrap().get(url).cloned();
        match page {
            Some(page) => {
                if page.etag.is_some() && page.etag == policy.conditional.if_none_match {
                    return Ok(FetchResult {
                        status: 304,
                        etag: page.etag,
                        ..Default::default()
                    });
                }
                Ok(page)
            }
            None => Ok(FetchResult {
                status: 404,
                ..Default::default()
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// MockRobots
// ---------------------------------------------------------------------------

struct PrefixPolicy {
    disallowed: Vec<String>,
}

impl RobotsPolicy for PrefixPolicy {
    fn allows(&self, url: &str, _user_agent: &str) -> bool {
        !self.disallowed.iter().any(|prefix| url.starts_with(prefix))
    }
}

/// Mock robots source disallowing URL prefixes; counts loads.
#[derive(Clone, Default)]
pub struct MockRobots {
    disallowed: Arc<Vec<String>>,
    loads: Arc<AtomicUsize>,
    fail: bool,
}

impl MockRobots {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn disallow(prefixes: &[&str]) -> Self {
        Self {
            disallowed: Arc::new(prefixes.iter().map(|p| p.to_string()).collect()),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl RobotsSource for MockRobots {
    async fn load(
        &self,
        _origin: &str,
        _user_agent: &str,
    ) -> Result<Arc<dyn RobotsPolicy>, AppError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(AppError::NetworkError("robots unreachable".into()));
        }
        Ok(Arc::new(PrefixPolicy {
            disallowed: self.disallowed.as_ref().clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Mock extractor reading bodies produced by [`listing_page`].
pub struct MockExtractor {
    source_id: String,
    kind: SourceKind,
}

impl Extractor for MockExtractor {
    fn extract(&self, url: &str, html: &str) -> Result<ExtractedPage, AppError> {
        let body: Value = serde_json::from_str(html)
            .map_err(|e| AppError::ExtractionError(format!("unparseable page: {e}")))?;
        let records = body["records"]
            .as_array()
            .ok_or_else(|| AppError::ExtractionError("no records array".into()))?
            .iter()
            .filter_map(|item| item.as_object().cloned())
            .map(|fields| RawRecord {
                source_id: self.source_id.clone(),
                kind: self.kind,
                url: url.to_string(),
                fields,
            })
            .collect();
        Ok(ExtractedPage {
            records,
            next_page: body["next"].as_str().map(str::to_string),
        })
    }
}

#[derive(Clone, Default)]
pub struct MockExtractorFactory {
    failing: Arc<Mutex<HashSet<String>>>,
    panicking: Arc<Mutex<HashSet<String>>>,
}

impl MockExtractorFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, source_id: &str) {
        self.failing.lock().unwrap().insert(source_id.to_string());
    }

    /// Panic instead of returning an extractor for `source_id`.
    pub fn panic_for(&self, source_id: &str) {
        self.panicking.lock().unwrap().insert(source_id.to_string());
    }
}

impl ExtractorFactory for MockExtractorFactory {
    type Extractor = MockExtractor;

    fn create(&self, source: &Source) -> Result<MockExtractor, AppError> {
        if self.panicking.lock().unwrap().contains(&source.source_id) {
            panic!("extractor for {} blew up", source.source_id);
        }
        if self.failing.lock().unwrap().contains(&source.source_id) {
            return Err(AppError::ConfigError(format!(
                "no ruleset for {}",
                source.source_id
            )));
        }
        Ok(MockExtractor {
            source_id: source.source_id.clone(),
            kind: source.kind,
        })
    }
}

// ---------------------------------------------------------------------------
// MockNormalizer
// ---------------------------------------------------------------------------

/// Passes fields through unchanged.
#[derive(Clone, Default)]
pub struct MockNormalizer;

impl Normalizer for MockNormalizer {
    fn normalize(&self, raw: RawRecord) -> Result<NormalizedRecord, AppError> {
        Ok(NormalizedRecord {
            source_id: raw.source_id,
            kind: raw.kind,
            url: raw.url,
            fields: raw.fields,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    checkpoints: HashMap<String, Checkpoint>,
    checkpoint_log: Vec<Checkpoint>,
    cache: HashMap<String, FetchCacheEntry>,
    snapshots: Vec<RawSnapshot>,
    quarantine: Vec<QuarantinedRecord>,
    runs: BTreeMap<String, Run>,
    silver: BTreeMap<(NaiveDate, SourceKind, String), Vec<ValidatedRecord>>,
    gold: BTreeMap<PartitionKey, BTreeMap<DedupKey, GoldRecord>>,
    manifests: BTreeMap<String, (Manifest, MetricsSnapshot)>,
    schedule: HashMap<String, DateTime<Utc>>,
}

/// In-memory implementation of every storage trait.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    fail_silver: Arc<Mutex<bool>>,
    failing_opens: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_silver_writes(&self, fail: bool) {
        *self.fail_silver.lock().unwrap() = fail;
    }

    /// Make the next `count` calls to `open_run` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn checkpoint(&self, source_id: &str) -> Option<Checkpoint> {
        self.state.lock().unwrap().checkpoints.get(source_id).cloned()
    }

    /// Every checkpoint ever saved, in order.
    pub fn checkpoint_log(&self) -> Vec<Checkpoint> {
        self.state.lock().unwrap().checkpoint_log.clone()
    }

    pub fn cache_entry(&self, url: &str) -> Option<FetchCacheEntry> {
        self.state.lock().unwrap().cache.get(url).cloned()
    }

    pub fn snapshots(&self) -> Vec<RawSnapshot> {
        self.state.lock().unwrap().snapshots.clone()
    }

    pub fn quarantined(&self) -> Vec<QuarantinedRecord> {
        self.state.lock().unwrap().quarantine.clone()
    }

    pub fn silver(&self, run_id: &str) -> Vec<ValidatedRecord> {
        self.state
            .lock()
            .unwrap()
            .silver
            .iter()
            .filter(|((_, _, id), _)| id == run_id)
            .flat_map(|(_, records)| records.clone())
            .collect()
    }

    pub fn gold(&self, execution_date: NaiveDate, kind: SourceKind) -> Vec<GoldRecord> {
        let key = PartitionKey {
            execution_date,
            kind,
        };
        self.state
            .lock()
            .unwrap()
            .gold
            .get(&key)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn manifest(&self, run_id: &str) -> Option<Manifest> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(run_id)
            .map(|(m, _)| m.clone())
    }

    pub fn metrics(&self, run_id: &str) -> Option<MetricsSnapshot> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(run_id)
            .map(|(_, m)| m.clone())
    }
}

impl CheckpointStore for MemoryStore {
    async fn load_checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>, AppError> {
        Ok(self.checkpoint(source_id))
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        state
            .checkpoints
            .insert(checkpoint.source_id.clone(), checkpoint.clone());
        state.checkpoint_log.push(checkpoint.clone());
        Ok(())
    }

    async fn clear_checkpoint(&self, source_id: &str, owners: &[Uuid]) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state
            .checkpoints
            .get(source_id)
            .is_some_and(|c| owners.contains(&c.job_id))
        {
            state.checkpoints.remove(source_id);
        }
        Ok(())
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .checkpoints
            .values()
            .cloned()
            .collect())
    }
}

impl FetchCacheStore for MemoryStore {
    async fn get_cache_entry(&self, url: &str) -> Result<Option<FetchCacheEntry>, AppError> {
        Ok(self.cache_entry(url))
    }

    async fn put_cache_entry(&self, entry: &FetchCacheEntry) -> Result<(), AppError> {
        self.state
            .lock()
            .unwrap()
            .cache
            .insert(entry.url.clone(), entry.clone());
        Ok(())
    }
}

impl SnapshotStore for MemoryStore {
    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let exists = state
            .snapshots
            .iter()
            .any(|s| s.url == snapshot.url && s.fetched_at == snapshot.fetched_at);
        if exists {
            return Err(AppError::StorageError("snapshot already exists".into()));
        }
        state.snapshots.push(snapshot.clone());
        Ok(())
    }
}

impl QuarantineSink for MemoryStore {
    async fn write_quarantine(&self, records: &[QuarantinedRecord]) -> Result<(), AppError> {
        self.state
            .lock()
            .unwrap()
            .quarantine
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn list_quarantined(&self) -> Result<Vec<QuarantinedRecord>, AppError> {
        Ok(self.quarantined())
    }
}

impl PartitionWriter for MemoryStore {
    async fn open_run(&self, run: &Run) -> Result<(), AppError> {
        let failing = self.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(AppError::StorageError("run marker not writable".into()));
        }
        self.state
            .lock()
            .unwrap()
            .runs
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn append_silver(
        &self,
        run: &Run,
        kind: SourceKind,
        records: &[ValidatedRecord],
    ) -> Result<(), AppError> {
        if *self.fail_silver.lock().unwrap() {
            return Err(AppError::StorageError("silver write failed".into()));
        }
        self.state
            .lock()
            .unwrap()
            .silver
            .entry((run.execution_date, kind, run.run_id.clone()))
            .or_default()
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn merge_run(
        &self,
        run: &Run,
        policy: &MergePolicy,
    ) -> Result<Vec<PartitionSummary>, AppError> {
        let mut state = self.state.lock().unwrap();
        let batches: Vec<(SourceKind, Vec<ValidatedRecord>)> = state
            .silver
            .iter()
            .filter(|((date, _, id), _)| *date == run.execution_date && *id == run.run_id)
            .map(|((_, kind, _), records)| (*kind, records.clone()))
            .collect();

        let mut summaries = Vec::new();
        for (kind, records) in batches {
            let key = PartitionKey {
                execution_date: run.execution_date,
                kind,
            };
            let gold = state.gold.entry(key.clone()).or_default();
            summaries.push(policy.merge_partition(key.to_string(), gold, &records));
        }
        Ok(summaries)
    }

    async fn seal_run(
        &self,
        manifest: &Manifest,
        metrics: &MetricsSnapshot,
    ) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        if state.manifests.contains_key(&manifest.run_id) {
            return Err(AppError::StorageError(format!(
                "run {} already sealed",
                manifest.run_id
            )));
        }
        state
            .manifests
            .insert(manifest.run_id.clone(), (manifest.clone(), metrics.clone()));
        Ok(())
    }

    async fn unsealed_runs(&self) -> Result<Vec<Run>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .values()
            .filter(|run| !state.manifests.contains_key(&run.run_id))
            .cloned()
            .collect())
    }

    async fn list_manifests(&self) -> Result<Vec<Manifest>, AppError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .manifests
            .values()
            .rev()
            .map(|(m, _)| m.clone())
            .collect())
    }
}

impl ScheduleStateStore for MemoryStore {
    async fn load_schedule(&self) -> Result<HashMap<String, DateTime<Utc>>, AppError> {
        Ok(self.state.lock().unwrap().schedule.clone())
    }

    async fn save_schedule(&self, state: &HashMap<String, DateTime<Utc>>) -> Result<(), AppError> {
        self.state.lock().unwrap().schedule = state.clone();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records every job event.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl JobReporter for RecordingReporter {
    fn report(&self, event: &JobEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
