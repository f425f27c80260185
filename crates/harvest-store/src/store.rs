use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::AppError;
use harvest_core::models::{
    Checkpoint, DedupKey, FetchCacheEntry, Manifest, MetricsSnapshot, PartitionKey,
    PartitionSummary, QuarantinedRecord, RawSnapshot, Run, SourceKind, ValidatedRecord,
};
use harvest_core::quality::{GoldRecord, MergePolicy};
use harvest_core::traits::{
    CheckpointStore, FetchCacheStore, PartitionWriter, QuarantineSink, ScheduleStateStore,
    SnapshotStore,
};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::fs;
use crate::layout::Layout;

/// Filesystem implementation of every storage trait.
///
/// Clones share the per-path lock table, so concurrent jobs in one process
/// never interleave writes to the same silver, gold or quarantine file.
#[derive(Clone)]
pub struct FsStore {
    layout: Layout,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            layout: Layout::new(root),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.data_root.clone())
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            table.entry(path.to_path_buf()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Current gold records of one partition.
    pub async fn read_gold(
        &self,
        execution_date: NaiveDate,
        kind: SourceKind,
    ) -> Result<Vec<GoldRecord>, AppError> {
        fs::read_jsonl(&self.layout.gold(execution_date, kind)).await
    }

    /// Silver records one run appended for one type.
    pub async fn read_silver(
        &self,
        run: &Run,
        kind: SourceKind,
    ) -> Result<Vec<ValidatedRecord>, AppError> {
        fs::read_jsonl(&self.layout.silver(run.execution_date, kind, &run.run_id)).await
    }

    pub async fn read_metrics(&self, run_id: &str) -> Result<Option<MetricsSnapshot>, AppError> {
        fs::read_json(&self.layout.metrics(run_id)).await
    }

    async fn merge_partition(
        &self,
        run: &Run,
        kind: SourceKind,
        policy: &MergePolicy,
    ) -> Result<Option<PartitionSummary>, AppError> {
        let silver: Vec<ValidatedRecord> = self.read_silver(run, kind).await?;
        if silver.is_empty() {
            return Ok(None);
        }

        let gold_path = self.layout.gold(run.execution_date, kind);
        let _guard = self.lock(&gold_path).await;

        let mut gold: BTreeMap<DedupKey, GoldRecord> = fs::read_jsonl::<GoldRecord>(&gold_path)
            .await?
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        let partition = PartitionKey {
            execution_date: run.execution_date,
            kind,
        };
        let summary = policy.merge_partition(partition.to_string(), &mut gold, &silver);

        let records: Vec<&GoldRecord> = gold.values().collect();
        let mut jsonl = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut jsonl, record)?;
            jsonl.push(b'\n');
        }
        fs::write_atomic(&gold_path, &jsonl).await?;
        fs::write_atomic(
            &self.layout.gold_csv(run.execution_date, kind),
            &gold_csv(&records)?,
        )
        .await?;

        debug!(
            partition = %summary.partition,
            inserted = summary.inserted,
            merged = summary.merged,
            unchanged = summary.unchanged,
            "Merged partition"
        );
        Ok(Some(summary))
    }
}

/// Flat export: fixed columns, then one column per field name.
fn gold_csv(records: &[&GoldRecord]) -> Result<Vec<u8>, AppError> {
    let field_names: BTreeSet<&str> = records
        .iter()
        .flat_map(|r| r.fields.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_error = |e: csv::Error| AppError::StorageError(format!("CSV export: {e}"));

    let mut header = vec![
        "dedup_key",
        "type",
        "source_id",
        "url",
        "first_seen_at",
        "last_seen_at",
        "run_ids",
    ];
    header.extend(field_names.iter().copied());
    writer.write_record(&header).map_err(csv_error)?;

    for record in records {
        let mut row = vec![
            record.key.to_string(),
            record.kind.to_string(),
            record.source_id.clone(),
            record.url.clone(),
            record.first_seen_at.to_rfc3339(),
            record.last_seen_at.to_rfc3339(),
            record.run_ids.iter().cloned().collect::<Vec<_>>().join(";"),
        ];
        row.extend(
            field_names
                .iter()
                .map(|name| record.fields.get(*name).map(cell).unwrap_or_default()),
        );
        writer.write_record(&row).map_err(csv_error)?;
    }

    writer
        .into_inner()
        .map_err(|e| AppError::StorageError(format!("CSV export: {e}")))
}

fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) if items.iter().all(Value::is_string) => items
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    }
}

impl CheckpointStore for FsStore {
    async fn load_checkpoint(&self, source_id: &str) -> Result<Option<Checkpoint>, AppError> {
        fs::read_json(&self.layout.checkpoint(source_id)).await
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), AppError> {
        let path = self.layout.checkpoint(&checkpoint.source_id);
        let _guard = self.lock(&path).await;
        fs::write_json_atomic(&path, checkpoint).await
    }

    async fn clear_checkpoint(&self, source_id: &str, owners: &[Uuid]) -> Result<(), AppError> {
        let path = self.layout.checkpoint(source_id);
        let _guard = self.lock(&path).await;
        match fs::read_json::<Checkpoint>(&path).await? {
            Some(current) if !owners.contains(&current.job_id) => {
                debug!(%source_id, job_id = %current.job_id, "Checkpoint owned by another job");
                Ok(())
            }
            Some(_) => fs::remove_if_exists(&path).await,
            None => Ok(()),
        }
    }

    async fn list_checkpoints(&self) -> Result<Vec<Checkpoint>, AppError> {
        let mut checkpoints = Vec::new();
        for path in fs::list_files(&self.layout.checkpoints_dir(), "json").await? {
            if let Some(checkpoint) = fs::read_json::<Checkpoint>(&path).await? {
                checkpoints.push(checkpoint);
            }
        }
        checkpoints.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        Ok(checkpoints)
    }
}

impl FetchCacheStore for FsStore {
    async fn get_cache_entry(&self, url: &str) -> Result<Option<FetchCacheEntry>, AppError> {
        fs::read_json(&self.layout.cache_entry(url)).await
    }

    async fn put_cache_entry(&self, entry: &FetchCacheEntry) -> Result<(), AppError> {
        fs::write_json_atomic(&self.layout.cache_entry(&entry.url), entry).await
    }
}

impl SnapshotStore for FsStore {
    async fn put_snapshot(&self, snapshot: &RawSnapshot) -> Result<(), AppError> {
        let (body_path, meta_path) = self.layout.bronze(&snapshot.url, snapshot.fetched_at);
        if !fs::write_new(&body_path, snapshot.body.as_bytes()).await? {
            return Err(AppError::StorageError(format!(
                "Snapshot already exists: {}",
                body_path.display()
            )));
        }
        let meta = serde_json::to_vec_pretty(snapshot)?;
        fs::write_new(&meta_path, &meta).await?;
        Ok(())
    }
}

impl QuarantineSink for FsStore {
    async fn write_quarantine(&self, records: &[QuarantinedRecord]) -> Result<(), AppError> {
        let mut by_job: BTreeMap<Uuid, Vec<&QuarantinedRecord>> = BTreeMap::new();
        for record in records {
            by_job.entry(record.job_id).or_default().push(record);
        }
        for (job_id, batch) in by_job {
            let path = self.layout.quarantine(job_id);
            let _guard = self.lock(&path).await;
            fs::append_jsonl(&path, &batch).await?;
        }
        Ok(())
    }

    async fn list_quarantined(&self) -> Result<Vec<QuarantinedRecord>, AppError> {
        let mut records = Vec::new();
        for path in fs::list_files(&self.layout.quarantine_dir(), "jsonl").await? {
            records.extend(fs::read_jsonl::<QuarantinedRecord>(&path).await?);
        }
        records.sort_by_key(|r| r.quarantined_at);
        Ok(records)
    }
}

impl PartitionWriter for FsStore {
    async fn open_run(&self, run: &Run) -> Result<(), AppError> {
        fs::write_json_atomic(&self.layout.run_marker(&run.run_id), run).await
    }

    async fn append_silver(
        &self,
        run: &Run,
        kind: SourceKind,
        records: &[ValidatedRecord],
    ) -> Result<(), AppError> {
        let path = self.layout.silver(run.execution_date, kind, &run.run_id);
        let _guard = self.lock(&path).await;
        fs::append_jsonl(&path, records).await
    }

    async fn merge_run(
        &self,
        run: &Run,
        policy: &MergePolicy,
    ) -> Result<Vec<PartitionSummary>, AppError> {
        let mut summaries = Vec::new();
        for kind in SourceKind::ALL {
            if let Some(summary) = self.merge_partition(run, kind, policy).await? {
                summaries.push(summary);
            }
        }
        Ok(summaries)
    }

    async fn seal_run(
        &self,
        manifest: &Manifest,
        metrics: &MetricsSnapshot,
    ) -> Result<(), AppError> {
        let manifest_path = self.layout.manifest(&manifest.run_id);
        if tokio::fs::try_exists(&manifest_path)
            .await
            .map_err(|e| fs::io_error(&manifest_path, e))?
        {
            return Err(AppError::StorageError(format!(
                "Run {} already sealed",
                manifest.run_id
            )));
        }

        let metrics_path = self.layout.metrics(&manifest.run_id);
        if !fs::write_new(&metrics_path, &serde_json::to_vec_pretty(metrics)?).await? {
            warn!(run_id = %manifest.run_id, "Metrics already written by an interrupted seal");
        }
        if !fs::write_new(&manifest_path, &serde_json::to_vec_pretty(manifest)?).await? {
            return Err(AppError::StorageError(format!(
                "Run {} already sealed",
                manifest.run_id
            )));
        }

        let sealed = Run {
            run_id: manifest.run_id.clone(),
            execution_date: manifest.execution_date,
            started_at: manifest.started_at,
            ended_at: Some(manifest.ended_at),
            exit_code: Some(manifest.exit_code),
        };
        fs::write_json_atomic(&self.layout.run_marker(&manifest.run_id), &sealed).await?;
        info!(run_id = %manifest.run_id, exit_code = manifest.exit_code, "Run sealed");
        Ok(())
    }

    async fn unsealed_runs(&self) -> Result<Vec<Run>, AppError> {
        let mut runs = Vec::new();
        for path in fs::list_files(&self.layout.runs_dir(), "json").await? {
            let Some(run) = fs::read_json::<Run>(&path).await? else {
                continue;
            };
            let manifest = self.layout.manifest(&run.run_id);
            let sealed = tokio::fs::try_exists(&manifest)
                .await
                .map_err(|e| fs::io_error(&manifest, e))?;
            if !sealed {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    async fn list_manifests(&self) -> Result<Vec<Manifest>, AppError> {
        let mut manifests = Vec::new();
        for path in fs::list_files(&self.layout.manifests_dir(), "json").await? {
            if let Some(manifest) = fs::read_json::<Manifest>(&path).await? {
                manifests.push(manifest);
            }
        }
        manifests.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        Ok(manifests)
    }
}

impl ScheduleStateStore for FsStore {
    async fn load_schedule(&self) -> Result<HashMap<String, DateTime<Utc>>, AppError> {
        Ok(fs::read_json(&self.layout.schedule())
            .await?
            .unwrap_or_default())
    }

    async fn save_schedule(&self, state: &HashMap<String, DateTime<Utc>>) -> Result<(), AppError> {
        let ordered: BTreeMap<&String, &DateTime<Utc>> = state.iter().collect();
        fs::write_json_atomic(&self.layout.schedule(), &ordered).await
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use harvest_core::models::{NormalizedRecord, PageCursor};
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
    }

    fn validated(run: &Run, key: &str, fields: Value, observed_at: DateTime<Utc>) -> ValidatedRecord {
        ValidatedRecord {
            key: DedupKey(key.into()),
            job_id: Uuid::new_v4(),
            run_id: run.run_id.clone(),
            observed_at,
            record: NormalizedRecord {
                source_id: "city_events_demo".into(),
                kind: SourceKind::Events,
                url: "https://events.example.com/list".into(),
                fields: fields.as_object().cloned().unwrap(),
            },
        }
    }

    fn manifest(run: &Run, exit_code: i32) -> Manifest {
        Manifest {
            run_id: run.run_id.clone(),
            execution_date: run.execution_date,
            started_at: run.started_at,
            ended_at: Utc::now(),
            exit_code,
            counts_by_stage: BTreeMap::new(),
            partitions_touched: Vec::new(),
            jobs: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_checkpoint_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let checkpoint = Checkpoint {
            source_id: "city_events_demo".into(),
            run_id: "r1".into(),
            job_id: Uuid::new_v4(),
            cursor: PageCursor {
                page_index: 3,
                url: "https://events.example.com/list?page=4".into(),
            },
            pages_fetched: 3,
            updated_at: Utc::now(),
        };

        store.save_checkpoint(&checkpoint).await.unwrap();
        assert_eq!(
            store.load_checkpoint("city_events_demo").await.unwrap(),
            Some(checkpoint.clone())
        );
        assert_eq!(store.list_checkpoints().await.unwrap().len(), 1);

        // A concurrent job of the same source does not erase this cursor.
        store
            .clear_checkpoint("city_events_demo", &[Uuid::new_v4()])
            .await
            .unwrap();
        assert!(store.load_checkpoint("city_events_demo").await.unwrap().is_some());

        store
            .clear_checkpoint("city_events_demo", &[checkpoint.job_id])
            .await
            .unwrap();
        assert!(store.load_checkpoint("city_events_demo").await.unwrap().is_none());
        store
            .clear_checkpoint("city_events_demo", &[checkpoint.job_id])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_is_never_overwritten() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let snapshot = RawSnapshot {
            url: "https://events.example.com/list".into(),
            fetched_at: Utc::now(),
            status: 200,
            headers: BTreeMap::new(),
            content_hash: "abc".into(),
            body: "<html></html>".into(),
        };

        store.put_snapshot(&snapshot).await.unwrap();
        let again = store.put_snapshot(&snapshot).await;
        assert!(matches!(again, Err(AppError::StorageError(_))));

        let (body, meta) = store.layout().bronze(&snapshot.url, snapshot.fetched_at);
        assert_eq!(std::fs::read_to_string(body).unwrap(), "<html></html>");
        let meta: Value = serde_json::from_slice(&std::fs::read(meta).unwrap()).unwrap();
        assert_eq!(meta["status"], 200);
        assert!(meta.get("body").is_none());
    }

    #[tokio::test]
    async fn test_merge_run_upserts_gold_and_exports_csv() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let policy = MergePolicy::default();
        let t0 = Utc::now();

        let first = Run::open(Some(day()));
        store
            .append_silver(
                &first,
                SourceKind::Events,
                &[
                    validated(&first, "k1", json!({"title": "Jazz Night", "price_text": ""}), t0),
                    validated(&first, "k2", json!({"title": "Folk Evening"}), t0),
                ],
            )
            .await
            .unwrap();
        let summaries = store.merge_run(&first, &policy).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].partition, "2026-07-01/events");
        assert_eq!(summaries[0].inserted, 2);

        let second = Run::open(Some(day()));
        store
            .append_silver(
                &second,
                SourceKind::Events,
                &[validated(
                    &second,
                    "k1",
                    json!({"title": "Jazz Night", "price_text": "12 EUR"}),
                    t0 + Duration::seconds(5),
                )],
            )
            .await
            .unwrap();
        let summaries = store.merge_run(&second, &policy).await.unwrap();
        assert_eq!(summaries[0].merged, 1);
        assert_eq!(summaries[0].total, 2);

        let gold = store.read_gold(day(), SourceKind::Events).await.unwrap();
        assert_eq!(gold.len(), 2);
        let jazz = gold.iter().find(|r| r.key.as_str() == "k1").unwrap();
        assert_eq!(jazz.fields["price_text"], "12 EUR");
        assert_eq!(jazz.run_ids.len(), 2);

        let csv = std::fs::read_to_string(store.layout().gold_csv(day(), SourceKind::Events)).unwrap();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "dedup_key,type,source_id,url,first_seen_at,last_seen_at,run_ids,price_text,title"
        );
        assert_eq!(lines.count(), 2);
    }

    #[tokio::test]
    async fn test_merging_a_run_twice_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let policy = MergePolicy::default();
        let run = Run::open(Some(day()));
        store
            .append_silver(
                &run,
                SourceKind::Events,
                &[validated(&run, "k1", json!({"title": "Jazz Night"}), Utc::now())],
            )
            .await
            .unwrap();

        store.merge_run(&run, &policy).await.unwrap();
        let before = store.read_gold(day(), SourceKind::Events).await.unwrap();
        let summaries = store.merge_run(&run, &policy).await.unwrap();
        let after = store.read_gold(day(), SourceKind::Events).await.unwrap();

        assert_eq!(summaries[0].unchanged, 1);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_seal_marks_run_and_refuses_twice() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let run = Run::open(Some(day()));
        store.open_run(&run).await.unwrap();
        assert_eq!(store.unsealed_runs().await.unwrap(), vec![run.clone()]);

        let metrics = MetricsSnapshot {
            run_id: run.run_id.clone(),
            fetched: 3,
            ..Default::default()
        };
        store.seal_run(&manifest(&run, 0), &metrics).await.unwrap();
        assert!(store.unsealed_runs().await.unwrap().is_empty());
        assert_eq!(store.read_metrics(&run.run_id).await.unwrap().unwrap().fetched, 3);

        let again = store.seal_run(&manifest(&run, 1), &metrics).await;
        assert!(matches!(again, Err(AppError::StorageError(_))));
        assert_eq!(store.list_manifests().await.unwrap()[0].exit_code, 0);
    }

    #[tokio::test]
    async fn test_manifests_are_listed_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let older = Run::open(Some(day()));
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newer = Run::open(Some(day()));

        for run in [&older, &newer] {
            store
                .seal_run(&manifest(run, 0), &MetricsSnapshot::default())
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list_manifests()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.run_id)
            .collect();
        assert_eq!(ids, vec![newer.run_id, older.run_id]);
    }

    #[tokio::test]
    async fn test_quarantine_is_grouped_per_job() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        let job_a = Uuid::new_v4();
        let job_b = Uuid::new_v4();
        let record = |job_id: Uuid, reason: &str| QuarantinedRecord {
            job_id,
            source_id: "city_events_demo".into(),
            url: "https://events.example.com/list".into(),
            reason_codes: vec![reason.into()],
            payload: json!({"title": "Jazz Night"}),
            quarantined_at: Utc::now(),
        };

        store
            .write_quarantine(&[
                record(job_a, "missing_required_field:country"),
                record(job_b, "http_status:404"),
                record(job_a, "invalid_value:country"),
            ])
            .await
            .unwrap();

        assert!(store.layout().quarantine(job_a).exists());
        assert!(store.layout().quarantine(job_b).exists());
        assert_eq!(store.list_quarantined().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_schedule_round_trips() {
        let tmp = TempDir::new().unwrap();
        let store = FsStore::new(tmp.path());
        assert!(store.load_schedule().await.unwrap().is_empty());

        let mut state = HashMap::new();
        state.insert("city_events_demo".to_string(), Utc::now());
        store.save_schedule(&state).await.unwrap();
        assert_eq!(store.load_schedule().await.unwrap(), state);
    }

    #[test]
    fn test_csv_cells() {
        assert_eq!(cell(&json!("x")), "x");
        assert_eq!(cell(&json!(["a", "b"])), "a; b");
        assert_eq!(cell(&json!(12.5)), "12.5");
        assert_eq!(cell(&Value::Null), "");
    }
}
