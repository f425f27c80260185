//! Validation, deduplication and merge of normalized records.

pub mod keys;
pub mod merge;
pub mod schema;
pub mod validate;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

pub use keys::{dedup_key, start_day};
pub use merge::{GoldRecord, MergeOutcome, MergePolicy};
pub use schema::SchemaSet;
pub use validate::RecordValidator;

use crate::error::AppError;
use crate::models::{
    DedupKey, NormalizedRecord, PartitionKey, QuarantinedRecord, ValidatedRecord,
};

/// Verdict on one normalized record.
#[derive(Debug, Clone)]
pub enum Admission {
    Validated(ValidatedRecord),
    Quarantined(QuarantinedRecord),
}

type PartitionIndex = Arc<tokio::sync::Mutex<HashMap<DedupKey, GoldRecord>>>;

/// Run-scoped dedup index with one lock per partition.
#[derive(Default)]
pub struct DedupIndex {
    partitions: Mutex<HashMap<PartitionKey, PartitionIndex>>,
}

impl DedupIndex {
    fn partition(&self, key: &PartitionKey) -> PartitionIndex {
        let mut partitions = match self.partitions.lock() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        partitions.entry(key.clone()).or_default().clone()
    }

    pub async fn len(&self, key: &PartitionKey) -> usize {
        self.partition(key).lock().await.len()
    }
}

/// Validates records, assigns dedup keys and merges them into the run's index.
pub struct QualityGate {
    validator: RecordValidator,
    policy: MergePolicy,
    execution_date: NaiveDate,
    index: DedupIndex,
}

impl QualityGate {
    pub fn new(schemas: &SchemaSet, policy: MergePolicy, execution_date: NaiveDate) -> Result<Self, AppError> {
        Ok(Self {
            validator: RecordValidator::new(schemas)?,
            policy,
            execution_date,
            index: DedupIndex::default(),
        })
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    pub fn admit(&self, record: NormalizedRecord, job_id: Uuid, run_id: &str) -> Admission {
        let reasons = self.validator.violations(record.kind, &record.fields);
        let now = Utc::now();
        if !reasons.is_empty() {
            let payload = serde_json::to_value(&record).unwrap_or(serde_json::Value::Null);
            return Admission::Quarantined(QuarantinedRecord {
                job_id,
                source_id: record.source_id,
                url: record.url,
                reason_codes: reasons,
                payload,
                quarantined_at: now,
            });
        }
        Admission::Validated(ValidatedRecord {
            key: dedup_key(&record),
            job_id,
            run_id: run_id.to_string(),
            observed_at: now,
            record,
        })
    }

    /// Merge a validated record into its partition of the dedup index.
    pub async fn commit(&self, record: &ValidatedRecord) -> MergeOutcome {
        let partition = PartitionKey {
            execution_date: self.execution_date,
            kind: record.record.kind,
        };
        let index = self.index.partition(&partition);
        let mut entries = index.lock().await;
        let incoming = GoldRecord::from_validated(record);
        let (merged, outcome) = self.policy.upsert(entries.get(&record.key), incoming);
        entries.insert(record.key.clone(), merged);
        outcome
    }
}

/// Reason code counts over records quarantined since `since`.
pub fn reason_histogram(
    records: &[QuarantinedRecord],
    source_id: Option<&str>,
    since: DateTime<Utc>,
) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records
        .iter()
        .filter(|r| r.quarantined_at >= since)
        .filter(|r| source_id.is_none_or(|id| r.source_id == id))
    {
        for reason in &record.reason_codes {
            *counts.entry(reason.clone()).or_insert(0) += 1;
        }
    }
    counts
}
