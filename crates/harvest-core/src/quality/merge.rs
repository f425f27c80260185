use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{DedupKey, Fields, PartitionSummary, SourceKind, ValidatedRecord};

/// Durable merged listing, one per DedupKey per gold partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldRecord {
    pub key: DedupKey,
    pub kind: SourceKind,
    pub source_id: String,
    pub url: String,
    pub fields: Fields,
    /// Observation time of each field's current value.
    pub stamps: BTreeMap<String, DateTime<Utc>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub run_ids: BTreeSet<String>,
}

impl GoldRecord {
    pub fn from_validated(record: &ValidatedRecord) -> Self {
        let stamps = record
            .record
            .fields
            .keys()
            .map(|name| (name.clone(), record.observed_at))
            .collect();
        Self {
            key: record.key.clone(),
            kind: record.record.kind,
            source_id: record.record.source_id.clone(),
            url: record.record.url.clone(),
            fields: record.record.fields.clone(),
            stamps,
            first_seen_at: record.observed_at,
            last_seen_at: record.observed_at,
            run_ids: BTreeSet::from([record.run_id.clone()]),
        }
    }
}

/// Result of upserting one record into a dedup index or gold partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Merged,
    Unchanged,
}

/// Field precedence when two observations share a DedupKey.
///
/// Empty values never override non-empty ones. Between non-empty values the
/// later stamp wins, ties going to the greater canonical JSON text. Fields in
/// the first-write-wins set keep the earliest stamp instead. The result does
/// not depend on merge order or repetition.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    first_write_wins: BTreeSet<String>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            first_write_wins: BTreeSet::from(["discovered_at".to_string()]),
        }
    }
}

impl MergePolicy {
    pub fn with_first_write_wins<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            first_write_wins: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn merge(&self, a: &GoldRecord, b: &GoldRecord) -> GoldRecord {
        let names: BTreeSet<&String> = a.fields.keys().chain(b.fields.keys()).collect();

        let mut fields = Fields::new();
        let mut stamps = BTreeMap::new();
        for name in names {
            let left = observed(a, name);
            let right = observed(b, name);
            let (value, stamp) = match (left, right) {
                (Some(l), Some(r)) => {
                    if self.prefer(name, &r, &l) == Ordering::Greater {
                        r
                    } else {
                        l
                    }
                }
                (Some(only), None) | (None, Some(only)) => only,
                (None, None) => continue,
            };
            fields.insert(name.clone(), value.clone());
            stamps.insert(name.clone(), stamp);
        }

        let url = if (b.last_seen_at, &b.url) > (a.last_seen_at, &a.url) {
            b.url.clone()
        } else {
            a.url.clone()
        };

        GoldRecord {
            key: a.key.clone(),
            kind: a.kind,
            source_id: a.source_id.clone(),
            url,
            fields,
            stamps,
            first_seen_at: a.first_seen_at.min(b.first_seen_at),
            last_seen_at: a.last_seen_at.max(b.last_seen_at),
            run_ids: a.run_ids.union(&b.run_ids).cloned().collect(),
        }
    }

    /// Merge `incoming` into `existing`, reporting whether any field changed.
    pub fn upsert(
        &self,
        existing: Option<&GoldRecord>,
        incoming: GoldRecord,
    ) -> (GoldRecord, MergeOutcome) {
        match existing {
            None => (incoming, MergeOutcome::Inserted),
            Some(current) => {
                let merged = self.merge(current, &incoming);
                let outcome = if merged.fields == current.fields {
                    MergeOutcome::Unchanged
                } else {
                    MergeOutcome::Merged
                };
                (merged, outcome)
            }
        }
    }

    /// Upsert a run's silver records into one gold partition.
    pub fn merge_partition(
        &self,
        partition: String,
        gold: &mut BTreeMap<DedupKey, GoldRecord>,
        records: &[ValidatedRecord],
    ) -> PartitionSummary {
        let mut summary = PartitionSummary {
            partition,
            records_in: records.len() as u64,
            ..Default::default()
        };
        for record in records {
            let incoming = GoldRecord::from_validated(record);
            let (merged, outcome) = self.upsert(gold.get(&record.key), incoming);
            match outcome {
                MergeOutcome::Inserted => summary.inserted += 1,
                MergeOutcome::Merged => summary.merged += 1,
                MergeOutcome::Unchanged => summary.unchanged += 1,
            }
            gold.insert(record.key.clone(), merged);
        }
        summary.total = gold.len() as u64;
        summary
    }

    /// Total order over candidate values of one field; the greater wins.
    fn prefer(
        &self,
        name: &str,
        x: &(&Value, DateTime<Utc>),
        y: &(&Value, DateTime<Utc>),
    ) -> Ordering {
        let filled = |v: &Value| !is_empty(v);
        let by_fill = filled(x.0).cmp(&filled(y.0));
        let by_stamp = if self.first_write_wins.contains(name) {
            y.1.cmp(&x.1)
        } else {
            x.1.cmp(&y.1)
        };
        by_fill
            .then(by_stamp)
            .then_with(|| canonical(x.0).cmp(&canonical(y.0)))
    }
}

fn observed<'a>(record: &'a GoldRecord, name: &str) -> Option<(&'a Value, DateTime<Utc>)> {
    let value = record.fields.get(name)?;
    let stamp = record
        .stamps
        .get(name)
        .copied()
        .unwrap_or(record.last_seen_at);
    Some((value, stamp))
}

fn canonical(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

pub fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
