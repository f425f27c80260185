//! On-disk layout under the data root.
//!
//! ```text
//! checkpoints/<source_id>.json
//! cache/<sha256(url)>.json
//! bronze/<sha256(url)[..16]>/<fetched_at>.html  (+ .json metadata)
//! silver/<execution_date>/<type>/<run_id>.jsonl
//! gold/<execution_date>/<type>.jsonl  (+ .csv)
//! quarantine/<job_id>.jsonl
//! runs/<run_id>.json
//! manifests/<run_id>.json
//! metrics/<run_id>.json
//! state/schedule.json
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::compute_hash;
use harvest_core::models::SourceKind;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.root.join("checkpoints")
    }

    pub fn checkpoint(&self, source_id: &str) -> PathBuf {
        self.checkpoints_dir()
            .join(format!("{}.json", file_safe(source_id)))
    }

    pub fn cache_entry(&self, url: &str) -> PathBuf {
        self.root
            .join("cache")
            .join(format!("{}.json", compute_hash(url)))
    }

    /// Snapshot body and metadata paths.
    pub fn bronze(&self, url: &str, fetched_at: DateTime<Utc>) -> (PathBuf, PathBuf) {
        let hash = compute_hash(url);
        let dir = self.root.join("bronze").join(&hash[..16]);
        let stamp = fetched_at.format("%Y%m%dT%H%M%S%6fZ").to_string();
        (
            dir.join(format!("{stamp}.html")),
            dir.join(format!("{stamp}.json")),
        )
    }

    pub fn silver_dir(&self, execution_date: NaiveDate, kind: SourceKind) -> PathBuf {
        self.root
            .join("silver")
            .join(execution_date.to_string())
            .join(kind.as_str())
    }

    pub fn silver(&self, execution_date: NaiveDate, kind: SourceKind, run_id: &str) -> PathBuf {
        self.silver_dir(execution_date, kind)
            .join(format!("{run_id}.jsonl"))
    }

    pub fn gold(&self, execution_date: NaiveDate, kind: SourceKind) -> PathBuf {
        self.root
            .join("gold")
            .join(execution_date.to_string())
            .join(format!("{kind}.jsonl"))
    }

    pub fn gold_csv(&self, execution_date: NaiveDate, kind: SourceKind) -> PathBuf {
        self.gold(execution_date, kind).with_extension("csv")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn quarantine(&self, job_id: Uuid) -> PathBuf {
        self.quarantine_dir().join(format!("{job_id}.jsonl"))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_marker(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn manifest(&self, run_id: &str) -> PathBuf {
        self.manifests_dir().join(format!("{run_id}.json"))
    }

    pub fn metrics(&self, run_id: &str) -> PathBuf {
        self.root.join("metrics").join(format!("{run_id}.json"))
    }

    pub fn schedule(&self) -> PathBuf {
        self.root.join("state").join("schedule.json")
    }
}

/// Keep ids usable as file names on every platform.
fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
