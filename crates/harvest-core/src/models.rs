use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

/// Run finished with every job completed.
pub const EXIT_OK: i32 = 0;
/// At least one job failed, or the run could not be merged.
pub const EXIT_FAILED: i32 = 1;
/// Run crashed before sealing and was sealed by startup recovery.
pub const EXIT_RECOVERED: i32 = 2;
/// Run was interrupted by a cancellation signal.
pub const EXIT_INTERRUPTED: i32 = 130;

/// JSON field map carried by raw, normalized and merged records.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Category of listings a source publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Events,
    Festivals,
    Sports,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [SourceKind::Events, SourceKind::Festivals, SourceKind::Sports];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Events => "events",
            SourceKind::Festivals => "festivals",
            SourceKind::Sports => "sports",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "events" => Ok(SourceKind::Events),
            "festivals" => Ok(SourceKind::Festivals),
            "sports" => Ok(SourceKind::Sports),
            _ => Err(format!("Unknown source type: {s}")),
        }
    }
}

/// Slowest rate a source may be limited to, in requests per second.
pub const MIN_QPS: f64 = 0.001;

/// A registered crawl source. Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub source_id: String,
    pub base_url: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub qps_limit: f64,
    pub concurrency_limit: u32,
    pub enabled: bool,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(default)]
    pub rules_path: Option<String>,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl Source {
    pub fn new(source_id: impl Into<String>, base_url: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            source_id: source_id.into(),
            base_url: base_url.into(),
            kind,
            qps_limit: 1.0,
            concurrency_limit: 1,
            enabled: true,
            interval: Duration::from_secs(24 * 60 * 60),
            rules_path: None,
            max_pages: None,
        }
    }

    pub fn with_limits(mut self, qps_limit: f64, concurrency_limit: u32) -> Self {
        self.qps_limit = qps_limit;
        self.concurrency_limit = concurrency_limit;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    pub fn with_rules_path(mut self, path: impl Into<String>) -> Self {
        self.rules_path = Some(path.into());
        self
    }
}

/// Parse a re-crawl cadence: `hourly|daily|weekly|monthly` or `<n>{s,m,h,d}`.
pub fn parse_interval(raw: &str) -> Result<Duration, AppError> {
    let value = raw.trim().to_lowercase();
    let secs = match value.as_str() {
        "hourly" => 60 * 60,
        "daily" => 24 * 60 * 60,
        "weekly" => 7 * 24 * 60 * 60,
        "monthly" => 30 * 24 * 60 * 60,
        _ => {
            let split = value
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(value.len());
            let (digits, unit) = value.split_at(split);
            let n: u64 = digits
                .parse()
                .map_err(|_| AppError::RegistryError(format!("Invalid interval '{raw}'")))?;
            let factor = match unit {
                "" | "s" => 1,
                "m" => 60,
                "h" => 60 * 60,
                "d" => 24 * 60 * 60,
                _ => {
                    return Err(AppError::RegistryError(format!(
                        "Invalid interval unit in '{raw}'"
                    )));
                }
            };
            n.checked_mul(factor).ok_or_else(|| {
                AppError::RegistryError(format!("Interval '{raw}' is too long"))
            })?
        }
    };
    if secs == 0 {
        return Err(AppError::RegistryError(format!(
            "Interval must be positive, got '{raw}'"
        )));
    }
    Ok(Duration::from_secs(secs))
}

/// One invocation of the crawl command or one scheduler tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub execution_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl Run {
    /// Open a new run. Run ids sort by start time.
    pub fn open(execution_date: Option<NaiveDate>) -> Self {
        let started_at = Utc::now();
        let suffix = Uuid::new_v4().simple().to_string();
        Self {
            run_id: format!("{}-{}", started_at.format("%Y%m%dT%H%M%S%6f"), &suffix[..8]),
            execution_date: execution_date.unwrap_or_else(|| started_at.date_naive()),
            started_at,
            ended_at: None,
            exit_code: None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.ended_at.is_some() && self.exit_code.is_some()
    }
}

/// Position of the next page a job will process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    pub page_index: u32,
    pub url: String,
}

impl PageCursor {
    pub fn start(url: impl Into<String>) -> Self {
        Self {
            page_index: 0,
            url: url.into(),
        }
    }

    /// Cursor for the page after this one. Indices only move forward.
    pub fn advance(&self, next_url: impl Into<String>) -> Self {
        Self {
            page_index: self.page_index + 1,
            url: next_url.into(),
        }
    }
}

/// Durable snapshot of a job's progress, keyed by `source_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub run_id: String,
    pub job_id: Uuid,
    pub cursor: PageCursor,
    pub pages_fetched: u32,
    pub updated_at: DateTime<Utc>,
}

/// Conditional-request state for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchCacheEntry {
    pub url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
    /// Pagination hint recorded after the page was last extracted.
    #[serde(default)]
    pub next_page: Option<String>,
}

/// Immutable bronze capture of a fetched page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub content_hash: String,
    #[serde(skip)]
    pub body: String,
}

/// Candidate record straight out of extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_id: String,
    pub kind: SourceKind,
    pub url: String,
    pub fields: Fields,
}

/// Candidate record after field-level normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub source_id: String,
    pub kind: SourceKind,
    pub url: String,
    pub fields: Fields,
}

impl NormalizedRecord {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(|v| v.as_str())
    }
}

/// Deterministic fingerprint of a logical listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(pub String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record that passed schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatedRecord {
    pub key: DedupKey,
    pub job_id: Uuid,
    pub run_id: String,
    pub observed_at: DateTime<Utc>,
    pub record: NormalizedRecord,
}

/// A record (or a whole page yield) that failed and is held for inspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedRecord {
    pub job_id: Uuid,
    pub source_id: String,
    pub url: String,
    pub reason_codes: Vec<String>,
    pub payload: serde_json::Value,
    pub quarantined_at: DateTime<Utc>,
}

/// Output partition: one execution date, one listing type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionKey {
    pub execution_date: NaiveDate,
    pub kind: SourceKind,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.execution_date, self.kind)
    }
}

/// Outcome of merging one run's silver layer into a gold partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionSummary {
    pub partition: String,
    pub records_in: u64,
    pub inserted: u64,
    pub merged: u64,
    pub unchanged: u64,
    pub total: u64,
}

/// Per-job line in the run manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: Uuid,
    pub source_id: String,
    pub state: String,
    pub pages_fetched: u32,
    pub attempt_count: u32,
    pub error: Option<String>,
}

/// Immutable per-run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub run_id: String,
    pub execution_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub exit_code: i32,
    pub counts_by_stage: BTreeMap<String, u64>,
    pub partitions_touched: Vec<PartitionSummary>,
    pub jobs: Vec<JobSummary>,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Aggregate counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub run_id: String,
    pub generated_at: Option<DateTime<Utc>>,
    pub fetched: u64,
    pub cache_skipped: u64,
    pub robots_denied: u64,
    pub retries: u64,
    pub extracted: u64,
    pub validated: u64,
    pub quarantined: u64,
    pub merged: u64,
    pub deduped: u64,
    pub out_of_window: u64,
    pub quarantine_reasons: BTreeMap<String, u64>,
}

/// Optional bounds on listing start dates, inclusive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl DateWindow {
    pub fn new(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Result<Self, AppError> {
        if let (Some(s), Some(u)) = (since, until) {
            if s > u {
                return Err(AppError::ConfigError(format!(
                    "--since {s} is after --until {u}"
                )));
            }
        }
        Ok(Self { since, until })
    }

    pub fn is_unbounded(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// Undated listings are always inside the window.
    pub fn contains(&self, day: Option<NaiveDate>) -> bool {
        let Some(day) = day else {
            return true;
        };
        self.since.is_none_or(|s| day >= s) && self.until.is_none_or(|u| day <= u)
    }

    pub fn is_past_until(&self, day: NaiveDate) -> bool {
        self.until.is_some_and(|u| day > u)
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}
