//! Source registry loading from CSV.
//!
//! Columns: `source_id,base_url,type,qps_limit,concurrency_limit,enabled,interval`
//! with optional `rules_path` and `max_pages`. Rule paths are resolved against
//! the registry file's directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::AppError;
use crate::models::{MIN_QPS, Source, SourceKind, parse_interval};

#[derive(Debug, Deserialize)]
struct SourceRow {
    #[serde(default)]
    source_id: String,
    #[serde(default)]
    base_url: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    qps_limit: String,
    #[serde(default)]
    concurrency_limit: String,
    #[serde(default)]
    enabled: String,
    #[serde(default)]
    interval: String,
    #[serde(default)]
    rules_path: String,
    #[serde(default)]
    max_pages: String,
}

/// Validation outcome for one registry row.
#[derive(Debug, Clone, PartialEq)]
pub struct RowReport {
    /// 1-based line number in the file, header included.
    pub line: u64,
    pub source_id: String,
    pub enabled: bool,
    pub errors: Vec<String>,
}

impl RowReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// `ok`, `disabled`, or the joined error messages.
    pub fn status(&self) -> String {
        if !self.errors.is_empty() {
            self.errors.join("; ")
        } else if self.enabled {
            "ok".to_string()
        } else {
            "disabled".to_string()
        }
    }
}

/// The set of crawlable sources.
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    /// Load enabled sources. Any invalid row fails the whole load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let mut sources = Vec::new();
        for (report, source) in read_rows(path)? {
            if !report.is_valid() {
                return Err(AppError::RegistryError(format!(
                    "Invalid source row {} (line {}): {}",
                    report.source_id,
                    report.line,
                    report.status()
                )));
            }
            if let Some(source) = source.filter(|s| s.enabled) {
                sources.push(source);
            }
        }
        debug!(path = %path.display(), count = sources.len(), "Registry loaded");
        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn get(&self, source_id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    /// The source whose `base_url` is the longest prefix of `url`.
    ///
    /// The prefix must end on a path, query or fragment boundary, so
    /// `https://a.example` does not claim `https://a.example.org/`.
    pub fn match_url(&self, url: &str) -> Option<&Source> {
        self.sources
            .iter()
            .filter(|s| {
                url.strip_prefix(s.base_url.as_str()).is_some_and(|rest| {
                    s.base_url.ends_with('/')
                        || rest.is_empty()
                        || rest.starts_with(['/', '?', '#'])
                })
            })
            .max_by_key(|s| s.base_url.len())
    }

    /// Sources matching an optional id and kind, at most `limit` of them.
    pub fn select(
        &self,
        source_id: Option<&str>,
        kind: Option<SourceKind>,
        limit: Option<usize>,
    ) -> Vec<Source> {
        self.sources
            .iter()
            .filter(|s| source_id.is_none_or(|id| s.source_id == id))
            .filter(|s| kind.is_none_or(|k| s.kind == k))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Check every row without failing on the first problem.
pub fn validate_sources(path: impl AsRef<Path>) -> Result<Vec<RowReport>, AppError> {
    Ok(read_rows(path.as_ref())?
        .into_iter()
        .map(|(report, _)| report)
        .collect())
}

fn read_rows(path: &Path) -> Result<Vec<(RowReport, Option<Source>)>, AppError> {
    let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)
        .map_err(|e| {
            AppError::RegistryError(format!("Cannot read registry {}: {e}", path.display()))
        })?;

    let mut seen = HashSet::new();
    let mut rows = Vec::new();
    for (index, result) in reader.deserialize::<SourceRow>().enumerate() {
        let line = index as u64 + 2;
        let row = match result {
            Ok(row) => row,
            Err(e) => {
                rows.push((
                    RowReport {
                        line,
                        source_id: String::new(),
                        enabled: false,
                        errors: vec![format!("unreadable row: {e}")],
                    },
                    None,
                ));
                continue;
            }
        };
        if row.source_id.is_empty() && row.base_url.is_empty() {
            continue;
        }

        let (source, mut errors) = build_source(&row, &base_dir);
        if !row.source_id.is_empty() && !seen.insert(row.source_id.clone()) {
            errors.push(format!("duplicate source_id '{}'", row.source_id));
        }
        let enabled = parse_bool(&row.enabled, true).unwrap_or(false);
        let source = if errors.is_empty() { source } else { None };
        rows.push((
            RowReport {
                line,
                source_id: row.source_id,
                enabled,
                errors,
            },
            source,
        ));
    }
    Ok(rows)
}

fn build_source(row: &SourceRow, base_dir: &Path) -> (Option<Source>, Vec<String>) {
    let mut errors = Vec::new();

    if row.source_id.is_empty() {
        errors.push("source_id is empty".to_string());
    }
    match Url::parse(&row.base_url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        Ok(url) => errors.push(format!("base_url scheme '{}' is not http(s)", url.scheme())),
        Err(e) => errors.push(format!("base_url '{}' is invalid: {e}", row.base_url)),
    }
    let kind = row
        .kind
        .parse::<SourceKind>()
        .map_err(|e| errors.push(e.to_string()))
        .ok();
    let qps = parse_or(&row.qps_limit, 1.0_f64, "qps_limit", &mut errors);
    if !(qps >= MIN_QPS && qps.is_finite()) {
        errors.push(format!("qps_limit must be at least {MIN_QPS}, got {qps}"));
    }
    let concurrency = parse_or(&row.concurrency_limit, 1_u32, "concurrency_limit", &mut errors);
    if concurrency == 0 {
        errors.push("concurrency_limit must be at least 1".to_string());
    }
    let enabled = match parse_bool(&row.enabled, true) {
        Some(enabled) => enabled,
        None => {
            errors.push(format!("enabled '{}' is not a boolean", row.enabled));
            false
        }
    };
    let interval = if row.interval.is_empty() {
        parse_interval("daily")
    } else {
        parse_interval(&row.interval)
    }
    .map_err(|e| errors.push(e.to_string()))
    .ok();
    let max_pages = if row.max_pages.is_empty() {
        None
    } else {
        match row.max_pages.parse::<u32>() {
            Ok(0) | Err(_) => {
                errors.push(format!("max_pages '{}' must be a positive integer", row.max_pages));
                None
            }
            Ok(n) => Some(n),
        }
    };
    let rules_path = (!row.rules_path.is_empty()).then(|| resolve(base_dir, &row.rules_path));
    if let Some(path) = &rules_path
        && enabled
        && !path.exists()
    {
        errors.push(format!("Rule file not found: {}", path.display()));
    }

    let (Some(kind), Some(interval)) = (kind, interval) else {
        return (None, errors);
    };
    if !errors.is_empty() {
        return (None, errors);
    }

    let mut source = Source::new(&row.source_id, &row.base_url, kind)
        .with_limits(qps, concurrency)
        .with_interval(interval);
    source.enabled = enabled;
    if let Some(max_pages) = max_pages {
        source = source.with_max_pages(max_pages);
    }
    if let Some(path) = rules_path {
        source = source.with_rules_path(path.to_string_lossy());
    }
    (Some(source), errors)
}

fn parse_or<T: FromStr>(raw: &str, default: T, column: &str, errors: &mut Vec<String>) -> T {
    if raw.is_empty() {
        return default;
    }
    raw.parse().unwrap_or_else(|_| {
        errors.push(format!("{column} '{raw}' is not a number"));
        default
    })
}

fn parse_bool(raw: &str, default: bool) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "" => Some(default),
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn resolve(base_dir: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}
