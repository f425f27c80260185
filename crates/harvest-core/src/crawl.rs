//! One-shot crawl: select sources, recover crashed runs, run once.

use chrono::NaiveDate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::AppError;
use crate::job::CrawlJob;
use crate::models::{
    DateWindow, EXIT_OK, EXIT_RECOVERED, MIN_QPS, Manifest, PageCursor, SourceKind,
};
use crate::registry::SourceRegistry;
use crate::session::{Pipeline, RunOptions};
use crate::traits::{CheckpointStore, ExtractorFactory, Fetcher, Normalizer, RobotsSource, Storage};

/// Filters and overrides for a single crawl invocation.
#[derive(Debug, Clone, Default)]
pub struct CrawlRequest {
    pub kind: Option<SourceKind>,
    pub source_id: Option<String>,
    pub limit: Option<usize>,
    /// Upper bound on every selected source's rate.
    pub qps: Option<f64>,
    pub execution_date: Option<NaiveDate>,
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
    pub dry_run: bool,
}

impl CrawlRequest {
    pub fn window(&self) -> Result<DateWindow, AppError> {
        DateWindow::new(self.since, self.until)
    }

    /// Reject a rate override no bucket can honour.
    pub fn validate(&self) -> Result<(), AppError> {
        if let Some(qps) = self.qps
            && !(qps >= MIN_QPS && qps.is_finite())
        {
            return Err(AppError::ConfigError(format!(
                "--qps must be at least {MIN_QPS}, got {qps}"
            )));
        }
        Ok(())
    }
}

/// A job the crawl would run, as shown by `--dry-run`.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub source_id: String,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub url: String,
    pub page_index: u32,
    pub resumed: bool,
    pub rules_path: Option<String>,
    pub qps_limit: f64,
    pub concurrency_limit: u32,
}

#[derive(Debug)]
pub enum CrawlOutcome {
    Planned(Vec<PlannedJob>),
    Finished {
        manifest: Manifest,
        jobs: Vec<CrawlJob>,
        recovered: Vec<Manifest>,
    },
}

impl CrawlOutcome {
    /// Process exit code: the run's, or 2 when a clean run followed a recovery.
    pub fn exit_code(&self) -> i32 {
        match self {
            CrawlOutcome::Planned(_) => EXIT_OK,
            CrawlOutcome::Finished {
                manifest,
                recovered,
                ..
            } => {
                if manifest.exit_code == EXIT_OK && !recovered.is_empty() {
                    EXIT_RECOVERED
                } else {
                    manifest.exit_code
                }
            }
        }
    }
}

/// Resolve the jobs a request selects, including where each would resume.
pub async fn plan<S: CheckpointStore>(
    registry: &SourceRegistry,
    request: &CrawlRequest,
    store: &S,
) -> Result<Vec<PlannedJob>, AppError> {
    let sources = registry.select(request.source_id.as_deref(), request.kind, request.limit);
    let mut planned = Vec::with_capacity(sources.len());
    for source in sources {
        let checkpoint = store.load_checkpoint(&source.source_id).await?;
        let resumed = checkpoint.is_some();
        let cursor = checkpoint
            .map(|c| c.cursor)
            .unwrap_or_else(|| PageCursor::start(&source.base_url));
        let qps_limit = match request.qps {
            Some(cap) if cap > 0.0 => source.qps_limit.min(cap),
            _ => source.qps_limit,
        };
        planned.push(PlannedJob {
            source_id: source.source_id,
            kind: source.kind,
            url: cursor.url,
            page_index: cursor.page_index,
            resumed,
            rules_path: source.rules_path,
            qps_limit,
            concurrency_limit: source.concurrency_limit,
        });
    }
    Ok(planned)
}

/// Run one crawl over the selected sources and seal it.
pub async fn crawl<F, R, X, N, S>(
    pipeline: &Pipeline<F, R, X, N, S>,
    registry: &SourceRegistry,
    request: &CrawlRequest,
    cancel: CancellationToken,
) -> Result<CrawlOutcome, AppError>
where
    F: Fetcher + 'static,
    R: RobotsSource + 'static,
    X: ExtractorFactory + 'static,
    N: Normalizer + 'static,
    S: Storage,
{
    request.validate()?;
    let window = request.window()?;
    if request.dry_run {
        return Ok(CrawlOutcome::Planned(
            plan(registry, request, pipeline.store()).await?,
        ));
    }

    let recovered = pipeline.recover().await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "Recovered unsealed runs");
    }

    let sources = registry.select(request.source_id.as_deref(), request.kind, request.limit);
    if sources.is_empty() {
        warn!("No matching sources found");
    }

    let mut session = pipeline
        .open_run(
            RunOptions {
                execution_date: request.execution_date,
                window,
            },
            pipeline.admission(request.qps),
            cancel,
        )
        .await?;
    for source in sources {
        // Rejections are recorded on the manifest.
        let _ = session.submit(source);
    }
    let (manifest, jobs) = session.finish().await?;
    info!(
        run_id = %manifest.run_id,
        exit_code = manifest.exit_code,
        jobs = jobs.len(),
        "Crawl finished"
    );
    Ok(CrawlOutcome::Finished {
        manifest,
        jobs,
        recovered,
    })
}
