//! The per-job crawl state machine.
//!
//! A job walks one source's pages in order. Each page goes through the fetch
//! gate, extraction, normalization, the date window and the quality gate.
//! Outputs are committed in a fixed order: silver append, fetch-cache entry,
//! checkpoint. A crash between any two steps leaves state that the next
//! attempt resumes from without duplicating or skipping pages.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::admission::AdmissionPermit;
use crate::error::AppError;
use crate::fetch_gate::{ConditionalFetchGate, GateOutcome};
use crate::job::{CrawlConfig, CrawlJob, JobState};
use crate::metrics::RunMetrics;
use crate::models::{
    Checkpoint, DateWindow, PageCursor, QuarantinedRecord, RawRecord, Run, Source,
    ValidatedRecord,
};
use crate::quality::{Admission, MergeOutcome, QualityGate, start_day};
use crate::queue::JobExecutor;
use crate::traits::{Extractor, ExtractorFactory, Fetcher, Normalizer, RobotsSource, Storage};

/// Events emitted by jobs for monitoring/logging.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started {
        job_id: Uuid,
        source_id: String,
    },
    Resumed {
        job_id: Uuid,
        source_id: String,
        page_index: u32,
    },
    PageProcessed {
        job_id: Uuid,
        page_index: u32,
        url: String,
        validated: usize,
        quarantined: usize,
    },
    PageSkipped {
        job_id: Uuid,
        url: String,
        reason: &'static str,
    },
    PageQuarantined {
        job_id: Uuid,
        url: String,
        reason: String,
    },
    RetryScheduled {
        job_id: Uuid,
        url: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    Completed {
        job_id: Uuid,
        pages_fetched: u32,
    },
    Failed {
        job_id: Uuid,
        error: String,
    },
    Interrupted {
        job_id: Uuid,
        page_index: u32,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: &JobEvent) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: &JobEvent) {
        match event {
            JobEvent::Started { job_id, source_id } => {
                tracing::info!(%job_id, %source_id, "Job started");
            }
            JobEvent::Resumed {
                job_id,
                source_id,
                page_index,
            } => {
                tracing::info!(%job_id, %source_id, %page_index, "Resuming from checkpoint");
            }
            JobEvent::PageProcessed {
                job_id,
                page_index,
                url,
                validated,
                quarantined,
            } => {
                tracing::info!(%job_id, %page_index, %url, %validated, %quarantined, "Page processed");
            }
            JobEvent::PageSkipped {
                job_id,
                url,
                reason,
            } => {
                tracing::debug!(%job_id, %url, %reason, "Page skipped");
            }
            JobEvent::PageQuarantined {
                job_id,
                url,
                reason,
            } => {
                tracing::warn!(%job_id, %url, %reason, "Page yield quarantined");
            }
            JobEvent::RetryScheduled {
                job_id,
                url,
                attempt,
                delay_ms,
                error,
            } => {
                tracing::warn!(%job_id, %url, %attempt, %delay_ms, %error, "Retrying fetch");
            }
            JobEvent::Completed {
                job_id,
                pages_fetched,
            } => {
                tracing::info!(%job_id, %pages_fetched, "Job completed");
            }
            JobEvent::Failed { job_id, error } => {
                tracing::error!(%job_id, %error, "Job failed");
            }
            JobEvent::Interrupted { job_id, page_index } => {
                tracing::warn!(%job_id, %page_index, "Job interrupted");
            }
        }
    }
}

/// State shared by every job of one run.
pub struct RunContext {
    pub run: Run,
    pub config: CrawlConfig,
    pub window: DateWindow,
    pub metrics: RunMetrics,
    pub quality: QualityGate,
}

/// How a job's page loop ended.
enum JobEnd {
    Completed,
    Interrupted,
}

/// Result of fetching one page, retries included.
enum PageFetch {
    Outcome(GateOutcome),
    /// Non-transient HTTP failure; the page yield is quarantined.
    Rejected(AppError),
    Interrupted,
}

/// Where the page loop goes after a page.
struct PageResult {
    next_page: Option<String>,
    past_window: bool,
}

/// Executes crawl jobs for one run.
pub struct JobRunner<F, R, X, N, S> {
    gate: ConditionalFetchGate<F, R, S>,
    extractors: X,
    normalizer: N,
    store: S,
    context: Arc<RunContext>,
    reporter: Arc<dyn JobReporter>,
    cancel: CancellationToken,
}

impl<F, R, X, N, S> Clone for JobRunner<F, R, X, N, S>
where
    F: Clone,
    R: Clone,
    X: Clone,
    N: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            gate: self.gate.clone(),
            extractors: self.extractors.clone(),
            normalizer: self.normalizer.clone(),
            store: self.store.clone(),
            context: self.context.clone(),
            reporter: self.reporter.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<F, R, X, N, S> JobRunner<F, R, X, N, S>
where
    F: Fetcher + 'static,
    R: RobotsSource + 'static,
    X: ExtractorFactory + 'static,
    N: Normalizer + 'static,
    S: Storage,
{
    pub fn new(
        gate: ConditionalFetchGate<F, R, S>,
        extractors: X,
        normalizer: N,
        store: S,
        context: Arc<RunContext>,
        reporter: Arc<dyn JobReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gate,
            extractors,
            normalizer,
            store,
            context,
            reporter,
            cancel,
        }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.context
    }

    /// Drive `job` from Running to a terminal state.
    pub async fn run_job(
        &self,
        mut job: CrawlJob,
        source: &Source,
        permit: &mut AdmissionPermit,
    ) -> CrawlJob {
        if let Err(e) = job.transition(JobState::Running) {
            error!(job_id = %job.job_id, error = %e, "Job could not start");
            return job;
        }
        self.reporter.report(&JobEvent::Started {
            job_id: job.job_id,
            source_id: source.source_id.clone(),
        });

        let end = match self.drive(&mut job, source, permit).await {
            Ok(JobEnd::Completed) => self
                .store
                .clear_checkpoint(&source.source_id, &job.checkpoint_owners())
                .await
                .map(|()| JobEnd::Completed),
            other => other,
        };

        let next = match end {
            Ok(JobEnd::Completed) => {
                self.reporter.report(&JobEvent::Completed {
                    job_id: job.job_id,
                    pages_fetched: job.pages_fetched,
                });
                JobState::Completed
            }
            Ok(JobEnd::Interrupted) => {
                self.reporter.report(&JobEvent::Interrupted {
                    job_id: job.job_id,
                    page_index: job.cursor.as_ref().map(|c| c.page_index).unwrap_or(0),
                });
                JobState::Interrupted
            }
            Err(e) => {
                let message = e.to_string();
                self.reporter.report(&JobEvent::Failed {
                    job_id: job.job_id,
                    error: message.clone(),
                });
                job.last_error = Some(message);
                JobState::Failed
            }
        };
        if let Err(e) = job.transition(next) {
            error!(job_id = %job.job_id, error = %e, "Illegal job transition");
        }
        job
    }

    async fn drive(
        &self,
        job: &mut CrawlJob,
        source: &Source,
        permit: &mut AdmissionPermit,
    ) -> Result<JobEnd, AppError> {
        let extractor = self.extractors.create(source)?;
        let max_pages = source
            .max_pages
            .or(extractor.max_pages())
            .unwrap_or(self.context.config.default_max_pages);

        let mut cursor = match self.store.load_checkpoint(&source.source_id).await? {
            Some(checkpoint) => {
                self.reporter.report(&JobEvent::Resumed {
                    job_id: job.job_id,
                    source_id: source.source_id.clone(),
                    page_index: checkpoint.cursor.page_index,
                });
                job.pages_fetched = checkpoint.pages_fetched;
                job.resumed_from = Some(checkpoint.job_id);
                checkpoint.cursor
            }
            None => PageCursor::start(&source.base_url),
        };
        job.cursor = Some(cursor.clone());

        loop {
            if self.cancel.is_cancelled() {
                return Ok(JobEnd::Interrupted);
            }
            if cursor.page_index >= max_pages {
                return Ok(JobEnd::Completed);
            }

            let page = match self.fetch_page(job, &cursor.url, permit).await? {
                PageFetch::Interrupted => return Ok(JobEnd::Interrupted),
                PageFetch::Rejected(e) => self.quarantine_page(job, &cursor.url, &e).await?,
                PageFetch::Outcome(GateOutcome::Skipped { reason, cached }) => {
                    self.reporter.report(&JobEvent::PageSkipped {
                        job_id: job.job_id,
                        url: cursor.url.clone(),
                        reason: reason.as_str(),
                    });
                    PageResult {
                        next_page: cached.and_then(|c| c.next_page),
                        past_window: false,
                    }
                }
                PageFetch::Outcome(GateOutcome::Fetched(fetched)) => {
                    match extractor.extract(&fetched.url, &fetched.body) {
                        Ok(extracted) => {
                            let past_window = self
                                .commit_page(job, source, &cursor, extracted.records)
                                .await?;
                            let mut entry = fetched.pending_entry;
                            entry.next_page = extracted.next_page.clone();
                            self.gate.commit(&entry).await?;
                            PageResult {
                                next_page: extracted.next_page,
                                past_window,
                            }
                        }
                        Err(e) => {
                            let mut result = self.quarantine_page(job, &fetched.url, &e).await?;
                            result.next_page = fetched.previous_next_page;
                            result
                        }
                    }
                }
            };

            job.pages_fetched += 1;
            self.context.metrics.add_pages(1);

            let next = page
                .next_page
                .filter(|next| *next != cursor.url && !page.past_window);
            let Some(next_url) = next else {
                return Ok(JobEnd::Completed);
            };

            cursor = cursor.advance(next_url);
            self.store
                .save_checkpoint(&Checkpoint {
                    source_id: source.source_id.clone(),
                    run_id: job.run_id.clone(),
                    job_id: job.job_id,
                    cursor: cursor.clone(),
                    pages_fetched: job.pages_fetched,
                    updated_at: Utc::now(),
                })
                .await?;
            job.cursor = Some(cursor.clone());
        }
    }

    /// Fetch through the gate, retrying transient failures with backoff.
    async fn fetch_page(
        &self,
        job: &mut CrawlJob,
        url: &str,
        permit: &mut AdmissionPermit,
    ) -> Result<PageFetch, AppError> {
        let config = &self.context.config;
        let mut attempt = 0;
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Ok(PageFetch::Interrupted),
                () = permit.pace() => {}
            }

            attempt += 1;
            job.attempt_count += 1;
            let fetch = self
                .gate
                .fetch(url, config.fetch_timeout, &self.context.metrics);
            tokio::pin!(fetch);

            let result = tokio::select! {
                biased;
                result = &mut fetch => result,
                () = self.cancel.cancelled() => {
                    // Let the in-flight request settle; its output is discarded.
                    let _ = tokio::time::timeout(config.grace_period, &mut fetch).await;
                    return Ok(PageFetch::Interrupted);
                }
            };

            match result {
                Ok(outcome) => return Ok(PageFetch::Outcome(outcome)),
                Err(e) if e.is_retryable() => {
                    if !config.backoff.can_retry(attempt) {
                        return Err(e);
                    }
                    let delay = config.backoff.delay_for_attempt(attempt);
                    self.context.metrics.add_retries(1);
                    self.reporter.report(&JobEvent::RetryScheduled {
                        job_id: job.job_id,
                        url: url.to_string(),
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                    tokio::select! {
                        () = self.cancel.cancelled() => return Ok(PageFetch::Interrupted),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e @ AppError::HttpStatus { .. }) => return Ok(PageFetch::Rejected(e)),
                Err(e) => return Err(e),
            }
        }
    }

    /// Normalize, filter and gate a page's records, then append them to silver.
    ///
    /// Returns true when every dated record starts after the window's end.
    async fn commit_page(
        &self,
        job: &CrawlJob,
        source: &Source,
        cursor: &PageCursor,
        records: Vec<RawRecord>,
    ) -> Result<bool, AppError> {
        let ctx = &self.context;
        ctx.metrics.add_extracted(records.len() as u64);

        let mut validated: Vec<ValidatedRecord> = Vec::new();
        let mut rejected: Vec<QuarantinedRecord> = Vec::new();
        let mut dated = 0usize;
        let mut beyond = 0usize;

        for raw in records {
            let url = raw.url.clone();
            let normalized = match self.normalizer.normalize(raw) {
                Ok(n) => n,
                Err(e) => {
                    rejected.push(QuarantinedRecord {
                        job_id: job.job_id,
                        source_id: source.source_id.clone(),
                        url,
                        reason_codes: vec![e.kind().to_string()],
                        payload: json!({"error": e.to_string()}),
                        quarantined_at: Utc::now(),
                    });
                    continue;
                }
            };

            let day = start_day(&normalized.fields);
            if let Some(day) = day {
                dated += 1;
                if ctx.window.is_past_until(day) {
                    beyond += 1;
                }
            }
            if !ctx.window.contains(day) {
                ctx.metrics.add_out_of_window(1);
                continue;
            }

            match ctx.quality.admit(normalized, job.job_id, &ctx.run.run_id) {
                Admission::Validated(record) => validated.push(record),
                Admission::Quarantined(record) => rejected.push(record),
            }
        }

        for record in &validated {
            match ctx.quality.commit(record).await {
                MergeOutcome::Inserted => ctx.metrics.add_validated(1),
                MergeOutcome::Merged => {
                    ctx.metrics.add_validated(1);
                    ctx.metrics.add_merged(1);
                    ctx.metrics.add_deduped(1);
                }
                MergeOutcome::Unchanged => {
                    ctx.metrics.add_validated(1);
                    ctx.metrics.add_deduped(1);
                }
            }
        }

        for record in &rejected {
            ctx.metrics.record_quarantine(&record.reason_codes);
        }
        if !rejected.is_empty() {
            if let Err(e) = self.store.write_quarantine(&rejected).await {
                warn!(job_id = %job.job_id, error = %e, "Quarantine write failed");
            }
        }

        if !validated.is_empty() {
            self.store
                .append_silver(&ctx.run, source.kind, &validated)
                .await?;
        }

        self.reporter.report(&JobEvent::PageProcessed {
            job_id: job.job_id,
            page_index: cursor.page_index,
            url: cursor.url.clone(),
            validated: validated.len(),
            quarantined: rejected.len(),
        });
        Ok(dated > 0 && dated == beyond)
    }

    /// Quarantine a page whose yield could not be produced.
    async fn quarantine_page(
        &self,
        job: &CrawlJob,
        url: &str,
        cause: &AppError,
    ) -> Result<PageResult, AppError> {
        let reason = cause.page_reason_code();
        let record = QuarantinedRecord {
            job_id: job.job_id,
            source_id: job.source_id.clone(),
            url: url.to_string(),
            reason_codes: vec![reason.clone()],
            payload: json!({"url": url, "error": cause.to_string()}),
            quarantined_at: Utc::now(),
        };
        self.context.metrics.record_quarantine(&record.reason_codes);
        if let Err(e) = self.store.write_quarantine(&[record]).await {
            warn!(job_id = %job.job_id, error = %e, "Quarantine write failed");
        }
        self.reporter.report(&JobEvent::PageQuarantined {
            job_id: job.job_id,
            url: url.to_string(),
            reason,
        });

        let cached = self.store.get_cache_entry(url).await?;
        Ok(PageResult {
            next_page: cached.and_then(|c| c.next_page),
            past_window: false,
        })
    }
}

impl<F, R, X, N, S> JobExecutor for JobRunner<F, R, X, N, S>
where
    F: Fetcher + 'static,
    R: RobotsSource + 'static,
    X: ExtractorFactory + 'static,
    N: Normalizer + 'static,
    S: Storage,
{
    async fn execute(
        &self,
        job: CrawlJob,
        source: Source,
        mut permit: AdmissionPermit,
    ) -> CrawlJob {
        self.run_job(job, &source, &mut permit).await
    }
}
