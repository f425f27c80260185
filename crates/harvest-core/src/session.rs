//! Run lifecycle: open, submit jobs, drain, merge, seal.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionController;
use crate::error::AppError;
use crate::fetch_gate::ConditionalFetchGate;
use crate::job::{CrawlConfig, CrawlJob, JobState};
use crate::metrics::RunMetrics;
use crate::models::{
    DateWindow, EXIT_FAILED, EXIT_INTERRUPTED, EXIT_OK, EXIT_RECOVERED, Manifest,
    MetricsSnapshot, Run, Source,
};
use crate::quality::{MergePolicy, QualityGate, SchemaSet};
use crate::queue::JobQueue;
use crate::runner::{JobReporter, JobRunner, RunContext, TracingJobReporter};
use crate::traits::{ExtractorFactory, Fetcher, Normalizer, RobotsSource, Storage};

/// Per-run knobs that do not belong to [`CrawlConfig`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub execution_date: Option<NaiveDate>,
    pub window: DateWindow,
}

/// The collaborators and settings every run is built from.
pub struct Pipeline<F, R, X, N, S> {
    fetcher: F,
    robots: R,
    extractors: X,
    normalizer: N,
    store: S,
    gate: ConditionalFetchGate<F, R, S>,
    config: CrawlConfig,
    schemas: SchemaSet,
    merge_policy: MergePolicy,
    reporter: Arc<dyn JobReporter>,
}

impl<F, R, X, N, S> Clone for Pipeline<F, R, X, N, S>
where
    F: Clone,
    R: Clone,
    X: Clone,
    N: Clone,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            fetcher: self.fetcher.clone(),
            robots: self.robots.clone(),
            extractors: self.extractors.clone(),
            normalizer: self.normalizer.clone(),
            store: self.store.clone(),
            gate: self.gate.clone(),
            config: self.config.clone(),
            schemas: self.schemas.clone(),
            merge_policy: self.merge_policy.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

impl<F, R, X, N, S> Pipeline<F, R, X, N, S>
where
    F: Fetcher + 'static,
    R: RobotsSource + 'static,
    X: ExtractorFactory + 'static,
    N: Normalizer + 'static,
    S: Storage,
{
    pub fn new(fetcher: F, robots: R, extractors: X, normalizer: N, store: S) -> Self {
        let config = CrawlConfig::default();
        Self {
            gate: Self::build_gate(&fetcher, &robots, &store, &config),
            fetcher,
            robots,
            extractors,
            normalizer,
            store,
            config,
            schemas: SchemaSet::builtin(),
            merge_policy: MergePolicy::default(),
            reporter: Arc::new(TracingJobReporter),
        }
    }

    pub fn with_config(mut self, config: CrawlConfig) -> Self {
        self.gate = Self::build_gate(&self.fetcher, &self.robots, &self.store, &config);
        self.config = config;
        self
    }

    /// Shared by every run of this pipeline, robots cache included.
    fn build_gate(
        fetcher: &F,
        robots: &R,
        store: &S,
        config: &CrawlConfig,
    ) -> ConditionalFetchGate<F, R, S> {
        ConditionalFetchGate::new(
            fetcher.clone(),
            robots.clone(),
            store.clone(),
            config.user_agent.clone(),
            config.robots_ttl,
        )
    }

    pub fn with_schemas(mut self, schemas: SchemaSet) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn JobReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &CrawlConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Admission state sized from the config; share it across runs.
    pub fn admission(&self, qps_override: Option<f64>) -> AdmissionController {
        AdmissionController::new(self.config.global_concurrency, self.config.max_pending)
            .with_qps_override(qps_override)
    }

    /// Open a run: write its marker and start an empty job queue.
    pub async fn open_run(
        &self,
        options: RunOptions,
        admission: AdmissionController,
        cancel: CancellationToken,
    ) -> Result<RunSession<F, R, X, N, S>, AppError> {
        let run = Run::open(options.execution_date);
        self.store.open_run(&run).await?;
        info!(run_id = %run.run_id, execution_date = %run.execution_date, "Run opened");

        let context = Arc::new(RunContext {
            quality: QualityGate::new(
                &self.schemas,
                self.merge_policy.clone(),
                run.execution_date,
            )?,
            run,
            config: self.config.clone(),
            window: options.window,
            metrics: RunMetrics::new(),
        });

        let runner = JobRunner::new(
            self.gate.clone(),
            self.extractors.clone(),
            self.normalizer.clone(),
            self.store.clone(),
            context.clone(),
            self.reporter.clone(),
            cancel.clone(),
        );
        let (queue, reports) = JobQueue::new(runner, admission, cancel.clone());

        Ok(RunSession {
            context,
            queue,
            reports,
            store: self.store.clone(),
            merge_policy: self.merge_policy.clone(),
            cancel,
            submitted: Vec::new(),
            rejected: Vec::new(),
        })
    }

    /// Merge and seal every run that crashed before sealing.
    pub async fn recover(&self) -> Result<Vec<Manifest>, AppError> {
        let mut recovered = Vec::new();
        for run in self.store.unsealed_runs().await? {
            warn!(run_id = %run.run_id, "Recovering unsealed run");
            let mut errors = vec!["recovered after crash".to_string()];
            let partitions = match self.store.merge_run(&run, &self.merge_policy).await {
                Ok(partitions) => partitions,
                Err(e) => {
                    error!(run_id = %run.run_id, error = %e, "Recovery merge failed");
                    errors.push(e.to_string());
                    Vec::new()
                }
            };
            let manifest = Manifest {
                run_id: run.run_id.clone(),
                execution_date: run.execution_date,
                started_at: run.started_at,
                ended_at: Utc::now(),
                exit_code: EXIT_RECOVERED,
                counts_by_stage: Default::default(),
                partitions_touched: partitions,
                jobs: Vec::new(),
                errors,
            };
            let metrics = MetricsSnapshot {
                run_id: run.run_id.clone(),
                generated_at: Some(Utc::now()),
                ..Default::default()
            };
            self.store.seal_run(&manifest, &metrics).await?;
            recovered.push(manifest);
        }
        Ok(recovered)
    }
}

/// An open run accepting jobs.
pub struct RunSession<F, R, X, N, S> {
    context: Arc<RunContext>,
    queue: JobQueue<JobRunner<F, R, X, N, S>>,
    reports: mpsc::UnboundedReceiver<CrawlJob>,
    store: S,
    merge_policy: MergePolicy,
    cancel: CancellationToken,
    submitted: Vec<(Uuid, String)>,
    rejected: Vec<String>,
}

impl<F, R, X, N, S> RunSession<F, R, X, N, S>
where
    F: Fetcher + 'static,
    R: RobotsSource + 'static,
    X: ExtractorFactory + 'static,
    N: Normalizer + 'static,
    S: Storage,
{
    pub fn run(&self) -> &Run {
        &self.context.run
    }

    pub fn metrics(&self) -> &RunMetrics {
        &self.context.metrics
    }

    /// Queue a job for `source`. A saturated queue is recorded and returned.
    pub fn submit(&mut self, source: Source) -> Result<Uuid, AppError> {
        let job = CrawlJob::new(&source.source_id, &self.context.run.run_id);
        let source_id = source.source_id.clone();
        match self.queue.submit(source, job) {
            Ok(job_id) => {
                self.submitted.push((job_id, source_id));
                Ok(job_id)
            }
            Err(e) => {
                warn!(%source_id, error = %e, "Job rejected");
                self.rejected.push(e.to_string());
                Err(e)
            }
        }
    }

    pub fn submitted(&self) -> &[(Uuid, String)] {
        &self.submitted
    }

    /// Wait for every job, merge the run's silver into gold and seal it.
    ///
    /// A manifest is sealed even when jobs failed or the merge did not succeed.
    pub async fn finish(mut self) -> Result<(Manifest, Vec<CrawlJob>), AppError> {
        self.queue.drain().await;

        let mut jobs = Vec::new();
        while let Ok(job) = self.reports.try_recv() {
            jobs.push(job);
        }
        // A job task that panicked never reports; it still counts as failed.
        for (job_id, source_id) in &self.submitted {
            if !jobs.iter().any(|j| j.job_id == *job_id) {
                error!(%job_id, %source_id, "Job ended without a report");
                jobs.push(CrawlJob::lost(*job_id, source_id, &self.context.run.run_id));
            }
        }
        jobs.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let run = &self.context.run;
        let mut errors = self.rejected.clone();
        errors.extend(
            jobs.iter()
                .filter_map(|j| j.last_error.as_ref())
                .map(|e| e.to_string()),
        );

        let mut merge_failed = false;
        let partitions = match self.store.merge_run(run, &self.merge_policy).await {
            Ok(partitions) => partitions,
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Gold merge failed");
                errors.push(format!("merge failed: {e}"));
                merge_failed = true;
                Vec::new()
            }
        };

        let exit_code = if self.cancel.is_cancelled()
            || jobs.iter().any(|j| j.state == JobState::Interrupted)
        {
            EXIT_INTERRUPTED
        } else if merge_failed || jobs.iter().any(|j| j.state != JobState::Completed) {
            EXIT_FAILED
        } else {
            EXIT_OK
        };

        let ended_at = Utc::now();
        let manifest = Manifest {
            run_id: run.run_id.clone(),
            execution_date: run.execution_date,
            started_at: run.started_at,
            ended_at,
            exit_code,
            counts_by_stage: self.context.metrics.counts_by_stage(),
            partitions_touched: partitions,
            jobs: jobs.iter().map(CrawlJob::summary).collect(),
            errors,
        };
        let metrics = self.context.metrics.snapshot(&run.run_id);
        self.store.seal_run(&manifest, &metrics).await?;
        info!(run_id = %run.run_id, exit_code, jobs = jobs.len(), "Run sealed");
        Ok((manifest, jobs))
    }
}
