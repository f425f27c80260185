//! Tick loop deciding which sources are due and running them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::admission::AdmissionController;
use crate::error::AppError;
use crate::job::{CrawlJob, JobState};
use crate::models::{EXIT_FAILED, EXIT_INTERRUPTED, EXIT_OK, EXIT_RECOVERED, Manifest, Source};
use crate::registry::SourceRegistry;
use crate::session::{Pipeline, RunOptions};
use crate::traits::{
    ExtractorFactory, Fetcher, Normalizer, RobotsSource, ScheduleStateStore, Storage,
};

/// Tick cadence and bound.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Stop after this many ticks; `None` runs until cancelled.
    pub max_ticks: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            max_ticks: None,
        }
    }
}

impl SchedulerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_max_ticks(mut self, ticks: u64) -> Self {
        self.max_ticks = Some(ticks);
        self
    }
}

/// Scheduler state: last successful crawl per source and jobs in flight.
#[derive(Debug, Default)]
pub struct SchedulerContext {
    last_success: HashMap<String, DateTime<Utc>>,
    in_flight: HashSet<String>,
    ticks: u64,
}

impl SchedulerContext {
    pub async fn load<S: ScheduleStateStore>(store: &S) -> Result<Self, AppError> {
        Ok(Self {
            last_success: store.load_schedule().await?,
            ..Default::default()
        })
    }

    pub async fn flush<S: ScheduleStateStore>(&self, store: &S) -> Result<(), AppError> {
        store.save_schedule(&self.last_success).await
    }

    pub fn last_success(&self, source_id: &str) -> Option<DateTime<Utc>> {
        self.last_success.get(source_id).copied()
    }

    pub fn is_in_flight(&self, source_id: &str) -> bool {
        self.in_flight.contains(source_id)
    }

    /// A source is due when it never succeeded or its interval has elapsed.
    pub fn is_due(&self, source: &Source, now: DateTime<Utc>) -> bool {
        match self.last_success.get(&source.source_id) {
            None => true,
            Some(last) => (now - *last).to_std().is_ok_and(|age| age >= source.interval),
        }
    }

    /// Enabled, due, idle sources, starting at an offset that rotates each tick.
    pub fn due_sources(&mut self, sources: &[Source], now: DateTime<Utc>) -> Vec<Source> {
        let offset = if sources.is_empty() {
            0
        } else {
            (self.ticks % sources.len() as u64) as usize
        };
        self.ticks += 1;
        sources
            .iter()
            .cycle()
            .skip(offset)
            .take(sources.len())
            .filter(|s| s.enabled && !self.is_in_flight(&s.source_id) && self.is_due(s, now))
            .cloned()
            .collect()
    }

    fn start(&mut self, source_id: &str) {
        self.in_flight.insert(source_id.to_string());
    }

    /// Release the run's sources; only completed jobs count as a success.
    fn finish(&mut self, submitted: &[String], jobs: &[CrawlJob]) {
        for source_id in submitted {
            self.in_flight.remove(source_id);
        }
        for job in jobs.iter().filter(|j| j.state == JobState::Completed) {
            let at = job.ended_at.unwrap_or_else(Utc::now);
            self.last_success.insert(job.source_id.clone(), at);
        }
    }
}

/// Summary of a scheduler session.
#[derive(Debug, Default)]
pub struct SchedulerReport {
    pub ticks: u64,
    pub manifests: Vec<Manifest>,
    pub recovered: Vec<Manifest>,
}

impl SchedulerReport {
    /// 130 if any run was interrupted, 1 if any failed, 2 after a recovery, else 0.
    pub fn exit_code(&self) -> i32 {
        let codes: Vec<i32> = self.manifests.iter().map(|m| m.exit_code).collect();
        if codes.contains(&EXIT_INTERRUPTED) {
            EXIT_INTERRUPTED
        } else if codes.contains(&EXIT_FAILED) {
            EXIT_FAILED
        } else if !self.recovered.is_empty() {
            EXIT_RECOVERED
        } else {
            EXIT_OK
        }
    }
}

pub struct Scheduler<F, R, X, N, S> {
    pipeline: Pipeline<F, R, X, N, S>,
    registry: SourceRegistry,
    config: SchedulerConfig,
    admission: AdmissionController,
    context: Arc<Mutex<SchedulerContext>>,
}

impl<F, R, X, N, S> Scheduler<F, R, X, N, S>
where
    F: Fetcher + 'static,
    R: RobotsSource + 'static,
    X: ExtractorFactory + 'static,
    N: Normalizer + 'static,
    S: Storage,
{
    pub fn new(
        pipeline: Pipeline<F, R, X, N, S>,
        registry: SourceRegistry,
        config: SchedulerConfig,
    ) -> Self {
        let admission = pipeline.admission(None);
        Self {
            pipeline,
            registry,
            config,
            admission,
            context: Arc::new(Mutex::new(SchedulerContext::default())),
        }
    }

    pub fn context(&self) -> &Arc<Mutex<SchedulerContext>> {
        &self.context
    }

    /// Tick until `max_ticks` or cancellation, then wait for in-flight runs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SchedulerReport, AppError> {
        let store = self.pipeline.store().clone();
        let mut report = SchedulerReport {
            recovered: self.pipeline.recover().await?,
            ..Default::default()
        };
        *self.context.lock().await = SchedulerContext::load(&store).await?;
        info!(
            sources = self.registry.len(),
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Scheduler started"
        );

        let tracker = TaskTracker::new();
        let (sealed_tx, mut sealed_rx) = mpsc::unbounded_channel();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let due = {
                let mut context = self.context.lock().await;
                context.due_sources(self.registry.sources(), Utc::now())
            };
            report.ticks += 1;
            debug!(tick = report.ticks, due = due.len(), "Scheduler tick");

            if !due.is_empty()
                && let Err(e) = self
                    .start_run(due, &tracker, &sealed_tx, cancel.clone())
                    .await
            {
                // Nothing was marked in flight, so the sources stay due.
                error!(tick = report.ticks, error = %e, "Could not open a run this tick");
            }

            if self.config.max_ticks.is_some_and(|max| report.ticks >= max) {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.tick_interval) => {}
                () = cancel.cancelled() => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        drop(sealed_tx);
        while let Some(manifest) = sealed_rx.recv().await {
            report.manifests.push(manifest);
        }
        report.manifests.sort_by(|a, b| a.run_id.cmp(&b.run_id));

        self.context.lock().await.flush(&store).await?;
        info!(
            ticks = report.ticks,
            runs = report.manifests.len(),
            "Scheduler stopped"
        );
        Ok(report)
    }

    /// Open a run for `due` and seal it in the background.
    async fn start_run(
        &self,
        due: Vec<Source>,
        tracker: &TaskTracker,
        sealed: &mpsc::UnboundedSender<Manifest>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let mut session = self
            .pipeline
            .open_run(RunOptions::default(), self.admission.clone(), cancel)
            .await?;

        let mut submitted = Vec::new();
        {
            let mut context = self.context.lock().await;
            for source in due {
                let source_id = source.source_id.clone();
                match session.submit(source) {
                    Ok(_) => {
                        context.start(&source_id);
                        submitted.push(source_id);
                    }
                    Err(e) => warn!(%source_id, error = %e, "Source not enqueued this tick"),
                }
            }
        }

        let context = self.context.clone();
        let store = self.pipeline.store().clone();
        let sealed = sealed.clone();
        tracker.spawn(async move {
            match session.finish().await {
                Ok((manifest, jobs)) => {
                    let mut context = context.lock().await;
                    context.finish(&submitted, &jobs);
                    if let Err(e) = context.flush(&store).await {
                        error!(error = %e, "Failed to persist schedule state");
                    }
                    let _ = sealed.send(manifest);
                }
                Err(e) => {
                    error!(error = %e, "Run could not be sealed");
                    context.lock().await.finish(&submitted, &[]);
                }
            }
        });
        Ok(())
    }

    /// Crawl one source immediately, ignoring whether it is due.
    pub async fn run_source_now(
        &self,
        source_id: &str,
        cancel: CancellationToken,
    ) -> Result<Manifest, AppError> {
        let source = self
            .registry
            .get(source_id)
            .cloned()
            .ok_or_else(|| AppError::RegistryError(format!("Unknown source '{source_id}'")))?;
        let store = self.pipeline.store().clone();

        let mut session = self
            .pipeline
            .open_run(RunOptions::default(), self.admission.clone(), cancel)
            .await?;
        session.submit(source)?;
        let (manifest, jobs) = session.finish().await?;

        let mut context = self.context.lock().await;
        // Outside `run` the context has not been loaded yet.
        if context.last_success.is_empty() {
            context.last_success = store.load_schedule().await?;
        }
        context.finish(&[source_id.to_string()], &jobs);
        context.flush(&store).await?;
        Ok(manifest)
    }
}
