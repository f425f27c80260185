use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{JobSummary, PageCursor};

/// Lifecycle state of a crawl job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Interrupted
        )
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Interrupted)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Interrupted)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "interrupted" => Ok(JobState::Interrupted),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Exponential backoff for transient fetch failures.
///
/// Delay for attempt `n` (1-indexed) is `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }

    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// One source's crawl within one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlJob {
    pub job_id: Uuid,
    pub source_id: String,
    pub run_id: String,
    pub state: JobState,
    pub cursor: Option<PageCursor>,
    pub pages_fetched: u32,
    pub attempt_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Job whose checkpoint this one resumed from.
    #[serde(default)]
    pub resumed_from: Option<Uuid>,
}

impl CrawlJob {
    pub fn new(source_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source_id: source_id.into(),
            run_id: run_id.into(),
            state: JobState::Pending,
            cursor: None,
            pages_fetched: 0,
            attempt_count: 0,
            started_at: None,
            ended_at: None,
            last_error: None,
            resumed_from: None,
        }
    }

    /// A submitted job whose task ended without reporting back.
    pub fn lost(job_id: Uuid, source_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            job_id,
            state: JobState::Failed,
            ended_at: Some(Utc::now()),
            last_error: Some("job task panicked".to_string()),
            ..Self::new(source_id, run_id)
        }
    }

    /// Job ids whose checkpoint this job may clear when it completes.
    pub fn checkpoint_owners(&self) -> Vec<Uuid> {
        std::iter::once(self.job_id).chain(self.resumed_from).collect()
    }

    /// Move to `next`, stamping start/end times.
    pub fn transition(&mut self, next: JobState) -> Result<(), AppError> {
        if !self.state.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        if next == JobState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.state = next;
        Ok(())
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id,
            source_id: self.source_id.clone(),
            state: self.state.to_string(),
            pages_fetched: self.pages_fetched,
            attempt_count: self.attempt_count,
            error: self.last_error.clone(),
        }
    }
}

/// Settings shared by every job in a run.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub fetch_timeout: Duration,
    pub grace_period: Duration,
    pub backoff: BackoffPolicy,
    pub user_agent: String,
    pub default_max_pages: u32,
    pub global_concurrency: usize,
    pub max_pending: usize,
    pub robots_ttl: Duration,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            grace_period: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            user_agent: format!("harvest/{}", env!("CARGO_PKG_VERSION")),
            default_max_pages: 50,
            global_concurrency: 8,
            max_pending: 256,
            robots_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl CrawlConfig {
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_default_max_pages(mut self, max_pages: u32) -> Self {
        self.default_max_pages = max_pages;
        self
    }

    pub fn with_global_concurrency(mut self, limit: usize) -> Self {
        self.global_concurrency = limit.max(1);
        self
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    pub fn with_robots_ttl(mut self, ttl: Duration) -> Self {
        self.robots_ttl = ttl;
        self
    }
}
