//! Decides whether a URL needs fetching and performs the fetch.
//!
//! The gate combines robots.txt policy (cached per origin), the fetch cache
//! (conditional headers, content hashes) and the bronze snapshot layer. A
//! fetched page carries a *pending* cache entry; callers commit it with
//! [`ConditionalFetchGate::commit`] once the page's outputs are durable.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use moka::future::Cache;
use tracing::{debug, warn};
use url::Url;

use crate::error::AppError;
use crate::metrics::RunMetrics;
use crate::models::{FetchCacheEntry, RawSnapshot, compute_hash};
use crate::traits::{
    AllowAll, ConditionalHeaders, FetchCacheStore, FetchPolicy, Fetcher, RobotsPolicy,
    RobotsSource, SnapshotStore,
};

/// Why a URL produced no downstream work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RobotsDisallow,
    NotModified,
    UnchangedContent,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::RobotsDisallow => "robots_disallow",
            SkipReason::NotModified => "not_modified",
            SkipReason::UnchangedContent => "unchanged_content",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchDecision {
    Skip(SkipReason),
    Proceed(ConditionalHeaders),
}

/// A page with new content, snapshotted to bronze but not yet committed.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
    pub pending_entry: FetchCacheEntry,
    /// Pagination hint left by the last committed fetch of this URL.
    pub previous_next_page: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GateOutcome {
    Skipped {
        reason: SkipReason,
        cached: Option<FetchCacheEntry>,
    },
    Fetched(FetchedPage),
}

#[derive(Clone)]
pub struct ConditionalFetchGate<F, R, S> {
    fetcher: F,
    robots: R,
    store: S,
    robots_cache: Cache<String, Arc<dyn RobotsPolicy>>,
    user_agent: String,
}

impl<F, R, S> ConditionalFetchGate<F, R, S>
where
    F: Fetcher,
    R: RobotsSource + 'static,
    S: FetchCacheStore + SnapshotStore,
{
    pub fn new(
        fetcher: F,
        robots: R,
        store: S,
        user_agent: impl Into<String>,
        robots_ttl: Duration,
    ) -> Self {
        Self {
            fetcher,
            robots,
            store,
            robots_cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(robots_ttl)
                .build(),
            user_agent: user_agent.into(),
        }
    }

    pub async fn should_fetch(&self, url: &str) -> Result<FetchDecision, AppError> {
        let (decision, _) = self.decide(url).await?;
        Ok(decision)
    }

    async fn decide(
        &self,
        url: &str,
    ) -> Result<(FetchDecision, Option<FetchCacheEntry>), AppError> {
        if !self.robots_allow(url).await? {
            return Ok((FetchDecision::Skip(SkipReason::RobotsDisallow), None));
        }
        let cached = self.store.get_cache_entry(url).await?;
        let headers = cached
            .as_ref()
            .map(ConditionalHeaders::from_entry)
            .unwrap_or_default();
        Ok((FetchDecision::Proceed(headers), cached))
    }

    async fn robots_allow(&self, url: &str) -> Result<bool, AppError> {
        let origin = origin_of(url)?;
        let robots = self.robots.clone();
        let user_agent = self.user_agent.clone();
        let policy = self
            .robots_cache
            .get_with(origin.clone(), async move {
                match robots.load(&origin, &user_agent).await {
                    Ok(policy) => policy,
                    Err(e) => {
                        warn!(origin = %origin, error = %e, "robots.txt unavailable, allowing all");
                        Arc::new(AllowAll) as Arc<dyn RobotsPolicy>
                    }
                }
            })
            .await;
        Ok(policy.allows(url, &self.user_agent))
    }

    /// Fetch `url` unless robots policy or the fetch cache say otherwise.
    ///
    /// Non-success statuses other than 304 are returned as errors; 429 as
    /// [`AppError::RateLimitExceeded`].
    pub async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        metrics: &RunMetrics,
    ) -> Result<GateOutcome, AppError> {
        let (decision, cached) = self.decide(url).await?;
        let conditional = match decision {
            FetchDecision::Skip(reason) => {
                metrics.add_robots_denied(1);
                debug!(url, reason = reason.as_str(), "Fetch skipped");
                return Ok(GateOutcome::Skipped { reason, cached });
            }
            FetchDecision::Proceed(headers) => headers,
        };

        let policy = FetchPolicy {
            timeout,
            user_agent: self.user_agent.clone(),
            conditional,
        };
        let result = tokio::time::timeout(timeout, self.fetcher.fetch(url, &policy))
            .await
            .map_err(|_| AppError::Timeout(timeout.as_secs()))??;
        let fetched_at = Utc::now();
        metrics.add_fetched(1);

        match result.status {
            304 => {
                let refreshed = match cached {
                    Some(mut entry) => {
                        entry.fetched_at = fetched_at;
                        self.store.put_cache_entry(&entry).await?;
                        Some(entry)
                    }
                    None => None,
                };
                metrics.add_cache_skipped(1);
                debug!(url, "Not modified");
                return Ok(GateOutcome::Skipped {
                    reason: SkipReason::NotModified,
                    cached: refreshed,
                });
            }
            429 => return Err(AppError::RateLimitExceeded),
            status if !(200..300).contains(&status) => {
                return Err(AppError::HttpStatus {
                    status,
                    url: url.to_string(),
                });
            }
            _ => {}
        }

        let content_hash = compute_hash(&result.body);
        let previous_next_page = cached.as_ref().and_then(|c| c.next_page.clone());
        if let Some(mut entry) = cached.filter(|c| c.content_hash == content_hash) {
            entry.fetched_at = fetched_at;
            entry.etag = result.etag.clone().or(entry.etag);
            entry.last_modified = result.last_modified.clone().or(entry.last_modified);
            self.store.put_cache_entry(&entry).await?;
            metrics.add_cache_skipped(1);
            debug!(url, "Content unchanged");
            return Ok(GateOutcome::Skipped {
                reason: SkipReason::UnchangedContent,
                cached: Some(entry),
            });
        }

        let snapshot = RawSnapshot {
            url: url.to_string(),
            fetched_at,
            status: result.status,
            headers: result.headers.clone(),
            content_hash: content_hash.clone(),
            body: result.body.clone(),
        };
        self.store.put_snapshot(&snapshot).await?;

        Ok(GateOutcome::Fetched(FetchedPage {
            url: url.to_string(),
            status: result.status,
            body: result.body,
            fetched_at,
            content_hash: content_hash.clone(),
            pending_entry: FetchCacheEntry {
                url: url.to_string(),
                etag: result.etag,
                last_modified: result.last_modified,
                content_hash,
                fetched_at,
                next_page: None,
            },
            previous_next_page,
        }))
    }

    /// Make a fetched page's cache entry visible to later fetches.
    pub async fn commit(&self, entry: &FetchCacheEntry) -> Result<(), AppError> {
        self.store.put_cache_entry(entry).await
    }
}

/// `scheme://host[:port]` of a URL.
pub fn origin_of(url: &str) -> Result<String, AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::Generic(format!("Invalid URL {url}: {e}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Generic(format!("URL has no host: {url}")))?;
    let port = parsed
        .port()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Ok(format!("{}://{}{}", parsed.scheme(), host, port))
}
