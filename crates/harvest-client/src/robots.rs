use std::sync::Arc;
use std::time::Duration;

use harvest_core::error::AppError;
use harvest_core::traits::{AllowAll, RobotsPolicy, RobotsSource};
use reqwest::Client;
use reqwest::header::USER_AGENT;
use robotstxt::DefaultMatcher;
use tracing::debug;

use crate::fetcher::{ReqwestFetcher, transport_error};

const ROBOTS_TIMEOUT: Duration = Duration::from_secs(10);

/// Parsed robots.txt body for one origin.
#[derive(Debug, Clone)]
pub struct RobotsTxtPolicy {
    body: String,
}

impl RobotsTxtPolicy {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

impl RobotsPolicy for RobotsTxtPolicy {
    fn allows(&self, url: &str, user_agent: &str) -> bool {
        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&self.body, product_token(user_agent), url)
    }
}

/// `harvest/0.1.0 (+https://...)` matches `User-agent: harvest`.
fn product_token(user_agent: &str) -> &str {
    user_agent
        .split(['/', ' '])
        .next()
        .filter(|token| !token.is_empty())
        .unwrap_or(user_agent)
}

/// Downloads `/robots.txt` over HTTP.
///
/// A missing or failing robots.txt (any status >= 400) allows everything.
#[derive(Clone)]
pub struct ReqwestRobotsSource {
    client: Client,
}

impl ReqwestRobotsSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Share the fetcher's connection pool.
    pub fn from_fetcher(fetcher: &ReqwestFetcher) -> Self {
        Self::new(fetcher.client().clone())
    }
}

impl RobotsSource for ReqwestRobotsSource {
    async fn load(
        &self,
        origin: &str,
        user_agent: &str,
    ) -> Result<Arc<dyn RobotsPolicy>, AppError> {
        let url = format!("{}/robots.txt", origin.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .timeout(ROBOTS_TIMEOUT)
            .header(USER_AGENT, user_agent)
            .send()
            .await
            .map_err(|e| transport_error(e, ROBOTS_TIMEOUT))?;

        let status = response.status();
        if !status.is_success() {
            debug!(%url, status = status.as_u16(), "No usable robots.txt, allowing all");
            return Ok(Arc::new(AllowAll));
        }

        let body = response
            .text()
            .await
            .map_err(|e| transport_error(e, ROBOTS_TIMEOUT))?;
        Ok(Arc::new(RobotsTxtPolicy::new(body)))
    }
}
