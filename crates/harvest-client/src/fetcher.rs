use std::collections::BTreeMap;
use std::time::Duration;

use harvest_core::error::AppError;
use harvest_core::traits::{FetchPolicy, FetchResult, Fetcher};
use reqwest::header::{IF_MODIFIED_SINCE, IF_NONE_MATCH, USER_AGENT};
use reqwest::{Client, StatusCode};

pub const DEFAULT_USER_AGENT: &str = concat!("harvest/", env!("CARGO_PKG_VERSION"));

/// HTTP fetcher using reqwest.
///
/// Sends the policy's validators as `If-None-Match` / `If-Modified-Since` and
/// returns every response, whatever its status. Only transport failures are
/// errors; status handling belongs to the caller.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Client-wide ceiling. Each request still applies its policy timeout.
    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::NetworkError(e.to_string()))?;

        Ok(Self { client })
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, policy: &FetchPolicy) -> Result<FetchResult, AppError> {
        let mut request = self
            .client
            .get(url)
            .timeout(policy.timeout)
            .header(USER_AGENT, policy.user_agent.as_str());
        if let Some(etag) = &policy.conditional.if_none_match {
            request = request.header(IF_NONE_MATCH, etag.as_str());
        }
        if let Some(modified) = &policy.conditional.if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, modified.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(e, policy.timeout))?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = if status == StatusCode::NOT_MODIFIED {
            String::new()
        } else {
            response
                .text()
                .await
                .map_err(|e| transport_error(e, policy.timeout))?
        };

        Ok(FetchResult {
            status: status.as_u16(),
            etag: headers.get("etag").cloned(),
            last_modified: headers.get("last-modified").cloned(),
            headers,
            body,
        })
    }
}

pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout.as_secs())
    } else if e.is_connect() {
        AppError::NetworkError(format!("Connection failed: {e}"))
    } else {
        AppError::NetworkError(e.to_string())
    }
}
