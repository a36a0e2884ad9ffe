use log::{error, warn};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::auth::Token;
use crate::config::Settings;
use crate::error::{PipelensError, Result};
use crate::rate_limit::RateLimiter;
use crate::providers::azure::links::BuildLinks;

const MAX_ERROR_BODY_CHARS: usize = 200;

pub struct AzureClient {
    client: Client,
    pub(super) builds_url: Url,
    pub(super) api_version: String,
    pub(super) links: BuildLinks,
    token: Token,
    limiter: Arc<RateLimiter>,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl AzureClient {
    /// Creates a client for the organization and project in `settings`.
    ///
    /// Every request made through this client first takes a token from `limiter`.
    ///
    /// # Errors
    ///
    /// Returns `PipelensError::Config` if the HTTP client cannot be built or the
    /// base URL cannot hold a path.
    pub fn new(settings: &Settings, limiter: Arc<RateLimiter>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("Pipelens/", env!("CARGO_PKG_VERSION")))
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| PipelensError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut builds_url = settings.base_url.clone();
        builds_url
            .path_segments_mut()
            .map_err(|()| {
                PipelensError::Config(format!("Invalid base URL: {}", settings.base_url))
            })?
            .pop_if_empty()
            .extend([
                settings.organization.as_str(),
                settings.project.as_str(),
                "_apis",
                "build",
                "builds",
            ]);

        Ok(Self {
            client,
            builds_url,
            api_version: settings.api_version.clone(),
            links: BuildLinks::new(&settings.base_url, &settings.organization, &settings.project),
            token: settings.token.clone(),
            limiter,
            max_retries: settings.max_retries,
            retry_base_delay: settings.retry_base_delay,
        })
    }

    /// Sends an authenticated GET and decodes the JSON body, retrying throttled,
    /// unavailable and timed-out calls with exponential backoff.
    ///
    /// The body is read inside the retried attempt, so a timeout while it
    /// downloads is retried like any other. Each attempt takes one rate-limit
    /// token. Authentication and not-found responses are returned immediately.
    /// An upstream `Retry-After` on a throttled response replaces the backoff
    /// delay, up to the longest backoff the retry schedule would reach.
    pub(super) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<(T, HeaderMap)> {
        let mut retry_count = 0;
        loop {
            self.limiter.acquire(1).await?;

            let failure = match self.attempt(url, query, retry_count).await {
                Ok(page) => return Ok(page),
                Err(failure) => failure,
            };
            let err = failure.error;

            if !err.is_retryable() || retry_count >= self.max_retries {
                error!("Azure DevOps request failed: {err}");
                return Err(err);
            }

            let delay = self.retry_delay(retry_count, failure.retry_after);
            warn!(
                "{err}. Retrying in {}ms ({}/{})...",
                delay.as_millis(),
                retry_count + 1,
                self.max_retries
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &Url,
        query: &[(&str, String)],
        retries: u32,
    ) -> std::result::Result<(T, HeaderMap), Failure> {
        let response = self
            .client
            .get(url.clone())
            .query(query)
            .basic_auth("", Some(self.token.as_str()))
            .send()
            .await
            .map_err(|e| transport_error(&e, retries))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
                retry_after(response.headers())
            } else {
                None
            };
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Failure {
                error: status_error(status, &body, retries),
                retry_after,
            });
        }

        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, retries))?;
        let page = serde_json::from_slice(&body).map_err(|e| {
            PipelensError::Upstream(format!("Invalid response from Azure DevOps: {e}"))
        })?;

        Ok((page, headers))
    }

    /// Delay before retry number `retry_count + 1`.
    fn retry_delay(&self, retry_count: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = |n: u32| self.retry_base_delay.saturating_mul(2u32.saturating_pow(n));
        match retry_after {
            Some(hint) => hint.min(backoff(self.max_retries)),
            None => backoff(retry_count),
        }
    }
}

/// A failed attempt and the upstream's requested wait, if it sent one.
struct Failure {
    error: PipelensError,
    retry_after: Option<Duration>,
}

impl From<PipelensError> for Failure {
    fn from(error: PipelensError) -> Self {
        Self {
            error,
            retry_after: None,
        }
    }
}

/// Maps a failure to reach the server or to read its response.
fn transport_error(e: &reqwest::Error, retries: u32) -> Failure {
    let error = if e.is_timeout() {
        PipelensError::UpstreamTimeout { retries }
    } else if e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        PipelensError::UpstreamUnavailable {
            reason: e.to_string(),
            retries,
        }
    } else {
        PipelensError::Upstream(e.to_string())
    };
    error.into()
}

/// Seconds form of `Retry-After`; the HTTP-date form is ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn status_error(status: StatusCode, body: &str, retries: u32) -> PipelensError {
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        StatusCode::UNAUTHORIZED => PipelensError::UpstreamAuth {
            status: status.as_u16(),
            message: format!("Unauthorized: verify the AZDO_PAT token. Response: {body}"),
        },
        StatusCode::FORBIDDEN => PipelensError::UpstreamAuth {
            status: status.as_u16(),
            message: format!("Forbidden: the token lacks Build (read) permission. Response: {body}"),
        },
        StatusCode::NOT_FOUND => PipelensError::UpstreamNotFound(body),
        StatusCode::TOO_MANY_REQUESTS => PipelensError::UpstreamRateLimited { retries },
        s if s.is_server_error() => PipelensError::UpstreamUnavailable {
            reason: format!("status {}", s.as_u16()),
            retries,
        },
        s => PipelensError::Upstream(format!("status {}: {body}", s.as_u16())),
    }
}
