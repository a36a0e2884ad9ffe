use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelensError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Azure DevOps rejected the credentials (status {status}): {message}")]
    UpstreamAuth { status: u16, message: String },

    #[error("Azure DevOps organization or project not found: {0}")]
    UpstreamNotFound(String),

    #[error("Azure DevOps is throttling requests (gave up after {retries} retries)")]
    UpstreamRateLimited { retries: u32 },

    #[error("Azure DevOps is unavailable ({reason}, gave up after {retries} retries)")]
    UpstreamUnavailable { reason: String, retries: u32 },

    #[error("Azure DevOps request timed out (gave up after {retries} retries)")]
    UpstreamTimeout { retries: u32 },

    #[error("Azure DevOps request failed: {0}")]
    Upstream(String),

    #[error("Too many requests, retry in {}ms", .retry_after.as_millis())]
    RateLimitExceeded { retry_after: Duration },
}

impl PipelensError {
    /// Whether the upstream client should try the same request again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UpstreamRateLimited { .. }
                | Self::UpstreamUnavailable { .. }
                | Self::UpstreamTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelensError>;
