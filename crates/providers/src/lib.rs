use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use ledger_core::RawUsageEntry;

pub mod anthropic;
pub mod normalize;
pub mod openai;
pub mod registry;

pub use anthropic::AnthropicAdapter;
pub use normalize::normalize;
pub use openai::OpenAiAdapter;
pub use registry::AdapterRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Bad or expired credential. Never retried automatically; the
    /// credential has to be fixed externally.
    #[error("authentication rejected: {0}")]
    Auth(String),
    /// Provider throttled us; retryable after the suggested delay.
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    /// Network failure or 5xx; retryable with backoff.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Response arrived but could not be interpreted.
    #[error("malformed provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. } | ProviderError::Transient(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

/// One external usage source. Implementations are stateless pure reads:
/// no side effects on the provider, no local mutation.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> &'static str;

    /// Fetch raw usage for [since, until], inclusive daily buckets,
    /// ordered by date ascending.
    async fn fetch_usage(
        &self,
        credential: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<RawUsageEntry>, ProviderError>;
}

/// Map an HTTP status to the adapter error taxonomy. Shared by all
/// HTTP-backed adapters.
pub(crate) fn error_for_status(
    status: reqwest::StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> ProviderError {
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        ProviderError::Auth(format!("provider returned {status}"))
    } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        ProviderError::RateLimited { retry_after }
    } else if status.is_server_error() {
        ProviderError::Transient(format!("provider returned {status}"))
    } else {
        ProviderError::Decode(format!("unexpected status {status}: {body}"))
    }
}

pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
