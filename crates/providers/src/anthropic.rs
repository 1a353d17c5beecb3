//! Anthropic adapter, backed by the Admin API usage report.
//!
//! Requires an admin key (`sk-ant-admin...`); a workspace key is rejected
//! up front rather than burning a request that will 401. Usage arrives in
//! daily buckets grouped by model; cache-creation and cache-read tokens
//! count toward input.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::RawUsageEntry;
use serde::Deserialize;

use crate::{error_for_status, parse_retry_after, ProviderAdapter, ProviderError};

const BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const ADMIN_KEY_PREFIX: &str = "sk-ant-admin";
const PAGE_LIMIT: u32 = 31;
const REQUEST_TIMEOUT_SECS: u64 = 15;

pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
        }
    }

    async fn fetch_page(
        &self,
        credential: &str,
        since: NaiveDate,
        until: NaiveDate,
        page: Option<&str>,
    ) -> Result<UsageReportResponse, ProviderError> {
        let url = format!("{}/v1/organizations/usage_report/messages", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("starting_at", format!("{since}T00:00:00Z")),
            ("ending_at", format!("{}T00:00:00Z", until + chrono::Duration::days(1))),
            ("bucket_width", "1d".to_string()),
            ("group_by[]", "model".to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        if let Some(page) = page {
            query.push(("page", page.to_string()));
        }

        let response = self
            .client
            .get(&url)
            .header("x-api-key", credential)
            .header("anthropic-version", API_VERSION)
            .query(&query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, retry_after, &body));
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider(&self) -> &'static str {
        "anthropic"
    }

    async fn fetch_usage(
        &self,
        credential: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<RawUsageEntry>, ProviderError> {
        if !credential.starts_with(ADMIN_KEY_PREFIX) {
            return Err(ProviderError::Auth(
                "usage report requires an admin key".to_string(),
            ));
        }

        let mut buckets = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let response = self
                .fetch_page(credential, since, until, page.as_deref())
                .await?;
            buckets.extend(response.data);
            match (response.has_more, response.next_page) {
                (true, Some(next)) => page = Some(next),
                _ => break,
            }
        }

        aggregate_buckets(buckets)
    }
}

#[derive(Debug, Deserialize)]
struct UsageReportResponse {
    #[serde(default)]
    data: Vec<UsageBucket>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBucket {
    starting_at: String,
    #[serde(default)]
    results: Vec<UsageResult>,
}

#[derive(Debug, Deserialize)]
struct UsageResult {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    uncached_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Fold bucket results into one entry per (day, model), tokens summed.
fn aggregate_buckets(buckets: Vec<UsageBucket>) -> Result<Vec<RawUsageEntry>, ProviderError> {
    let mut totals: BTreeMap<(String, Option<String>), (u64, u64)> = BTreeMap::new();
    for bucket in buckets {
        let occurred_at = DateTime::parse_from_rfc3339(&bucket.starting_at)
            .map_err(|err| {
                ProviderError::Decode(format!("bad bucket timestamp {:?}: {err}", bucket.starting_at))
            })?
            .with_timezone(&Utc)
            .to_rfc3339();
        for result in bucket.results {
            let input = result.uncached_input_tokens
                + result.cache_creation_input_tokens
                + result.cache_read_input_tokens;
            let entry = totals
                .entry((occurred_at.clone(), result.model))
                .or_insert((0, 0));
            entry.0 += input;
            entry.1 += result.output_tokens;
        }
    }

    Ok(totals
        .into_iter()
        .map(|((occurred_at, model), (input_tokens, output_tokens))| RawUsageEntry {
            occurred_at,
            model,
            request_kind: "completion".to_string(),
            input_tokens,
            output_tokens,
            reported_cost: None,
        })
        .collect())
}
