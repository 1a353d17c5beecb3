//! OpenAI adapter, backed by the dashboard billing usage endpoint.
//!
//! The billing API reports cost in cents per day (no token counts), so
//! entries carry a provider-reported cost and zero token totals.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::RawUsageEntry;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::{error_for_status, parse_retry_after, ProviderAdapter, ProviderError};

const BASE_URL: &str = "https://api.openai.com";
const REQUEST_TIMEOUT_SECS: u64 = 15;

pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
}

impl Default for OpenAiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenAiAdapter {
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
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider(&self) -> &'static str {
        "openai"
    }

    async fn fetch_usage(
        &self,
        credential: &str,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<RawUsageEntry>, ProviderError> {
        let url = format!("{}/v1/dashboard/billing/usage", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(credential)
            .query(&[
                ("start_date", since.to_string()),
                // end_date is exclusive upstream; add a day so `until` is included.
                ("end_date", (until + chrono::Duration::days(1)).to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, retry_after, &body));
        }

        let payload: BillingUsageResponse = response.json().await?;
        Ok(parse_billing_usage(payload))
    }
}

#[derive(Debug, Deserialize)]
struct BillingUsageResponse {
    #[serde(default)]
    data: Vec<BillingUsageDay>,
}

#[derive(Debug, Deserialize)]
struct BillingUsageDay {
    /// Unix epoch seconds at the start of the day.
    timestamp: i64,
    #[serde(default)]
    line_items: Vec<BillingLineItem>,
}

#[derive(Debug, Deserialize)]
struct BillingLineItem {
    /// Cost in cents.
    #[serde(default)]
    cost: Decimal,
}

fn parse_billing_usage(payload: BillingUsageResponse) -> Vec<RawUsageEntry> {
    let cents = Decimal::from(100);
    let mut entries: Vec<RawUsageEntry> = payload
        .data
        .into_iter()
        .filter_map(|day| {
            let occurred_at = DateTime::<Utc>::from_timestamp(day.timestamp, 0)?;
            let cost_cents: Decimal = day.line_items.iter().map(|item| item.cost).sum();
            Some(RawUsageEntry {
                occurred_at: occurred_at.to_rfc3339(),
                model: None,
                request_kind: "completion".to_string(),
                input_tokens: 0,
                output_tokens: 0,
                reported_cost: Some((cost_cents / cents).round_dp(6)),
            })
        })
        .collect();
    entries.sort_by(|a, b| a.occurred_at.cmp(&b.occurred_at));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn billing_usage_parses_cents_to_dollars() {
        let payload: BillingUsageResponse = serde_json::from_value(serde_json::json!({
            "total_usage": 525.0,
            "data": [
                {
                    "timestamp": 1_770_681_600, // 2026-02-10T00:00:00Z
                    "line_items": [
                        {"name": "gpt-4", "cost": 500.0},
                        {"name": "gpt-3.5-turbo", "cost": 25.0}
                    ]
                }
            ]
        }))
        .expect("decode");

        let entries = parse_billing_usage(payload);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reported_cost, Some(dec!(5.25)));
        assert!(entries[0].occurred_at.starts_with("2026-02-10"));
    }

    #[test]
    fn empty_days_still_produce_zero_cost_entries() {
        let payload: BillingUsageResponse = serde_json::from_value(serde_json::json!({
            "data": [{"timestamp": 1_770_681_600, "line_items": []}]
        }))
        .expect("decode");

        let entries = parse_billing_usage(payload);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reported_cost, Some(dec!(0)));
    }
}
