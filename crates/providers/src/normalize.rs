//! Turns raw provider entries into canonical usage records.
//!
//! A provider-reported cost always wins over the computed estimate;
//! token-only entries are priced from the rules table. Either way the
//! timestamp snaps to its UTC day bucket so the idempotency key is stable
//! across repeated syncs.

use chrono::{DateTime, Utc};
use ledger_core::pricing::{compute_cost, find_rule, PricingRule};
use ledger_core::{bucket_day, RawUsageEntry, UsageRecord, UsageSource};
use rust_decimal::Decimal;

use crate::ProviderError;

pub fn normalize(
    account_id: i64,
    provider: &str,
    entry: &RawUsageEntry,
    rules: &[PricingRule],
) -> Result<UsageRecord, ProviderError> {
    let occurred_at = DateTime::parse_from_rfc3339(&entry.occurred_at)
        .map_err(|err| {
            ProviderError::Decode(format!("bad usage timestamp {:?}: {err}", entry.occurred_at))
        })?
        .with_timezone(&Utc);

    let cost = match entry.reported_cost {
        Some(reported) => reported,
        None => {
            let model = entry.model.as_deref().unwrap_or("*");
            match find_rule(rules, provider, model, &entry.request_kind) {
                Some(rule) => compute_cost(entry.input_tokens, entry.output_tokens, rule),
                None => {
                    tracing::warn!(provider, model, kind = %entry.request_kind, "no pricing rule, recording zero cost");
                    Decimal::ZERO
                }
            }
        }
    };

    Ok(UsageRecord {
        account_id,
        provider: provider.to_string(),
        bucket_date: bucket_day(occurred_at),
        request_kind: entry.request_kind.clone(),
        input_tokens: entry.input_tokens,
        output_tokens: entry.output_tokens,
        cost,
        source: UsageSource::Api,
    })
}
