use chrono::{DateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub mod pricing;

pub use pricing::{compute_cost, default_pricing_rules, model_matches_pattern, PricingRule};

/// One credentialed connection to one provider. Created and deleted by
/// account management; the engine only ever touches `last_sync_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub provider: String,
    pub display_name: String,
    pub monthly_budget: Option<Decimal>,
    pub credential_handle: Option<String>,
    pub is_active: bool,
    pub last_sync_at: Option<String>,
    pub created_at: String,
}

/// Raw per-period usage as reported by a provider, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawUsageEntry {
    pub occurred_at: String,
    pub model: Option<String>,
    pub request_kind: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Cost as reported by the provider itself, when its API exposes one.
    pub reported_cost: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSource {
    Api,
    Manual,
}

impl UsageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageSource::Api => "api",
            UsageSource::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "api" => Some(UsageSource::Api),
            "manual" => Some(UsageSource::Manual),
            _ => None,
        }
    }
}

/// Canonical ingested fact. The tuple (account_id, provider, bucket_date,
/// request_kind) is the idempotency key; re-ingestion of the same key
/// updates the existing row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub account_id: i64,
    pub provider: String,
    pub bucket_date: String,
    pub request_kind: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Decimal,
    pub source: UsageSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ApproachingLimit,
    LimitExceeded,
    UnusualActivity,
    SyncFailure,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::ApproachingLimit => "approaching_limit",
            AlertKind::LimitExceeded => "limit_exceeded",
            AlertKind::UnusualActivity => "unusual_activity",
            AlertKind::SyncFailure => "sync_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "approaching_limit" => Some(AlertKind::ApproachingLimit),
            "limit_exceeded" => Some(AlertKind::LimitExceeded),
            "unusual_activity" => Some(AlertKind::UnusualActivity),
            "sync_failure" => Some(AlertKind::SyncFailure),
            _ => None,
        }
    }
}

/// A detected threshold crossing. At most one unacknowledged event of a
/// given kind exists per account; re-evaluation updates it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,
    pub account_id: i64,
    pub kind: AlertKind,
    pub threshold_pct: u32,
    pub observed_pct: Option<Decimal>,
    pub message: String,
    pub acknowledged: bool,
    pub created_at: String,
    pub last_triggered_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Email,
    Slack,
    Discord,
    Teams,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Slack => "slack",
            ChannelKind::Discord => "discord",
            ChannelKind::Teams => "teams",
            ChannelKind::Webhook => "webhook",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email" => Some(ChannelKind::Email),
            "slack" => Some(ChannelKind::Slack),
            "discord" => Some(ChannelKind::Discord),
            "teams" => Some(ChannelKind::Teams),
            "webhook" => Some(ChannelKind::Webhook),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Sent,
    Failed,
    RateLimited,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Sent => "sent",
            TaskStatus::Failed => "failed",
            TaskStatus::RateLimited => "rate_limited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "sent" => Some(TaskStatus::Sent),
            "failed" => Some(TaskStatus::Failed),
            "rate_limited" => Some(TaskStatus::RateLimited),
            _ => None,
        }
    }
}

/// One attempted delivery of one alert to one channel for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: i64,
    pub alert_id: i64,
    pub user_id: i64,
    pub channel: ChannelKind,
    pub recipient: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub sent_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: i64,
    pub task_id: Option<i64>,
    pub user_id: i64,
    pub channel: ChannelKind,
    pub status: TaskStatus,
    pub duration_ms: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetState {
    Ok,
    Approaching,
    Exceeded,
}

pub const APPROACHING_THRESHOLD_PCT: u32 = 80;
pub const EXCEEDED_THRESHOLD_PCT: u32 = 100;

/// Classify percent-of-budget consumed into the three budget states.
pub fn classify_budget(percent: Decimal) -> BudgetState {
    if percent >= Decimal::from(EXCEEDED_THRESHOLD_PCT) {
        BudgetState::Exceeded
    } else if percent >= Decimal::from(APPROACHING_THRESHOLD_PCT) {
        BudgetState::Approaching
    } else {
        BudgetState::Ok
    }
}

/// Percent of budget consumed, or None when no positive budget is set.
pub fn budget_percent(cost: Decimal, budget: Option<Decimal>) -> Option<Decimal> {
    let budget = budget?;
    if budget <= Decimal::ZERO {
        return None;
    }
    Some(cost / budget * Decimal::from(100))
}

/// Snap a timestamp to its day bucket: midnight UTC, RFC 3339. The same
/// wall-clock instant always maps to the same bucket, so repeated syncs
/// compute the same idempotency key.
pub fn bucket_day(ts: DateTime<Utc>) -> String {
    let midnight = ts
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc();
    midnight.to_rfc3339()
}
