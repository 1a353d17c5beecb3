//! Budget evaluation against the current calendar month.
//!
//! Classification is pure; persistence follows the one-unacknowledged-row
//! rule. Crossing a threshold creates or refreshes the row for that kind,
//! crossing from approaching into exceeded escalates the existing row in
//! place, and dropping back below a threshold changes nothing. Only
//! acknowledgment clears an alert.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use ledger_core::{
    classify_budget, budget_percent, AlertEvent, AlertKind, Account, BudgetState,
    APPROACHING_THRESHOLD_PCT, EXCEEDED_THRESHOLD_PCT,
};
use ledger_db::Db;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub state: BudgetState,
    pub percent: Option<Decimal>,
    pub month_cost: Decimal,
    /// The alert created, refreshed, or escalated by this evaluation.
    pub alert: Option<AlertEvent>,
    /// True when this evaluation opened a new alert or escalated an
    /// existing one; refreshes of an already-open alert stay quiet.
    pub should_notify: bool,
}

/// First instant of the month containing `now`, RFC 3339.
fn month_start(now: DateTime<Utc>) -> String {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .unwrap_or_else(|| now.date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc();
    first.to_rfc3339()
}

pub fn evaluate_account(db: &Db, account: &Account, now: DateTime<Utc>) -> Result<Evaluation> {
    let start = month_start(now);
    let end = now.to_rfc3339();
    let month_cost = db.cost_in_range(account.id, &start, &end)?;

    let Some(percent) = budget_percent(month_cost, account.monthly_budget) else {
        return Ok(Evaluation {
            state: BudgetState::Ok,
            percent: None,
            month_cost,
            alert: None,
            should_notify: false,
        });
    };

    let state = classify_budget(percent);
    let observed = percent.round_dp(2);
    let now_str = now.to_rfc3339();
    let mut should_notify = false;

    let alert_id = match state {
        BudgetState::Ok => None,
        BudgetState::Approaching => {
            // An unacknowledged exceeded row already represents a worse
            // crossing; do not add a second, milder one under it.
            if db
                .unacknowledged_alert(account.id, AlertKind::LimitExceeded)?
                .is_some()
            {
                None
            } else {
                should_notify = db
                    .unacknowledged_alert(account.id, AlertKind::ApproachingLimit)?
                    .is_none();
                let message = budget_message(account, month_cost, observed, "approaching its");
                Some(db.upsert_alert(
                    account.id,
                    AlertKind::ApproachingLimit,
                    APPROACHING_THRESHOLD_PCT,
                    Some(observed),
                    &message,
                    &now_str,
                )?)
            }
        }
        BudgetState::Exceeded => {
            let message = budget_message(account, month_cost, observed, "over its");
            match db.unacknowledged_alert(account.id, AlertKind::ApproachingLimit)? {
                Some(existing) => {
                    db.escalate_alert(
                        existing.id,
                        AlertKind::LimitExceeded,
                        EXCEEDED_THRESHOLD_PCT,
                        Some(observed),
                        &message,
                        &now_str,
                    )?;
                    should_notify = true;
                    Some(existing.id)
                }
                None => {
                    should_notify = db
                        .unacknowledged_alert(account.id, AlertKind::LimitExceeded)?
                        .is_none();
                    Some(db.upsert_alert(
                        account.id,
                        AlertKind::LimitExceeded,
                        EXCEEDED_THRESHOLD_PCT,
                        Some(observed),
                        &message,
                        &now_str,
                    )?)
                }
            }
        }
    };

    let alert = match alert_id {
        Some(id) => db.get_alert(id)?,
        None => None,
    };

    if let Some(alert) = &alert {
        tracing::info!(
            account_id = account.id,
            kind = alert.kind.as_str(),
            observed = %observed,
            "budget alert active"
        );
    }

    Ok(Evaluation {
        state,
        percent: Some(percent),
        month_cost,
        alert,
        should_notify,
    })
}

fn budget_message(account: &Account, cost: Decimal, observed: Decimal, verb: &str) -> String {
    let budget = account
        .monthly_budget
        .map(|b| b.to_string())
        .unwrap_or_default();
    format!(
        "{} is {verb} monthly budget: ${} of ${budget} ({observed}%)",
        account.display_name,
        cost.round_dp(2),
    )
}

const ANOMALY_SENSITIVITY: f64 = 2.0;
const BASELINE_DAYS: i64 = 30;
const MIN_HISTORY_DAYS: usize = 7;

/// Spike detection against a rolling 30-day baseline: today's spend is
/// unusual when its z-score against the baseline mean exceeds the
/// sensitivity threshold. Statistics run in floats; the costs themselves
/// stay `Decimal` in the ledger. Returns the open alert when today is a
/// spike, following the same one-unacknowledged-row rule.
pub fn detect_unusual_activity(
    db: &Db,
    account: &Account,
    now: DateTime<Utc>,
) -> Result<Option<AlertEvent>> {
    let today = ledger_core::bucket_day(now);
    let baseline_start = ledger_core::bucket_day(now - chrono::Duration::days(BASELINE_DAYS));
    let baseline = db.daily_costs(account.id, &baseline_start, &today)?;
    if baseline.len() < MIN_HISTORY_DAYS {
        return Ok(None);
    }

    let today_cost = db.cost_in_range(account.id, &today, &now.to_rfc3339())?;
    let values: Vec<f64> = baseline
        .iter()
        .map(|(_, cost)| cost.to_f64().unwrap_or(0.0))
        .collect();
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return Ok(None);
    }

    let today_f = today_cost.to_f64().unwrap_or(0.0);
    let z = (today_f - mean) / std_dev;
    if z <= ANOMALY_SENSITIVITY {
        return Ok(None);
    }

    let message = format!(
        "unusual spend for {}: ${} today vs ${:.2} daily average",
        account.display_name,
        today_cost.round_dp(2),
        mean,
    );
    tracing::warn!(account_id = account.id, z_score = z, "usage spike detected");
    let id = db.upsert_alert(
        account.id,
        AlertKind::UnusualActivity,
        0,
        None,
        &message,
        &now.to_rfc3339(),
    )?;
    db.get_alert(id).map_err(Into::into)
}

/// One unacknowledged sync-failure row per account, refreshed on every
/// failed tick, so a broken credential cannot spam the queue.
pub fn record_sync_failure(
    db: &Db,
    account: &Account,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<AlertEvent> {
    let message = format!("sync failed for {}: {detail}", account.display_name);
    let id = db.upsert_alert(
        account.id,
        AlertKind::SyncFailure,
        0,
        None,
        &message,
        &now.to_rfc3339(),
    )?;
    let alert = db
        .get_alert(id)?
        .ok_or(ledger_db::DbError::UnknownValue {
            field: "alert.id",
            value: id.to_string(),
        })?;
    Ok(alert)
}
