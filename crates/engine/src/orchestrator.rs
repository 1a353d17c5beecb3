//! Periodic sync loop.
//!
//! Each tick fans out over active accounts, bounded by a semaphore, with
//! one in-flight sync per account at a time; a tick that finds an account
//! mid-sync skips it rather than queueing behind it. Crash safety comes
//! entirely from the idempotent writer, so there are no persisted
//! in-progress markers to clean up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use ledger_core::{default_pricing_rules, Account};
use ledger_db::Db;
use providers::{AdapterRegistry, ProviderError};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::credentials::CredentialStore;
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::evaluator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Fetching,
    Normalizing,
    Writing,
    Failed,
}

struct Inner {
    db: Arc<Mutex<Db>>,
    registry: AdapterRegistry,
    credentials: Arc<dyn CredentialStore>,
    dispatcher: Arc<Dispatcher>,
    config: EngineConfig,
    in_flight: std::sync::Mutex<HashSet<i64>>,
    phases: std::sync::Mutex<HashMap<i64, SyncPhase>>,
    semaphore: Arc<Semaphore>,
    trigger: Notify,
    cancel: CancellationToken,
}

pub struct Orchestrator {
    inner: Arc<Inner>,
    handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Mutex<Db>>,
        registry: AdapterRegistry,
        credentials: Arc<dyn CredentialStore>,
        dispatcher: Arc<Dispatcher>,
        config: EngineConfig,
    ) -> Self {
        let permits = config.max_concurrent_syncs.max(1);
        Self {
            inner: Arc::new(Inner {
                db,
                registry,
                credentials,
                dispatcher,
                config,
                in_flight: std::sync::Mutex::new(HashSet::new()),
                phases: std::sync::Mutex::new(HashMap::new()),
                semaphore: Arc::new(Semaphore::new(permits)),
                trigger: Notify::new(),
                cancel: CancellationToken::new(),
            }),
            handle: std::sync::Mutex::new(None),
        }
    }

    /// Spawn the scheduler loop. Idempotent; a second call is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *handle = Some(tokio::spawn(run_loop(inner)));
    }

    /// Cancel the loop and wait for in-flight account syncs to finish.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = {
            let mut slot = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Force a sync pass outside the schedule.
    pub fn trigger_now(&self) {
        self.inner.trigger.notify_one();
    }

    pub fn phase(&self, account_id: i64) -> SyncPhase {
        self.inner
            .phases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&account_id)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    /// Run exactly one fan-out pass and wait for it. Used by tests and
    /// one-shot invocations; the scheduler loop calls the same path.
    pub async fn sync_once(&self) {
        let mut tasks = JoinSet::new();
        fan_out(&self.inner, &mut tasks).await;
        while tasks.join_next().await.is_some() {}
    }
}

async fn run_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.config.sync_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut tasks: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => break,
            _ = ticker.tick() => fan_out(&inner, &mut tasks).await,
            _ = inner.trigger.notified() => {
                tracing::info!("manual sync trigger");
                fan_out(&inner, &mut tasks).await;
            }
        }
        // Reap finished syncs without blocking the loop.
        while tasks.try_join_next().is_some() {}
    }
    while tasks.join_next().await.is_some() {}
    tracing::info!("sync loop stopped");
}

async fn fan_out(inner: &Arc<Inner>, tasks: &mut JoinSet<()>) {
    let accounts = match inner.db.lock().await.list_active_accounts() {
        Ok(accounts) => accounts,
        Err(err) => {
            tracing::error!(error = %err, "could not list accounts, skipping tick");
            return;
        }
    };

    for account in accounts {
        {
            let mut in_flight = inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !in_flight.insert(account.id) {
                tracing::debug!(account_id = account.id, "sync already in flight, skipping");
                continue;
            }
        }
        let permit = match Arc::clone(&inner.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let inner = Arc::clone(inner);
        tasks.spawn(async move {
            let _permit = permit;
            let account_id = account.id;
            if let Err(err) = sync_account(&inner, &account).await {
                set_phase(&inner, account_id, SyncPhase::Failed);
                tracing::error!(account_id, error = %err, "account sync failed");
            } else {
                set_phase(&inner, account_id, SyncPhase::Idle);
            }
            inner
                .in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&account_id);
        });
    }
}

fn set_phase(inner: &Inner, account_id: i64, phase: SyncPhase) {
    inner
        .phases
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(account_id, phase);
}

/// Fetch window for an account: re-fetch a few days before the last sync
/// so late provider corrections converge through the idempotent writer.
fn sync_window(account: &Account, today: NaiveDate, lookback_days: i64) -> (NaiveDate, NaiveDate) {
    const FIRST_SYNC_DAYS: i64 = 30;
    let since = account
        .last_sync_at
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.date_naive() - chrono::Duration::days(lookback_days))
        .unwrap_or_else(|| today - chrono::Duration::days(FIRST_SYNC_DAYS));
    (since.min(today), today)
}

async fn sync_account(inner: &Arc<Inner>, account: &Account) -> Result<()> {
    let now = Utc::now();
    set_phase(inner, account.id, SyncPhase::Fetching);

    let outcome = fetch_normalize_write(inner, account, now).await;
    match outcome {
        Ok(written) => {
            tracing::info!(
                account_id = account.id,
                provider = %account.provider,
                records = written,
                "sync complete"
            );
            evaluate_and_notify(inner, account, now).await
        }
        Err(err) => {
            record_failure(inner, account, &err, now).await?;
            Err(err)
        }
    }
}

async fn fetch_normalize_write(
    inner: &Arc<Inner>,
    account: &Account,
    now: DateTime<Utc>,
) -> Result<usize> {
    let adapter = inner
        .registry
        .get(&account.provider)
        .ok_or_else(|| EngineError::UnknownProvider(account.provider.clone()))?;
    let handle = account
        .credential_handle
        .as_deref()
        .ok_or_else(|| crate::credentials::CredentialError::Missing("<unset>".to_string()))?;
    let credential = inner.credentials.decrypt(handle)?;

    let (since, until) = sync_window(account, now.date_naive(), inner.config.lookback_days);

    let mut attempt: u32 = 0;
    let entries = loop {
        let call = adapter.fetch_usage(&credential, since, until);
        let result = tokio::time::timeout(inner.config.provider_call_timeout, call).await;
        let err = match result {
            Ok(Ok(entries)) => break entries,
            Ok(Err(err)) => EngineError::Provider(err),
            Err(_) => EngineError::Timeout,
        };
        attempt += 1;
        if !err.is_retryable() || attempt > inner.config.retry_ceiling {
            return Err(err);
        }
        let delay = retry_delay(&err, inner.config.retry_base, attempt);
        tracing::warn!(
            account_id = account.id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "provider call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    };

    set_phase(inner, account.id, SyncPhase::Normalizing);
    let rules = default_pricing_rules();
    let mut records = Vec::with_capacity(entries.len());
    for entry in &entries {
        records.push(providers::normalize(account.id, &account.provider, entry, &rules)?);
    }

    set_phase(inner, account.id, SyncPhase::Writing);
    let written = records.len();
    {
        let mut db = inner.db.lock().await;
        for record in &records {
            db.upsert_usage_record(record)?;
        }
        db.update_last_sync(account.id, &now.to_rfc3339())?;
    }
    Ok(written)
}

fn retry_delay(err: &EngineError, base: Duration, attempt: u32) -> Duration {
    const MAX_DELAY: Duration = Duration::from_secs(60);
    if let EngineError::Provider(ProviderError::RateLimited {
        retry_after: Some(suggested),
    }) = err
    {
        return (*suggested).min(MAX_DELAY);
    }
    base.saturating_mul(1 << attempt.min(10)).min(MAX_DELAY)
}

async fn evaluate_and_notify(inner: &Arc<Inner>, account: &Account, now: DateTime<Utc>) -> Result<()> {
    let evaluation = {
        let db = inner.db.lock().await;
        evaluator::evaluate_account(&db, account, now)?
    };
    if let Some(alert) = evaluation.alert {
        // Refreshes of an already-open alert stay quiet; only new rows
        // and escalations fan out to the queue.
        if evaluation.should_notify && !inner.config.routes.is_empty() {
            inner
                .dispatcher
                .enqueue(
                    &alert,
                    &inner.config.routes,
                    inner.config.max_send_attempts,
                    now,
                )
                .await?;
        }
    }

    let spike = {
        let db = inner.db.lock().await;
        evaluator::detect_unusual_activity(&db, account, now)?
    };
    if let Some(alert) = spike {
        if alert.created_at == alert.last_triggered_at && !inner.config.routes.is_empty() {
            inner
                .dispatcher
                .enqueue(
                    &alert,
                    &inner.config.routes,
                    inner.config.max_send_attempts,
                    now,
                )
                .await?;
        }
    }
    Ok(())
}

async fn record_failure(
    inner: &Arc<Inner>,
    account: &Account,
    err: &EngineError,
    now: DateTime<Utc>,
) -> Result<()> {
    let alert = {
        let db = inner.db.lock().await;
        evaluator::record_sync_failure(&db, account, &err.to_string(), now)?
    };
    if alert.created_at == alert.last_triggered_at && !inner.config.routes.is_empty() {
        inner
            .dispatcher
            .enqueue(
                &alert,
                &inner.config.routes,
                inner.config.max_send_attempts,
                now,
            )
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(last_sync_at: Option<&str>) -> Account {
        Account {
            id: 1,
            provider: "openai".to_string(),
            display_name: "prod".to_string(),
            monthly_budget: None,
            credential_handle: Some("OPENAI_KEY".to_string()),
            is_active: true,
            last_sync_at: last_sync_at.map(str::to_string),
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn first_sync_looks_back_a_month() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        let (since, until) = sync_window(&account(None), today, 3);
        assert_eq!(since, NaiveDate::from_ymd_opt(2026, 1, 11).unwrap());
        assert_eq!(until, today);
    }

    #[test]
    fn later_syncs_re_fetch_the_lookback_window() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        let (since, _) = sync_window(&account(Some("2026-02-09T04:00:00+00:00")), today, 3);
        assert_eq!(since, NaiveDate::from_ymd_opt(2026, 2, 6).unwrap());
    }

    #[test]
    fn window_never_starts_after_today() {
        let today = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
        let (since, until) = sync_window(&account(Some("2026-03-01T00:00:00+00:00")), today, 0);
        assert!(since <= until);
    }

    #[test]
    fn retry_delay_doubles_and_honors_suggestions() {
        let base = Duration::from_millis(500);
        let transient = EngineError::Provider(ProviderError::Transient("503".to_string()));
        assert_eq!(retry_delay(&transient, base, 1), Duration::from_secs(1));
        assert_eq!(retry_delay(&transient, base, 2), Duration::from_secs(2));

        let limited = EngineError::Provider(ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        });
        assert_eq!(retry_delay(&limited, base, 1), Duration::from_secs(7));
    }
}
