//! Drains the notification queue.
//!
//! Order of checks per task is fixed: rate limit first (a capped pair
//! makes zero outbound calls), then webhook validation (on every attempt,
//! retries included), then render and send. Every actual attempt appends
//! a history row; rate-limited passes do not, since nothing left the
//! process. Sends for the same (user, channel) pair are serialized so two
//! concurrent passes cannot both clear the window check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use ledger_core::{AlertEvent, ChannelKind, NotificationTask, TaskStatus};
use ledger_db::Db;
use tokio::sync::Mutex;

use crate::config::NotificationRoute;
use crate::error::Result;
use crate::rate_limiter::RateLimiter;
use crate::sender::NotificationSender;
use crate::webhook;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub sent: u32,
    pub failed: u32,
    pub rate_limited: u32,
}

pub struct Dispatcher {
    db: Arc<Mutex<Db>>,
    limiter: RateLimiter,
    sender: Arc<dyn NotificationSender>,
    batch: u32,
    send_timeout: std::time::Duration,
    pair_locks: Mutex<HashMap<(i64, ChannelKind), Arc<Mutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<Mutex<Db>>,
        limiter: RateLimiter,
        sender: Arc<dyn NotificationSender>,
        batch: u32,
        send_timeout: std::time::Duration,
    ) -> Self {
        Self {
            db,
            limiter,
            sender,
            batch,
            send_timeout,
            pair_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Queue one task per route for an alert.
    pub async fn enqueue(
        &self,
        alert: &AlertEvent,
        routes: &[NotificationRoute],
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let db = self.db.lock().await;
        let now_str = now.to_rfc3339();
        let mut ids = Vec::with_capacity(routes.len());
        for route in routes {
            let id = db.enqueue_notification(
                alert.id,
                route.user_id,
                route.channel,
                &route.recipient,
                route.priority,
                max_attempts,
                &now_str,
            )?;
            ids.push(id);
        }
        Ok(ids)
    }

    async fn pair_lock(&self, user_id: i64, channel: ChannelKind) -> Arc<Mutex<()>> {
        let mut locks = self.pair_locks.lock().await;
        locks
            .entry((user_id, channel))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One pass over the queue. Failures are isolated per task; a bad
    /// task never aborts the rest of the batch.
    pub async fn process_pending(&self, now: DateTime<Utc>) -> Result<DispatchSummary> {
        let tasks = self.db.lock().await.pending_notifications(self.batch)?;
        let mut summary = DispatchSummary::default();
        for task in tasks {
            match self.process_task(&task, now).await {
                Ok(TaskStatus::Sent) => summary.sent += 1,
                Ok(TaskStatus::RateLimited) => summary.rate_limited += 1,
                Ok(_) => summary.failed += 1,
                Err(err) => {
                    summary.failed += 1;
                    tracing::error!(task_id = task.id, error = %err, "dispatch pass error");
                }
            }
        }
        Ok(summary)
    }

    /// Periodic drain loop for the server binary. Stops at the next tick
    /// after cancellation.
    pub async fn run(
        self: Arc<Self>,
        interval: std::time::Duration,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.process_pending(Utc::now()).await {
                        Ok(summary) if summary != DispatchSummary::default() => {
                            tracing::info!(
                                sent = summary.sent,
                                failed = summary.failed,
                                rate_limited = summary.rate_limited,
                                "dispatch pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => tracing::error!(error = %err, "dispatch pass aborted"),
                    }
                }
            }
        }
    }

    async fn process_task(&self, task: &NotificationTask, now: DateTime<Utc>) -> Result<TaskStatus> {
        let lock = self.pair_lock(task.user_id, task.channel).await;
        let _serialized = lock.lock().await;

        let alert = {
            let db = self.db.lock().await;

            if !self.limiter.can_send(&db, task.user_id, task.channel, now)? {
                db.mark_notification_rate_limited(task.id)?;
                tracing::warn!(
                    task_id = task.id,
                    user_id = task.user_id,
                    channel = task.channel.as_str(),
                    "delivery window exhausted, deferring"
                );
                return Ok(TaskStatus::RateLimited);
            }

            match db.get_alert(task.alert_id)? {
                Some(alert) => alert,
                None => {
                    db.fail_notification(task.id, "alert no longer exists")?;
                    return Ok(TaskStatus::Failed);
                }
            }
        };

        if let Err(rejected) = webhook::validate(task.channel, &task.recipient) {
            let db = self.db.lock().await;
            db.fail_notification(task.id, &rejected.to_string())?;
            db.insert_delivery_record(
                Some(task.id),
                task.user_id,
                task.channel,
                TaskStatus::Failed,
                None,
                &now.to_rfc3339(),
            )?;
            tracing::error!(task_id = task.id, error = %rejected, "webhook rejected");
            return Ok(TaskStatus::Failed);
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.send_timeout, self.sender.send(task, &alert)).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let db = self.db.lock().await;
        let now_str = now.to_rfc3339();
        match outcome {
            Ok(Ok(())) => {
                db.mark_notification_sent(task.id, &now_str)?;
                db.insert_delivery_record(
                    Some(task.id),
                    task.user_id,
                    task.channel,
                    TaskStatus::Sent,
                    Some(duration_ms),
                    &now_str,
                )?;
                tracing::info!(task_id = task.id, channel = task.channel.as_str(), "notification sent");
                Ok(TaskStatus::Sent)
            }
            Ok(Err(failure)) => {
                let status = db.record_notification_failure(task.id, &failure.to_string())?;
                db.insert_delivery_record(
                    Some(task.id),
                    task.user_id,
                    task.channel,
                    TaskStatus::Failed,
                    Some(duration_ms),
                    &now_str,
                )?;
                tracing::warn!(task_id = task.id, error = %failure, status = status.as_str(), "delivery failed");
                Ok(status)
            }
            Err(_) => {
                let status = db.record_notification_failure(task.id, "delivery timed out")?;
                db.insert_delivery_record(
                    Some(task.id),
                    task.user_id,
                    task.channel,
                    TaskStatus::Failed,
                    Some(duration_ms),
                    &now_str,
                )?;
                tracing::warn!(task_id = task.id, status = status.as_str(), "delivery timed out");
                Ok(status)
            }
        }
    }
}
