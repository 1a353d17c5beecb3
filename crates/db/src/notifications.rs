use ledger_core::{ChannelKind, DeliveryRecord, NotificationTask, TaskStatus};
use rusqlite::{params, Row};

use crate::error::{DbError, Result};
use crate::Db;

impl Db {
    pub fn enqueue_notification(
        &self,
        alert_id: i64,
        user_id: i64,
        channel: ChannelKind,
        recipient: &str,
        priority: i64,
        max_attempts: u32,
        now: &str,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO notification_queue (
              alert_id, user_id, channel, recipient, priority,
              status, attempts, max_attempts, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?7)
            "#,
            params![
                alert_id,
                user_id,
                channel.as_str(),
                recipient,
                priority,
                max_attempts,
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Deliverable tasks in priority order, oldest first within a
    /// priority. Rate-limited tasks stay in the queue and are retried on
    /// the next pass.
    pub fn pending_notifications(&self, limit: u32) -> Result<Vec<NotificationTask>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"{SELECT_TASK}
            WHERE status IN ('pending', 'rate_limited')
            ORDER BY priority DESC, created_at ASC
            LIMIT ?1
            "#
        ))?;
        let mut rows = stmt.query(params![limit])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(row_to_task(row)??);
        }
        Ok(tasks)
    }

    pub fn get_notification(&self, id: i64) -> Result<Option<NotificationTask>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SELECT_TASK} WHERE id = ?1"))?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_task(row)??)),
            None => Ok(None),
        }
    }

    pub fn mark_notification_sent(&self, id: i64, now: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE notification_queue
            SET status = 'sent', sent_at = ?2, last_error = NULL
            WHERE id = ?1
            "#,
            params![id, now],
        )?;
        Ok(())
    }

    pub fn mark_notification_rate_limited(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE notification_queue SET status = 'rate_limited' WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    /// Record a failed attempt; the task goes terminal once attempts
    /// reach the ceiling.
    pub fn record_notification_failure(&self, id: i64, error: &str) -> Result<TaskStatus> {
        self.conn.execute(
            r#"
            UPDATE notification_queue
            SET attempts = attempts + 1,
                last_error = ?2,
                status = CASE
                  WHEN attempts + 1 >= max_attempts THEN 'failed'
                  ELSE 'pending'
                END
            WHERE id = ?1
            "#,
            params![id, error],
        )?;
        let status: String = self.conn.query_row(
            "SELECT status FROM notification_queue WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        TaskStatus::parse(&status).ok_or(DbError::UnknownValue {
            field: "status",
            value: status.clone(),
        })
    }

    /// Terminal failure regardless of remaining attempts, for errors
    /// that cannot succeed on retry (bad destination, missing alert).
    pub fn fail_notification(&self, id: i64, error: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE notification_queue
            SET status = 'failed', attempts = attempts + 1, last_error = ?2
            WHERE id = ?1
            "#,
            params![id, error],
        )?;
        Ok(())
    }

    pub fn insert_delivery_record(
        &self,
        task_id: Option<i64>,
        user_id: i64,
        channel: ChannelKind,
        status: TaskStatus,
        duration_ms: Option<i64>,
        now: &str,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO notification_history (
              task_id, user_id, channel, status, duration_ms, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![task_id, user_id, channel.as_str(), status.as_str(), duration_ms, now],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Window count for the rate limiter, recomputed from history rather
    /// than kept as a mutable counter.
    pub fn delivery_count_since(
        &self,
        user_id: i64,
        channel: ChannelKind,
        since: &str,
    ) -> Result<i64> {
        self.conn
            .query_row(
                r#"
                SELECT COUNT(*) FROM notification_history
                WHERE user_id = ?1 AND channel = ?2 AND created_at >= ?3
                "#,
                params![user_id, channel.as_str(), since],
                |row| row.get(0),
            )
            .map_err(DbError::from)
    }

    pub fn list_delivery_history(&self, limit: u32) -> Result<Vec<DeliveryRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, task_id, user_id, channel, status, duration_ms, created_at
            FROM notification_history
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )?;
        let mut rows = stmt.query(params![limit])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_delivery(row)??);
        }
        Ok(records)
    }
}

const SELECT_TASK: &str = r#"
    SELECT id, alert_id, user_id, channel, recipient, priority, status,
           attempts, max_attempts, last_error, sent_at, created_at
    FROM notification_queue
"#;

fn row_to_task(row: &Row<'_>) -> std::result::Result<Result<NotificationTask>, rusqlite::Error> {
    let channel: String = row.get(3)?;
    let status: String = row.get(6)?;
    let (channel, status) = match (ChannelKind::parse(&channel), TaskStatus::parse(&status)) {
        (Some(channel), Some(status)) => (channel, status),
        (None, _) => {
            return Ok(Err(DbError::UnknownValue {
                field: "channel",
                value: channel,
            }))
        }
        (_, None) => {
            return Ok(Err(DbError::UnknownValue {
                field: "status",
                value: status,
            }))
        }
    };
    Ok(Ok(NotificationTask {
        id: row.get(0)?,
        alert_id: row.get(1)?,
        user_id: row.get(2)?,
        channel,
        recipient: row.get(4)?,
        priority: row.get(5)?,
        status,
        attempts: row.get::<_, i64>(7)? as u32,
        max_attempts: row.get::<_, i64>(8)? as u32,
        last_error: row.get(9)?,
        sent_at: row.get(10)?,
        created_at: row.get(11)?,
    }))
}

fn row_to_delivery(row: &Row<'_>) -> std::result::Result<Result<DeliveryRecord>, rusqlite::Error> {
    let channel: String = row.get(3)?;
    let status: String = row.get(4)?;
    let (channel, status) = match (ChannelKind::parse(&channel), TaskStatus::parse(&status)) {
        (Some(channel), Some(status)) => (channel, status),
        (None, _) => {
            return Ok(Err(DbError::UnknownValue {
                field: "channel",
                value: channel,
            }))
        }
        (_, None) => {
            return Ok(Err(DbError::UnknownValue {
                field: "status",
                value: status,
            }))
        }
    };
    Ok(Ok(DeliveryRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        user_id: row.get(2)?,
        channel,
        status,
        duration_ms: row.get(5)?,
        created_at: row.get(6)?,
    }))
}
