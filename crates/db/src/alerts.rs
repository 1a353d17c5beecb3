use ledger_core::{AlertEvent, AlertKind};
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::error::{DbError, Result};
use crate::Db;

impl Db {
    /// Create or refresh the single unacknowledged alert for
    /// (account, kind). The partial unique index on unacknowledged rows
    /// makes this a single-statement upsert, so concurrent evaluators
    /// converge on one row. Returns the alert id.
    pub fn upsert_alert(
        &self,
        account_id: i64,
        kind: AlertKind,
        threshold_pct: u32,
        observed_pct: Option<Decimal>,
        message: &str,
        now: &str,
    ) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO alert (
              account_id, kind, threshold_pct, observed_pct, message,
              acknowledged, created_at, last_triggered_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)
            ON CONFLICT(account_id, kind) WHERE acknowledged = 0 DO UPDATE SET
              threshold_pct = excluded.threshold_pct,
              observed_pct = excluded.observed_pct,
              message = excluded.message,
              last_triggered_at = excluded.last_triggered_at
            "#,
            params![
                account_id,
                kind.as_str(),
                threshold_pct,
                observed_pct.map(|value| value.to_string()),
                message,
                now,
            ],
        )?;
        let id = self.conn.query_row(
            "SELECT id FROM alert WHERE account_id = ?1 AND kind = ?2 AND acknowledged = 0",
            params![account_id, kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Escalate an existing unacknowledged alert in place (e.g. an
    /// `approaching_limit` row when the budget crosses 100%), instead of
    /// stacking a second event for the same account.
    pub fn escalate_alert(
        &self,
        alert_id: i64,
        kind: AlertKind,
        threshold_pct: u32,
        observed_pct: Option<Decimal>,
        message: &str,
        now: &str,
    ) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE alert
            SET kind = ?2, threshold_pct = ?3, observed_pct = ?4,
                message = ?5, last_triggered_at = ?6
            WHERE id = ?1 AND acknowledged = 0
            "#,
            params![
                alert_id,
                kind.as_str(),
                threshold_pct,
                observed_pct.map(|value| value.to_string()),
                message,
                now,
            ],
        )?;
        Ok(())
    }

    pub fn unacknowledged_alert(
        &self,
        account_id: i64,
        kind: AlertKind,
    ) -> Result<Option<AlertEvent>> {
        self.conn
            .query_row(
                &format!("{SELECT_ALERT} WHERE account_id = ?1 AND kind = ?2 AND acknowledged = 0"),
                params![account_id, kind.as_str()],
                row_to_alert,
            )
            .optional()?
            .transpose()
    }

    pub fn get_alert(&self, id: i64) -> Result<Option<AlertEvent>> {
        self.conn
            .query_row(
                &format!("{SELECT_ALERT} WHERE id = ?1"),
                params![id],
                row_to_alert,
            )
            .optional()?
            .transpose()
    }

    pub fn list_alerts(&self, include_acknowledged: bool) -> Result<Vec<AlertEvent>> {
        let sql = if include_acknowledged {
            format!("{SELECT_ALERT} ORDER BY last_triggered_at DESC")
        } else {
            format!("{SELECT_ALERT} WHERE acknowledged = 0 ORDER BY last_triggered_at DESC")
        };
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut alerts = Vec::new();
        while let Some(row) = rows.next()? {
            alerts.push(row_to_alert(row)??);
        }
        Ok(alerts)
    }

    /// Acknowledge an alert, clearing the dedup slot for its kind.
    /// Returns false when the id does not exist.
    pub fn acknowledge_alert(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("UPDATE alert SET acknowledged = 1 WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }
}

const SELECT_ALERT: &str = r#"
    SELECT id, account_id, kind, threshold_pct, observed_pct, message,
           acknowledged, created_at, last_triggered_at
    FROM alert
"#;

fn row_to_alert(row: &Row<'_>) -> std::result::Result<Result<AlertEvent>, rusqlite::Error> {
    let kind: String = row.get(2)?;
    let observed: Option<String> = row.get(4)?;
    let parsed_kind = match AlertKind::parse(&kind) {
        Some(value) => value,
        None => {
            return Ok(Err(DbError::UnknownValue {
                field: "kind",
                value: kind,
            }))
        }
    };
    Ok(Ok(AlertEvent {
        id: row.get(0)?,
        account_id: row.get(1)?,
        kind: parsed_kind,
        threshold_pct: row.get::<_, i64>(3)? as u32,
        observed_pct: observed.and_then(|value| value.parse::<Decimal>().ok()),
        message: row.get(5)?,
        acknowledged: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        last_triggered_at: row.get(8)?,
    }))
}
