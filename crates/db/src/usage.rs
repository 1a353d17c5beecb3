use chrono::Utc;
use ledger_core::{UsageRecord, UsageSource};
use rusqlite::{params, Row, TransactionBehavior};
use rust_decimal::Decimal;

use crate::error::{DbError, Result};
use crate::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

impl Db {
    /// Insert-or-replace one canonical usage record under the idempotency
    /// key (account_id, provider, bucket_date, request_kind).
    ///
    /// The write itself is a single `INSERT ... ON CONFLICT DO UPDATE`
    /// statement, so two writers racing on the same key can never produce
    /// a second row; the surrounding immediate transaction only exists to
    /// report whether the key already existed.
    pub fn upsert_usage_record(&mut self, record: &UsageRecord) -> Result<Upserted> {
        let now = Utc::now().to_rfc3339();
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<i64> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM usage_record
                WHERE account_id = ?1 AND provider = ?2
                  AND bucket_date = ?3 AND request_kind = ?4
                "#,
            )?;
            let mut rows = stmt.query(params![
                record.account_id,
                record.provider,
                record.bucket_date,
                record.request_kind
            ])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        tx.execute(
            r#"
            INSERT INTO usage_record (
              account_id, provider, bucket_date, request_kind,
              input_tokens, output_tokens, cost, source, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            ON CONFLICT(account_id, provider, bucket_date, request_kind) DO UPDATE SET
              input_tokens = excluded.input_tokens,
              output_tokens = excluded.output_tokens,
              cost = excluded.cost,
              source = excluded.source,
              updated_at = excluded.updated_at
            "#,
            params![
                record.account_id,
                record.provider,
                record.bucket_date,
                record.request_kind,
                record.input_tokens as i64,
                record.output_tokens as i64,
                record.cost.to_string(),
                record.source.as_str(),
                now,
            ],
        )?;
        tx.commit()?;
        Ok(if existing.is_some() {
            Upserted::Updated
        } else {
            Upserted::Inserted
        })
    }

    pub fn list_usage_records(&self, account_id: i64) -> Result<Vec<UsageRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT account_id, provider, bucket_date, request_kind,
                   input_tokens, output_tokens, cost, source
            FROM usage_record
            WHERE account_id = ?1
            ORDER BY bucket_date ASC, request_kind ASC
            "#,
        )?;
        let mut rows = stmt.query(params![account_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(row_to_usage_record(row)?);
        }
        Ok(records)
    }

    /// Total cost for an account over [start, end). Summed in `Decimal`
    /// from the stored rows rather than in SQL so no float arithmetic
    /// touches the cost path.
    pub fn cost_in_range(&self, account_id: i64, start: &str, end: &str) -> Result<Decimal> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT cost FROM usage_record
            WHERE account_id = ?1 AND bucket_date >= ?2 AND bucket_date < ?3
            "#,
        )?;
        let mut rows = stmt.query(params![account_id, start, end])?;
        let mut total = Decimal::ZERO;
        while let Some(row) = rows.next()? {
            let cost: String = row.get(0)?;
            total += cost.parse::<Decimal>()?;
        }
        Ok(total)
    }

    /// Per-day cost totals over [start, end), ascending by bucket.
    /// Summed in `Decimal` like `cost_in_range`.
    pub fn daily_costs(
        &self,
        account_id: i64,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Decimal)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT bucket_date, cost FROM usage_record
            WHERE account_id = ?1 AND bucket_date >= ?2 AND bucket_date < ?3
            ORDER BY bucket_date ASC
            "#,
        )?;
        let mut rows = stmt.query(params![account_id, start, end])?;
        let mut days: Vec<(String, Decimal)> = Vec::new();
        while let Some(row) = rows.next()? {
            let bucket: String = row.get(0)?;
            let cost: String = row.get(1)?;
            let cost = cost.parse::<Decimal>()?;
            match days.last_mut() {
                Some((last, total)) if *last == bucket => *total += cost,
                _ => days.push((bucket, cost)),
            }
        }
        Ok(days)
    }

    pub fn count_usage_records(&self, account_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM usage_record WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .map_err(DbError::from)
    }
}

fn row_to_usage_record(row: &Row<'_>) -> Result<UsageRecord> {
    let cost: String = row.get(6)?;
    let source: String = row.get(7)?;
    Ok(UsageRecord {
        account_id: row.get(0)?,
        provider: row.get(1)?,
        bucket_date: row.get(2)?,
        request_kind: row.get(3)?,
        input_tokens: row.get::<_, i64>(4)? as u64,
        output_tokens: row.get::<_, i64>(5)? as u64,
        cost: cost.parse::<Decimal>()?,
        source: UsageSource::parse(&source).ok_or(DbError::UnknownValue {
            field: "source",
            value: source.clone(),
        })?,
    })
}
