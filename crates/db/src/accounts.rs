use chrono::Utc;
use ledger_core::Account;
use rusqlite::{params, OptionalExtension, Row};
use rust_decimal::Decimal;

use crate::error::Result;
use crate::Db;

impl Db {
    pub fn list_active_accounts(&self) -> Result<Vec<Account>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, provider, display_name, monthly_budget, credential_handle,
                   is_active, last_sync_at, created_at
            FROM account
            WHERE is_active = 1
            ORDER BY id ASC
            "#,
        )?;
        let rows = stmt
            .query_map([], row_to_account)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_account(&self, id: i64) -> Result<Option<Account>> {
        self.conn
            .query_row(
                r#"
                SELECT id, provider, display_name, monthly_budget, credential_handle,
                       is_active, last_sync_at, created_at
                FROM account
                WHERE id = ?1
                "#,
                params![id],
                row_to_account,
            )
            .optional()
            .map_err(crate::error::DbError::from)
    }

    pub fn insert_account(
        &self,
        provider: &str,
        display_name: &str,
        monthly_budget: Option<Decimal>,
        credential_handle: Option<&str>,
    ) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            r#"
            INSERT INTO account (provider, display_name, monthly_budget, credential_handle,
                                 is_active, created_at)
            VALUES (?1, ?2, ?3, ?4, 1, ?5)
            "#,
            params![
                provider,
                display_name,
                monthly_budget.map(|value| value.to_string()),
                credential_handle,
                now
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_last_sync(&self, account_id: i64, at: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE account SET last_sync_at = ?1 WHERE id = ?2",
            params![at, account_id],
        )?;
        Ok(())
    }
}

fn row_to_account(row: &Row<'_>) -> std::result::Result<Account, rusqlite::Error> {
    let budget: Option<String> = row.get(3)?;
    Ok(Account {
        id: row.get(0)?,
        provider: row.get(1)?,
        display_name: row.get(2)?,
        monthly_budget: budget.and_then(|value| value.parse::<Decimal>().ok()),
        credential_handle: row.get(4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        last_sync_at: row.get(6)?,
        created_at: row.get(7)?,
    })
}
