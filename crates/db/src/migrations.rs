use crate::error::Result;
use crate::Db;

const MIGRATION_0001: &str = include_str!("../migrations/0001_init.sql");

const MIGRATIONS: &[(&str, &str)] = &[("0001_init", MIGRATION_0001)];

impl Db {
    pub fn migrate(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        for (_name, sql) in MIGRATIONS {
            tx.execute_batch(sql)?;
        }
        tx.commit()?;
        Ok(())
    }
}
