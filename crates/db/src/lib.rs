use std::path::Path;

use rusqlite::Connection;

mod accounts;
mod alerts;
mod error;
mod migrations;
mod notifications;
mod usage;

pub use error::{DbError, Result};
pub use usage::Upserted;

pub struct Db {
    conn: Connection,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // Writers from overlapping sync runs queue instead of erroring.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn })
    }
}
