#![allow(dead_code)]

use std::path::PathBuf;

use ledger_core::{UsageRecord, UsageSource};
use ledger_db::Db;
use rust_decimal::Decimal;
use tempfile::TempDir;

pub struct TestDb {
    pub _dir: TempDir,
    pub db: Db,
    pub path: PathBuf,
}

pub fn setup_db() -> TestDb {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("test.sqlite");
    let mut db = Db::open(&path).expect("open db");
    db.migrate().expect("migrate db");
    TestDb {
        _dir: dir,
        db,
        path,
    }
}

pub fn setup_account(db: &Db, provider: &str, budget: Option<Decimal>) -> i64 {
    db.insert_account(provider, "Test Account", budget, Some("cred-1"))
        .expect("insert account")
}

pub fn make_record(
    account_id: i64,
    provider: &str,
    bucket_date: &str,
    request_kind: &str,
    input_tokens: u64,
    output_tokens: u64,
    cost: Decimal,
) -> UsageRecord {
    UsageRecord {
        account_id,
        provider: provider.to_string(),
        bucket_date: bucket_date.to_string(),
        request_kind: request_kind.to_string(),
        input_tokens,
        output_tokens,
        cost,
        source: UsageSource::Api,
    }
}
