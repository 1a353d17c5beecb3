#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ledger_core::{AlertEvent, NotificationTask, UsageRecord, UsageSource};
use ledger_db::Db;
use ledger_engine::sender::{NotificationSender, SendFailure};
use ledger_engine::{Dispatcher, RateLimiter};
use rust_decimal::Decimal;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub struct TestCtx {
    pub _dir: TempDir,
    pub db: Arc<Mutex<Db>>,
}

pub fn setup() -> TestCtx {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut db = Db::open(dir.path().join("test.sqlite")).expect("open db");
    db.migrate().expect("migrate db");
    TestCtx {
        _dir: dir,
        db: Arc::new(Mutex::new(db)),
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
    cost: Decimal,
) -> UsageRecord {
    UsageRecord {
        account_id,
        provider: provider.to_string(),
        bucket_date: bucket_date.to_string(),
        request_kind: "completion".to_string(),
        input_tokens: 1_000,
        output_tokens: 500,
        cost,
        source: UsageSource::Api,
    }
}

/// Counts deliveries instead of making them; optionally fails every send.
pub struct FakeSender {
    pub calls: AtomicU32,
    pub fail_with: Option<String>,
}

impl FakeSender {
    pub fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: None,
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: Some(reason.to_string()),
        })
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSender for FakeSender {
    async fn send(&self, _task: &NotificationTask, _alert: &AlertEvent) -> Result<(), SendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(reason) => Err(SendFailure(reason.clone())),
            None => Ok(()),
        }
    }
}

pub fn make_dispatcher(ctx: &TestCtx, sender: Arc<FakeSender>) -> Arc<Dispatcher> {
    Arc::new(Dispatcher::new(
        Arc::clone(&ctx.db),
        RateLimiter::default(),
        sender,
        50,
        Duration::from_secs(2),
    ))
}
