mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use ledger_core::{AlertKind, ChannelKind, RawUsageEntry};
use ledger_engine::{
    EngineConfig, NotificationRoute, Orchestrator, StaticCredentialStore,
};
use providers::{AdapterRegistry, ProviderAdapter, ProviderError};
use rust_decimal_macros::dec;
use support::{make_dispatcher, setup, setup_account, FakeSender, TestCtx};

enum Behavior {
    Usage(Vec<RawUsageEntry>),
    AuthError,
    TransientThenUsage(Vec<RawUsageEntry>),
    Slow(Duration),
}

struct ScriptedAdapter {
    behavior: Behavior,
    calls: AtomicU32,
}

impl ScriptedAdapter {
    fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider(&self) -> &'static str {
        "openai"
    }

    async fn fetch_usage(
        &self,
        _credential: &str,
        _since: NaiveDate,
        _until: NaiveDate,
    ) -> Result<Vec<RawUsageEntry>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.behavior {
            Behavior::Usage(entries) => Ok(entries.clone()),
            Behavior::AuthError => Err(ProviderError::Auth("bad key".to_string())),
            Behavior::TransientThenUsage(entries) => {
                if call == 0 {
                    Err(ProviderError::Transient("502".to_string()))
                } else {
                    Ok(entries.clone())
                }
            }
            Behavior::Slow(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(Vec::new())
            }
        }
    }
}

fn today_entry(cost: rust_decimal::Decimal) -> RawUsageEntry {
    RawUsageEntry {
        occurred_at: Utc::now().to_rfc3339(),
        model: Some("gpt-4".to_string()),
        request_kind: "completion".to_string(),
        input_tokens: 1_000,
        output_tokens: 500,
        reported_cost: Some(cost),
    }
}

fn build_orchestrator(
    ctx: &TestCtx,
    adapter: Arc<ScriptedAdapter>,
    sender: Arc<FakeSender>,
    routes: Vec<NotificationRoute>,
) -> Orchestrator {
    let mut registry = AdapterRegistry::new();
    registry.register(adapter);
    let mut credentials = StaticCredentialStore::new();
    credentials.insert("cred-1", "sk-test");
    let config = EngineConfig {
        retry_base: Duration::from_millis(10),
        provider_call_timeout: Duration::from_millis(500),
        routes,
        ..EngineConfig::default()
    };
    Orchestrator::new(
        Arc::clone(&ctx.db),
        registry,
        Arc::new(credentials),
        make_dispatcher(ctx, sender),
        config,
    )
}

fn slack_route() -> Vec<NotificationRoute> {
    vec![NotificationRoute {
        user_id: 1,
        channel: ChannelKind::Slack,
        recipient: "https://hooks.slack.com/services/T/B/x".to_string(),
        priority: 2,
    }]
}

#[tokio::test]
async fn sync_writes_usage_updates_last_sync_and_enqueues_the_alert() {
    let ctx = setup();
    let account_id = {
        let db = ctx.db.lock().await;
        setup_account(&db, "openai", Some(dec!(100)))
    };
    let adapter = ScriptedAdapter::new(Behavior::Usage(vec![today_entry(dec!(82))]));
    let sender = FakeSender::succeeding();
    let orchestrator = build_orchestrator(&ctx, adapter, sender, slack_route());

    orchestrator.sync_once().await;

    let db = ctx.db.lock().await;
    assert_eq!(db.count_usage_records(account_id).unwrap(), 1);
    let account = db.get_account(account_id).unwrap().unwrap();
    assert!(account.last_sync_at.is_some());

    let alert = db
        .unacknowledged_alert(account_id, AlertKind::ApproachingLimit)
        .unwrap()
        .expect("alert");
    assert_eq!(alert.observed_pct, Some(dec!(82)));

    let pending = db.pending_notifications(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].channel, ChannelKind::Slack);
}

#[tokio::test]
async fn re_sync_converges_instead_of_accumulating() {
    let ctx = setup();
    let account_id = {
        let db = ctx.db.lock().await;
        setup_account(&db, "openai", Some(dec!(1000)))
    };
    let sender = FakeSender::succeeding();

    let first = ScriptedAdapter::new(Behavior::Usage(vec![today_entry(dec!(5.00))]));
    build_orchestrator(&ctx, first, sender.clone(), Vec::new())
        .sync_once()
        .await;

    let corrected = ScriptedAdapter::new(Behavior::Usage(vec![today_entry(dec!(5.25))]));
    build_orchestrator(&ctx, corrected, sender, Vec::new())
        .sync_once()
        .await;

    let db = ctx.db.lock().await;
    assert_eq!(db.count_usage_records(account_id).unwrap(), 1);
    let records = db.list_usage_records(account_id).unwrap();
    assert_eq!(records[0].cost, dec!(5.25));
}

#[tokio::test]
async fn auth_failure_is_terminal_and_raises_a_sync_failure_alert() {
    let ctx = setup();
    let account_id = {
        let db = ctx.db.lock().await;
        setup_account(&db, "openai", Some(dec!(100)))
    };
    let adapter = ScriptedAdapter::new(Behavior::AuthError);
    let sender = FakeSender::succeeding();
    let orchestrator = build_orchestrator(&ctx, adapter.clone(), sender, slack_route());

    orchestrator.sync_once().await;

    // No retries on an auth error.
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    let db = ctx.db.lock().await;
    assert_eq!(db.count_usage_records(account_id).unwrap(), 0);
    assert!(db
        .unacknowledged_alert(account_id, AlertKind::SyncFailure)
        .unwrap()
        .is_some());
    assert_eq!(db.pending_notifications(10).unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failures_retry_within_the_tick() {
    let ctx = setup();
    let account_id = {
        let db = ctx.db.lock().await;
        setup_account(&db, "openai", Some(dec!(1000)))
    };
    let adapter =
        ScriptedAdapter::new(Behavior::TransientThenUsage(vec![today_entry(dec!(1))]));
    let sender = FakeSender::succeeding();
    let orchestrator = build_orchestrator(&ctx, adapter.clone(), sender, Vec::new());

    orchestrator.sync_once().await;

    assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    let db = ctx.db.lock().await;
    assert_eq!(db.count_usage_records(account_id).unwrap(), 1);
    assert!(db
        .unacknowledged_alert(account_id, AlertKind::SyncFailure)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn an_account_mid_sync_is_skipped_not_queued() {
    let ctx = setup();
    {
        let db = ctx.db.lock().await;
        setup_account(&db, "openai", None);
    }
    let adapter = ScriptedAdapter::new(Behavior::Slow(Duration::from_millis(200)));
    let sender = FakeSender::succeeding();
    let orchestrator = Arc::new(build_orchestrator(&ctx, adapter.clone(), sender, Vec::new()));

    let slow = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.sync_once().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    orchestrator.sync_once().await;
    slow.await.unwrap();

    // The overlapping pass skipped the in-flight account.
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
}
