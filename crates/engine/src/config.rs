use std::time::Duration;

use ledger_core::ChannelKind;

/// Where alert notifications go. Routing is static configuration; the
/// queue records the resolved (user, channel, recipient) per task.
#[derive(Debug, Clone)]
pub struct NotificationRoute {
    pub user_id: i64,
    pub channel: ChannelKind,
    pub recipient: String,
    pub priority: i64,
}

/// All tunables for the sync and dispatch loops. Constructed explicitly
/// and injected; nothing reads the environment from inside the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Gap between scheduled sync ticks.
    pub sync_interval: Duration,
    /// Upper bound on accounts synced concurrently within a tick.
    pub max_concurrent_syncs: usize,
    /// Timeout for a single provider API call.
    pub provider_call_timeout: Duration,
    /// Retry attempts per account per tick for retryable failures.
    pub retry_ceiling: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    /// How many days before `last_sync_at` to re-fetch, so late-arriving
    /// provider corrections converge through the idempotent writer.
    pub lookback_days: i64,
    /// Tasks drained per dispatch pass.
    pub dispatch_batch: u32,
    /// Timeout for one outbound notification POST.
    pub send_timeout: Duration,
    /// Delivery attempts before a task goes terminal.
    pub max_send_attempts: u32,
    pub routes: Vec<NotificationRoute>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(60 * 60),
            max_concurrent_syncs: 4,
            provider_call_timeout: Duration::from_secs(30),
            retry_ceiling: 3,
            retry_base: Duration::from_millis(500),
            lookback_days: 3,
            dispatch_batch: 50,
            send_timeout: Duration::from_secs(10),
            max_send_attempts: 3,
            routes: Vec::new(),
        }
    }
}
