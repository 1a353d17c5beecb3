//! Sync scheduling, budget evaluation, and notification delivery on top
//! of the usage ledger.

pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod evaluator;
pub mod orchestrator;
pub mod rate_limiter;
pub mod sender;
pub mod webhook;

pub use config::{EngineConfig, NotificationRoute};
pub use credentials::{CredentialError, CredentialStore, EnvCredentialStore, StaticCredentialStore};
pub use dispatcher::{DispatchSummary, Dispatcher};
pub use error::{EngineError, Result};
pub use evaluator::{detect_unusual_activity, evaluate_account, record_sync_failure, Evaluation};
pub use orchestrator::{Orchestrator, SyncPhase};
pub use rate_limiter::{RateLimitPolicy, RateLimitStatus, RateLimiter};
pub use sender::{HttpSender, HttpSenderConfig, NotificationSender, SendFailure};
pub use webhook::SsrfRejected;
