//! Per-(user, channel) delivery rate limiting.
//!
//! Caps are recomputed from the delivery history table on every check,
//! never cached, so restarts and concurrent dispatchers agree on the
//! window. Callers pass `now` explicitly, which keeps the window
//! arithmetic testable against a synthetic clock.

use chrono::{DateTime, Duration, Utc};
use ledger_core::ChannelKind;
use ledger_db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub hourly: i64,
    pub daily: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub hourly_remaining: i64,
    pub daily_remaining: i64,
}

impl RateLimitStatus {
    pub fn allows_send(&self) -> bool {
        self.hourly_remaining > 0 && self.daily_remaining > 0
    }
}

const FALLBACK_POLICY: RateLimitPolicy = RateLimitPolicy {
    hourly: 10,
    daily: 50,
};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    email: RateLimitPolicy,
    chat: RateLimitPolicy,
    fallback: RateLimitPolicy,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self {
            email: RateLimitPolicy {
                hourly: 10,
                daily: 50,
            },
            chat: RateLimitPolicy {
                hourly: 20,
                daily: 100,
            },
            fallback: FALLBACK_POLICY,
        }
    }
}

impl RateLimiter {
    pub fn policy(&self, channel: ChannelKind) -> RateLimitPolicy {
        match channel {
            ChannelKind::Email => self.email,
            ChannelKind::Slack | ChannelKind::Discord | ChannelKind::Teams => self.chat,
            ChannelKind::Webhook => self.fallback,
        }
    }

    /// Remaining sends in the hourly and daily windows ending at `now`.
    pub fn remaining(
        &self,
        db: &Db,
        user_id: i64,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> ledger_db::Result<RateLimitStatus> {
        let policy = self.policy(channel);
        let hour_ago = (now - Duration::hours(1)).to_rfc3339();
        let day_ago = (now - Duration::hours(24)).to_rfc3339();
        let hourly_used = db.delivery_count_since(user_id, channel, &hour_ago)?;
        let daily_used = db.delivery_count_since(user_id, channel, &day_ago)?;
        Ok(RateLimitStatus {
            hourly_remaining: (policy.hourly - hourly_used).max(0),
            daily_remaining: (policy.daily - daily_used).max(0),
        })
    }

    pub fn can_send(
        &self,
        db: &Db,
        user_id: i64,
        channel: ChannelKind,
        now: DateTime<Utc>,
    ) -> ledger_db::Result<bool> {
        Ok(self.remaining(db, user_id, channel, now)?.allows_send())
    }
}
