pub mod counter;
pub mod distributed;
pub mod fixed_window;
pub mod policy;
pub mod progressive;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;

use crate::ratelimit::policy::PolicyConfig;

/// Which piece of state produced a [`Decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// In-process window store.
    Local,
    /// Shared counter store.
    Store,
    /// Local window store standing in for an unreachable counter store.
    Fallback,
}

/// Per-request admission verdict plus the quota metadata exposed as headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
    pub banned: bool,
    pub source: DecisionSource,
    /// Shared-store window that charged this request; refunds must name it.
    pub window_id: Option<String>,
}

impl Decision {
    pub(crate) fn from_count(
        count: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
        now: DateTime<Utc>,
        source: DecisionSource,
    ) -> Self {
        let allowed = count <= limit;
        Self {
            allowed,
            limit,
            remaining: limit.saturating_sub(count),
            reset_at,
            retry_after_secs: (!allowed).then(|| retry_after_secs(reset_at, now)),
            banned: false,
            source,
            window_id: None,
        }
    }
}

/// Final outcome of an admitted request, used for conditional counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.as_u16() < 400 {
            Self::Success
        } else {
            Self::Failure
        }
    }
}

#[async_trait]
pub trait Limiter: Send + Sync {
    fn name(&self) -> &str;

    fn policy(&self) -> &PolicyConfig;

    async fn check(&self, key: &str, now: DateTime<Utc>) -> Decision;

    /// Message sent with a rejection.
    fn rejection_message(&self, _decision: &Decision) -> &str {
        &self.policy().message
    }

    /// Completion hook, invoked once the protected handler produced a status.
    /// Returns whether the request's hit was refunded.
    async fn complete(&self, _key: &str, _decision: &Decision, _outcome: Outcome) -> bool {
        false
    }
}

/// `ceil((reset_at - now) / 1000)` in seconds, never below zero.
pub(crate) fn retry_after_secs(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1_000)
}
