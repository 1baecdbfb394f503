use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ratelimit::{
    Decision,
    DecisionSource,
    Limiter,
    Outcome,
    policy::PolicyConfig,
    store::{WindowRecord, WindowStore},
};

/// Single-process fixed-window counter over a shared [`WindowStore`].
pub struct FixedWindowLimiter {
    name: String,
    namespace: String,
    policy: PolicyConfig,
    store: Arc<WindowStore>,
    source: DecisionSource,
}

impl FixedWindowLimiter {
    pub fn new(name: impl Into<String>, policy: PolicyConfig, store: Arc<WindowStore>) -> Self {
        let name = name.into();
        Self {
            namespace: name.clone(),
            name,
            policy,
            store,
            source: DecisionSource::Local,
        }
    }

    /// Keys are stored as `namespace:key`, which keeps limiters sharing a store apart.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub(crate) fn as_fallback(mut self) -> Self {
        self.source = DecisionSource::Fallback;
        self
    }

    pub fn evaluate(&self, key: &str, now: DateTime<Utc>) -> Decision {
        self.evaluate_with_limit(key, self.policy.max, now)
    }

    pub(crate) fn evaluate_with_limit(
        &self,
        key: &str,
        limit: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        let record = self
            .store
            .hit(&self.store_key(key), self.policy.window_delta(), now);
        Decision::from_count(record.count, limit, record.reset_at, now, self.source)
    }

    /// Refunds an admitted request whose outcome the policy does not count.
    ///
    /// The refund lands after admission was decided, so a burst of requests
    /// that all end up refunded can still be throttled while in flight.
    pub fn refund(&self, key: &str, decision: &Decision, outcome: Outcome) -> bool {
        decision.allowed
            && self.policy.refunds(outcome)
            && self.store.refund(&self.store_key(key), decision.reset_at)
    }

    pub fn record(&self, key: &str) -> Option<WindowRecord> {
        self.store.get(&self.store_key(key))
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    async fn check(&self, key: &str, now: DateTime<Utc>) -> Decision {
        self.evaluate(key, now)
    }

    async fn complete(&self, key: &str, decision: &Decision, outcome: Outcome) -> bool {
        self.refund(key, decision, outcome)
    }
}
