use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    error::StoreError,
    ratelimit::{
        Decision,
        DecisionSource,
        Limiter,
        Outcome,
        counter::{CounterHit, CounterStore},
        fixed_window::FixedWindowLimiter,
        policy::PolicyConfig,
        store::WindowStore,
    },
};

/// Fixed-window limiter whose counts live in a shared [`CounterStore`].
///
/// Any store failure, including a timeout, falls back to a local
/// [`FixedWindowLimiter`] with the same policy instead of rejecting traffic.
pub struct DistributedLimiter {
    name: String,
    policy: PolicyConfig,
    counters: Arc<dyn CounterStore>,
    fallback: FixedWindowLimiter,
    timeout: Duration,
    outage: AtomicBool,
}

impl DistributedLimiter {
    pub fn new(
        name: impl Into<String>,
        policy: PolicyConfig,
        counters: Arc<dyn CounterStore>,
        fallback_store: Arc<WindowStore>,
        timeout: Duration,
    ) -> Self {
        let name = name.into();
        let fallback = FixedWindowLimiter::new(name.clone(), policy.clone(), fallback_store)
            .with_namespace(format!("{name}:fallback"))
            .as_fallback();

        Self {
            name,
            policy,
            counters,
            fallback,
            timeout,
            outage: AtomicBool::new(false),
        }
    }

    /// True while the counter store is considered unreachable.
    pub fn in_outage(&self) -> bool {
        self.outage.load(Ordering::Acquire)
    }

    pub async fn evaluate(&self, key: &str, now: DateTime<Utc>) -> Decision {
        match self.count(key).await {
            Ok(hit) => {
                self.mark_recovered();

                let reset_in = if hit.ttl_ms > 0 {
                    TimeDelta::milliseconds(hit.ttl_ms)
                } else {
                    self.policy.window_delta()
                };
                let mut decision = Decision::from_count(
                    hit.count,
                    self.policy.max,
                    now + reset_in,
                    now,
                    DecisionSource::Store,
                );
                decision.window_id = Some(hit.window_id);
                decision
            }
            Err(err) => {
                self.mark_outage(&err);
                self.fallback.evaluate(key, now)
            }
        }
    }

    async fn count(&self, key: &str) -> Result<CounterHit, StoreError> {
        let scoped = self.scoped_key(key);
        tokio::time::timeout(self.timeout, self.counters.increment(&scoped, self.policy.window))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    fn mark_outage(&self, err: &StoreError) {
        if !self.outage.swap(true, Ordering::AcqRel) {
            tracing::error!(
                policy = %self.name,
                error = %err,
                "counter store unavailable; enforcing limits locally"
            );
        }
    }

    fn mark_recovered(&self) {
        if self.outage.swap(false, Ordering::AcqRel) {
            tracing::info!(policy = %self.name, "counter store recovered");
        }
    }

    fn scoped_key(&self, key: &str) -> String {
        format!("{}:{}", self.name, key)
    }
}

#[async_trait]
impl Limiter for DistributedLimiter {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    async fn check(&self, key: &str, now: DateTime<Utc>) -> Decision {
        self.evaluate(key, now).await
    }

    async fn complete(&self, key: &str, decision: &Decision, outcome: Outcome) -> bool {
        if !decision.allowed || !self.policy.refunds(outcome) {
            return false;
        }

        match decision.source {
            DecisionSource::Fallback => self.fallback.refund(key, decision, outcome),
            DecisionSource::Store => {
                let Some(window_id) = decision.window_id.as_deref() else {
                    return false;
                };
                let scoped = self.scoped_key(key);
                let refund = self.counters.decrement(&scoped, window_id);
                match tokio::time::timeout(self.timeout, refund).await {
                    Ok(Ok(refunded)) => refunded,
                    Ok(Err(err)) => {
                        tracing::debug!(policy = %self.name, error = %err, "refund skipped");
                        false
                    }
                    Err(_) => {
                        tracing::debug!(policy = %self.name, "refund timed out");
                        false
                    }
                }
            }
            DecisionSource::Local => false,
        }
    }
}
