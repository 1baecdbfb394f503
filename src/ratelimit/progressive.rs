use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{
    error::ConfigError,
    ratelimit::{
        Decision,
        Limiter,
        Outcome,
        fixed_window::FixedWindowLimiter,
        policy::PolicyConfig,
        retry_after_secs,
        store::WindowStore,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressiveConfig {
    /// Quota taken away per recorded violation.
    pub penalty_step: u64,
    /// Lowest quota a key can shrink to.
    pub floor_limit: u64,
    pub ban_threshold: u64,
    pub ban_message: String,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            penalty_step: 20,
            floor_limit: 10,
            ban_threshold: 5,
            ban_message: "Access blocked due to repeated rate limit violations.".to_string(),
        }
    }
}

impl ProgressiveConfig {
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.floor_limit == 0 {
            return Err(ConfigError::policy(name, "floor limit must be greater than zero"));
        }
        // a threshold of 1 would ban every key on its first request
        if self.ban_threshold < 2 {
            return Err(ConfigError::policy(name, "ban threshold must be at least 2"));
        }
        Ok(())
    }
}

/// Lifetime violation counts per key. Counts only ever grow.
#[derive(Default)]
pub struct ViolationTracker {
    violations: DashMap<String, u64>,
}

impl ViolationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn violations(&self, key: &str) -> u64 {
        self.violations.get(key).map(|v| *v).unwrap_or(0)
    }

    /// Records one more violation and returns the new total.
    pub fn record(&self, key: &str) -> u64 {
        let mut entry = self.violations.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }
}

/// Fixed-window limiter whose quota shrinks with every violation, ending in a ban.
pub struct ProgressiveLimiter {
    window: FixedWindowLimiter,
    tracker: Arc<ViolationTracker>,
    cfg: ProgressiveConfig,
}

impl ProgressiveLimiter {
    pub fn new(
        name: impl Into<String>,
        policy: PolicyConfig,
        cfg: ProgressiveConfig,
        store: Arc<WindowStore>,
    ) -> Self {
        Self {
            window: FixedWindowLimiter::new(name, policy, store),
            tracker: Arc::new(ViolationTracker::new()),
            cfg,
        }
    }

    pub fn violations(&self, key: &str) -> u64 {
        self.tracker.violations(key)
    }

    /// `min(base, max(floor, base - violations * step))`.
    pub fn effective_max(&self, violations: u64) -> u64 {
        let base = self.window.policy().max;
        let penalty = violations.saturating_mul(self.cfg.penalty_step);
        base.saturating_sub(penalty).max(self.cfg.floor_limit).min(base)
    }

    pub fn is_banned(&self, key: &str) -> bool {
        self.tracker.violations(key) >= self.ban_level()
    }

    pub fn evaluate(&self, key: &str, now: DateTime<Utc>) -> Decision {
        let prior = self.tracker.violations(key);
        let limit = self.effective_max(prior);
        let mut decision = self.window.evaluate_with_limit(key, limit, now);

        let banned = prior >= self.ban_level();
        if banned {
            decision.allowed = false;
            decision.banned = true;
            decision.retry_after_secs = Some(retry_after_secs(decision.reset_at, now));
        }

        if !decision.allowed {
            let violations = self.tracker.record(key);
            if banned {
                tracing::warn!(
                    policy = %self.window.name(),
                    key = %key,
                    violations,
                    "banned client rejected"
                );
            } else {
                tracing::debug!(
                    policy = %self.window.name(),
                    key = %key,
                    violations,
                    limit,
                    "progressive quota exceeded"
                );
            }
        }

        decision
    }

    fn ban_level(&self) -> u64 {
        self.cfg.ban_threshold.saturating_sub(1)
    }
}

#[async_trait]
impl Limiter for ProgressiveLimiter {
    fn name(&self) -> &str {
        self.window.name()
    }

    fn policy(&self) -> &PolicyConfig {
        self.window.policy()
    }

    async fn check(&self, key: &str, now: DateTime<Utc>) -> Decision {
        self.evaluate(key, now)
    }

    fn rejection_message(&self, decision: &Decision) -> &str {
        if decision.banned {
            &self.cfg.ban_message
        } else {
            &self.window.policy().message
        }
    }

    async fn complete(&self, key: &str, decision: &Decision, outcome: Outcome) -> bool {
        self.window.refund(key, decision, outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;

    use super::*;

    fn limiter(window: Duration, base_max: u64) -> ProgressiveLimiter {
        ProgressiveLimiter::new(
            "api",
            PolicyConfig::new(window, base_max, "slow down"),
            ProgressiveConfig::default(),
            Arc::new(WindowStore::new()),
        )
    }

    /// Burns through the current quota of `key` until one denial is recorded.
    fn violate(limiter: &ProgressiveLimiter, key: &str, now: DateTime<Utc>) -> Decision {
        loop {
            let decision = limiter.evaluate(key, now);
            if !decision.allowed {
                return decision;
            }
        }
    }

    #[test]
    fn effective_max_shrinks_to_floor() {
        let limiter = limiter(Duration::from_secs(60), 100);
        let maxes: Vec<u64> = (0..7).map(|v| limiter.effective_max(v)).collect();
        assert_eq!(maxes, vec![100, 80, 60, 40, 20, 10, 10]);
        assert!(maxes.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn effective_max_never_exceeds_base() {
        let limiter = limiter(Duration::from_secs(60), 5);
        assert_eq!(limiter.effective_max(0), 5);
        assert_eq!(limiter.effective_max(3), 5);
    }

    #[test]
    fn tracker_counts_only_grow() {
        let tracker = ViolationTracker::new();
        assert_eq!(tracker.violations("k"), 0);
        assert_eq!(tracker.record("k"), 1);
        assert_eq!(tracker.record("k"), 2);
        assert_eq!(tracker.violations("k"), 2);
        assert_eq!(tracker.violations("other"), 0);
    }

    #[test]
    fn fifth_violation_flips_to_ban() {
        let limiter = limiter(Duration::from_millis(1_000), 100);
        let mut now = Utc::now();

        for expected in 1..=4 {
            let decision = violate(&limiter, "client", now);
            assert!(!decision.banned);
            assert_eq!(limiter.violations("client"), expected);
            now += TimeDelta::milliseconds(1_100);
        }

        assert_eq!(limiter.effective_max(limiter.violations("client")), 20);

        let decision = limiter.evaluate("client", now);
        assert!(!decision.allowed);
        assert!(decision.banned);
        assert_eq!(decision.limit, 20);
        assert!(decision.retry_after_secs.is_some());
        assert_eq!(limiter.violations("client"), 5);
        assert!(limiter.is_banned("client"));
    }

    #[test]
    fn ban_survives_elapsed_windows() {
        let limiter = limiter(Duration::from_millis(1_000), 100);
        let mut now = Utc::now();
        for _ in 0..4 {
            violate(&limiter, "client", now);
            now += TimeDelta::milliseconds(1_100);
        }

        for hours in 1..4 {
            let decision = limiter.evaluate("client", now + TimeDelta::hours(hours));
            assert!(decision.banned);
            assert!(!decision.allowed);
        }
        assert_eq!(limiter.violations("client"), 7);
        assert_eq!(limiter.effective_max(7), 10);
    }

    #[test]
    fn violations_shrink_quota_for_next_window() {
        let limiter = limiter(Duration::from_millis(1_000), 100);
        let now = Utc::now();
        violate(&limiter, "client", now);

        let later = now + TimeDelta::milliseconds(1_500);
        let decision = limiter.evaluate("client", later);
        assert!(decision.allowed);
        assert_eq!(decision.limit, 80);
        assert_eq!(decision.remaining, 79);
        assert_eq!(limiter.violations("other"), 0);
    }

    #[test]
    fn rejects_threshold_that_bans_everyone() {
        let cfg = ProgressiveConfig {
            ban_threshold: 1,
            ..ProgressiveConfig::default()
        };
        assert!(cfg.validate("api").is_err());
        assert!(ProgressiveConfig::default().validate("api").is_ok());
    }
}
