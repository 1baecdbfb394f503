use std::sync::atomic::{AtomicU64, Ordering};

use crate::ratelimit::{Decision, DecisionSource};

/// Admission counters. Quota rejections are expected traffic and are only counted here.
#[derive(Debug, Default)]
pub struct AdmissionMetrics {
    allowed_total: AtomicU64,
    throttled_total: AtomicU64,
    banned_total: AtomicU64,
    fallback_total: AtomicU64,
    refunded_total: AtomicU64,
}

impl AdmissionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, decision: &Decision) {
        if decision.allowed {
            self.allowed_total.fetch_add(1, Ordering::Relaxed);
        } else if decision.banned {
            self.banned_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.throttled_total.fetch_add(1, Ordering::Relaxed);
        }

        if decision.source == DecisionSource::Fallback {
            self.fallback_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn refunded(&self) {
        self.refunded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE admission_allowed_total counter\n",
                "admission_allowed_total {}\n",
                "# TYPE admission_throttled_total counter\n",
                "admission_throttled_total {}\n",
                "# TYPE admission_banned_total counter\n",
                "admission_banned_total {}\n",
                "# TYPE admission_fallback_total counter\n",
                "admission_fallback_total {}\n",
                "# TYPE admission_refunded_total counter\n",
                "admission_refunded_total {}\n"
            ),
            self.allowed_total.load(Ordering::Relaxed),
            self.throttled_total.load(Ordering::Relaxed),
            self.banned_total.load(Ordering::Relaxed),
            self.fallback_total.load(Ordering::Relaxed),
            self.refunded_total.load(Ordering::Relaxed),
        )
    }
}
