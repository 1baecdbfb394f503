use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};
use chrono::{SecondsFormat, Utc};

use crate::{
    context::{Admission, RequestContext},
    error::{AdmissionError, AdmissionResult},
    key::KeyExtractor,
    metrics::AdmissionMetrics,
    middleware::{AdmissionMiddleware, ControlFlow},
    ratelimit::{Decision, Outcome, policy::PolicyTable},
};

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RESET_HEADER: &str = "x-ratelimit-reset";

pub struct RateLimitMiddleware {
    table: PolicyTable,
    keys: KeyExtractor,
    metrics: Arc<AdmissionMetrics>,
}

impl RateLimitMiddleware {
    pub fn new(table: PolicyTable, keys: KeyExtractor, metrics: Arc<AdmissionMetrics>) -> Self {
        Self {
            table,
            keys,
            metrics,
        }
    }
}

#[async_trait]
impl AdmissionMiddleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> AdmissionResult<ControlFlow> {
        let entry = self.table.resolve(ctx.uri.path());
        let key = self.keys.extract(ctx);
        let decision = entry.limiter.check(&key, Utc::now()).await;
        self.metrics.record(&decision);

        if decision.allowed {
            ctx.admission = Some(Admission {
                key,
                limiter: entry.limiter.clone(),
                decision,
            });
            return Ok(ControlFlow::Continue);
        }

        tracing::debug!(
            request_id = %ctx.request_id,
            policy = %entry.limiter.name(),
            key = %key,
            banned = decision.banned,
            retry_after = ?decision.retry_after_secs,
            "request rejected by rate limiter"
        );

        let message = entry.limiter.rejection_message(&decision);
        let mut response = AdmissionError::from_decision(&decision, message).into_response();
        attach_quota_headers(&decision, response.headers_mut());
        Ok(ControlFlow::ShortCircuit(response))
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> AdmissionResult<()> {
        let Some(admission) = &ctx.admission else {
            return Ok(());
        };

        attach_quota_headers(&admission.decision, response.headers_mut());

        let outcome = Outcome::from_status(response.status());
        if admission
            .limiter
            .complete(&admission.key, &admission.decision, outcome)
            .await
        {
            self.metrics.refunded();
        }

        Ok(())
    }
}

/// Sets the `X-RateLimit-*` headers; the reset time is ISO-8601 in UTC.
pub fn attach_quota_headers(decision: &Decision, headers: &mut HeaderMap) {
    let values = [
        (LIMIT_HEADER, decision.limit.to_string()),
        (REMAINING_HEADER, decision.remaining.to_string()),
        (
            RESET_HEADER,
            decision.reset_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    ];

    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::ratelimit::DecisionSource;

    #[test]
    fn formats_reset_as_iso_timestamp() {
        let decision = Decision {
            allowed: true,
            limit: 100,
            remaining: 42,
            reset_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap(),
            retry_after_secs: None,
            banned: false,
            source: DecisionSource::Local,
            window_id: None,
        };

        let mut headers = HeaderMap::new();
        attach_quota_headers(&decision, &mut headers);

        assert_eq!(headers[LIMIT_HEADER], "100");
        assert_eq!(headers[REMAINING_HEADER], "42");
        assert_eq!(headers[RESET_HEADER], "2024-03-01T12:30:00.000Z");
    }
}
