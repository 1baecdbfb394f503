use async_trait::async_trait;

use crate::{
    context::RequestContext,
    error::AdmissionResult,
    middleware::{AdmissionMiddleware, ControlFlow},
};

pub struct RequestLoggingMiddleware;

#[async_trait]
impl AdmissionMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> AdmissionResult<ControlFlow> {
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            client_ip = ?ctx.client_ip,
            "incoming request"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut axum::response::Response,
    ) -> AdmissionResult<()> {
        let latency_ms = ctx.started_at.elapsed().as_millis();
        let admission = ctx.admission.as_ref();
        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            status = %response.status(),
            policy = ?admission.map(|a| a.limiter.name()),
            remaining = ?admission.map(|a| a.decision.remaining),
            latency_ms = latency_ms,
            "request completed"
        );
        Ok(())
    }
}
