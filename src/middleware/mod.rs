pub mod logging;
pub mod rate_limit;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::AdmissionResult,
};

pub enum ControlFlow {
    Continue,
    ShortCircuit(Response<Body>),
}

/// One stage of the admission chain wrapped around the protected handler.
#[async_trait]
pub trait AdmissionMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn on_request(&self, ctx: &mut RequestContext) -> AdmissionResult<ControlFlow>;

    /// Runs after the protected handler, in reverse chain order, with the final response.
    async fn on_response(
        &self,
        _ctx: &RequestContext,
        _response: &mut Response<Body>,
    ) -> AdmissionResult<()> {
        Ok(())
    }
}
