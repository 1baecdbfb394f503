use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{
    config::{AdmissionConfig, CounterBackendConfig, LimiterKind},
    context::RequestContext,
    error::ConfigError,
    key::KeyExtractor,
    metrics::AdmissionMetrics,
    middleware::{
        AdmissionMiddleware,
        ControlFlow,
        logging::RequestLoggingMiddleware,
        rate_limit::RateLimitMiddleware,
    },
    ratelimit::{
        Limiter,
        counter::{CounterStore, RedisCounterStore},
        distributed::DistributedLimiter,
        fixed_window::FixedWindowLimiter,
        policy::{PolicyEntry, PolicyTable},
        progressive::ProgressiveLimiter,
        store::WindowStore,
    },
};

/// Runs the admission chain around a protected handler.
pub struct Gatekeeper {
    middlewares: Vec<Arc<dyn AdmissionMiddleware>>,
    store: Arc<WindowStore>,
    metrics: Arc<AdmissionMetrics>,
}

impl Gatekeeper {
    pub fn new(
        middlewares: Vec<Arc<dyn AdmissionMiddleware>>,
        store: Arc<WindowStore>,
        metrics: Arc<AdmissionMetrics>,
    ) -> Self {
        Self {
            middlewares,
            store,
            metrics,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Result<Self, ConfigError> {
        let store = Arc::new(WindowStore::new());
        let metrics = Arc::new(AdmissionMetrics::new());

        let mut middlewares: Vec<Arc<dyn AdmissionMiddleware>> =
            vec![Arc::new(RequestLoggingMiddleware)];

        if config.rate_limit.enabled {
            let table = build_policy_table(config, &store)?;
            let keys = KeyExtractor::new(
                config.rate_limit.key_header.as_deref(),
                config.rate_limit.trust_forwarded_for,
                config.rate_limit.per_route_keys,
            )?;
            middlewares.push(Arc::new(RateLimitMiddleware::new(
                table,
                keys,
                metrics.clone(),
            )));
        }

        Ok(Self::new(middlewares, store, metrics))
    }

    pub fn store(&self) -> Arc<WindowStore> {
        self.store.clone()
    }

    pub fn metrics(&self) -> Arc<AdmissionMetrics> {
        self.metrics.clone()
    }

    pub async fn handle(
        &self,
        request: Request,
        client_ip: Option<IpAddr>,
        next: Next,
    ) -> Response {
        let request_id = request
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            request.method().clone(),
            request.uri().clone(),
            request.headers().clone(),
            client_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(mut response)) => {
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err.message(),
                        "middleware rejected request"
                    );
                    let mut response = err.into_response();
                    self.apply_response_middlewares(&executed, &ctx, &mut response)
                        .await;
                    attach_request_id(&ctx.request_id, &mut response);
                    return response;
                }
            }
        }

        let mut response = next.run(request).await;
        self.apply_response_middlewares(&executed, &ctx, &mut response)
            .await;
        attach_request_id(&ctx.request_id, &mut response);
        response
    }

    async fn apply_response_middlewares(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err.message(),
                    "middleware post-response hook failed"
                );
            }
        }
    }
}

/// `axum::middleware::from_fn_with_state` entry point.
pub async fn admit(
    State(gatekeeper): State<Arc<Gatekeeper>>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gatekeeper.handle(request, client_ip, next).await
}

fn attach_request_id(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
}

fn build_policy_table(
    config: &AdmissionConfig,
    store: &Arc<WindowStore>,
) -> Result<PolicyTable, ConfigError> {
    let rate_limit = &config.rate_limit;
    rate_limit.progressive.validate("progressive")?;

    let counters: Option<Arc<dyn CounterStore>> = match &rate_limit.backend {
        CounterBackendConfig::InMemory => None,
        CounterBackendConfig::Redis { url, key_prefix } => {
            let redis = RedisCounterStore::new(url, key_prefix.clone())
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            Some(Arc::new(redis) as Arc<dyn CounterStore>)
        }
    };

    let mut entries = Vec::with_capacity(config.policies.len());
    for route in &config.policies {
        route.policy.validate(&route.name)?;

        let limiter: Arc<dyn Limiter> = match route.kind {
            LimiterKind::FixedWindow => Arc::new(FixedWindowLimiter::new(
                route.name.clone(),
                route.policy.clone(),
                store.clone(),
            )),
            LimiterKind::Progressive => Arc::new(ProgressiveLimiter::new(
                route.name.clone(),
                route.policy.clone(),
                rate_limit.progressive.clone(),
                store.clone(),
            )),
            LimiterKind::Distributed => {
                let counters = counters.clone().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "policy {} is distributed but RATE_LIMIT_BACKEND is not redis",
                        route.name
                    ))
                })?;
                Arc::new(DistributedLimiter::new(
                    route.name.clone(),
                    route.policy.clone(),
                    counters,
                    store.clone(),
                    rate_limit.store_timeout,
                ))
            }
        };

        tracing::info!(
            policy = %route.name,
            prefix = %route.path_prefix,
            kind = ?route.kind,
            window_ms = route.policy.window.as_millis() as u64,
            max = route.policy.max,
            "rate limit policy loaded"
        );

        entries.push(PolicyEntry {
            path_prefix: route.path_prefix.clone(),
            limiter,
        });
    }

    PolicyTable::new(entries)
}
