use std::{
    net::SocketAddr,
    sync::Arc,
};

use admission_gate::{
    Gatekeeper,
    admit,
    config::AdmissionConfig,
    ratelimit::store::spawn_sweeper,
};
use anyhow::Context;
use axum::{
    Json,
    Router,
    extract::State,
    http::{StatusCode, Uri},
    middleware,
    routing::{any, get},
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cfg = AdmissionConfig::from_env().context("failed to build admission config")?;
    let bind_addr = cfg.bind_addr;

    let gatekeeper = Arc::new(
        Gatekeeper::from_config(&cfg).context("invalid rate limit configuration")?,
    );
    let _sweeper = spawn_sweeper(gatekeeper.store(), cfg.rate_limit.sweep_interval);

    let protected = Router::new()
        .fallback(any(protected_handler))
        .layer(middleware::from_fn_with_state(gatekeeper.clone(), admit));

    let app = Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .with_state(gatekeeper)
        .merge(protected);

    let listener = TcpListener::bind(bind_addr)
        .await
        .context("failed to bind listener")?;

    tracing::info!(addr = %bind_addr, "admission gate listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("admission gate server error")?;

    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(gatekeeper): State<Arc<Gatekeeper>>) -> (StatusCode, String) {
    (StatusCode::OK, gatekeeper.metrics().render_prometheus())
}

async fn protected_handler(uri: Uri) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true, "path": uri.path() }))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,hyper=warn,redis=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
