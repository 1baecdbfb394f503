use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use admission_gate::{Gatekeeper, admit, config::AdmissionConfig};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{HeaderMap, Request, StatusCode},
    middleware,
    response::Response,
    routing::{any, post},
};
use tower::ServiceExt;

fn gatekeeper(pairs: &[(&str, &str)]) -> Arc<Gatekeeper> {
    let vars: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let cfg = AdmissionConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    Arc::new(Gatekeeper::from_config(&cfg).unwrap())
}

fn app(gatekeeper: Arc<Gatekeeper>, hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route("/api/auth/login", post(login))
        .fallback(any(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                "ok"
            }
        }))
        .layer(middleware::from_fn_with_state(gatekeeper, admit))
}

async fn login(headers: HeaderMap) -> StatusCode {
    match headers.get("x-password").and_then(|v| v.to_str().ok()) {
        Some("hunter2") => StatusCode::OK,
        _ => StatusCode::UNAUTHORIZED,
    }
}

fn request(method: &str, path: &str, ip: [u8; 4]) -> Request<Body> {
    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .unwrap();
    request
        .extensions_mut()
        .insert(ConnectInfo(SocketAddr::from((ip, 40_000))));
    request
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json(response: Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response.headers()[name].to_str().unwrap()
}

#[tokio::test]
async fn allowed_requests_carry_quota_headers() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(gatekeeper(&[("POLICY_SEARCH_MAX", "3")]), hits.clone());

    let mut reset = None;
    for expected_remaining in ["2", "1", "0"] {
        let response = send(&app, request("GET", "/api/search?q=a", [10, 0, 0, 1])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-limit"), "3");
        assert_eq!(header(&response, "x-ratelimit-remaining"), expected_remaining);

        let this_reset = header(&response, "x-ratelimit-reset").to_string();
        assert!(this_reset.ends_with('Z'));
        if let Some(previous) = &reset {
            assert_eq!(previous, &this_reset);
        }
        reset = Some(this_reset);
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_quota_is_rejected_without_calling_handler() {
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(gatekeeper(&[("POLICY_SEARCH_MAX", "1")]), hits.clone());

    send(&app, request("GET", "/api/search", [10, 0, 0, 1])).await;
    let response = send(&app, request("GET", "/api/search", [10, 0, 0, 1])).await;

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");
    assert!(response.headers().contains_key("x-ratelimit-reset"));
    assert!(response.headers().contains_key("x-request-id"));
    let retry_after: u64 = header(&response, "retry-after").parse().unwrap();
    assert!(retry_after > 0 && retry_after <= 60);

    let body = json(response).await;
    assert_eq!(body["error"], "Too many requests");
    assert_eq!(body["message"], "Too many search requests, please slow down.");
    assert_eq!(body["retryAfter"], retry_after);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    let other_client = send(&app, request("GET", "/api/search", [10, 0, 0, 2])).await;
    assert_eq!(other_client.status(), StatusCode::OK);
}

#[tokio::test]
async fn only_failed_logins_consume_auth_quota() {
    let app = app(gatekeeper(&[]), Arc::new(AtomicUsize::new(0)));

    for _ in 0..10 {
        let mut ok = request("POST", "/api/auth/login", [10, 0, 0, 9]);
        ok.headers_mut().insert("x-password", "hunter2".parse().unwrap());
        assert_eq!(send(&app, ok).await.status(), StatusCode::OK);
    }

    for _ in 0..5 {
        let response = send(&app, request("POST", "/api/auth/login", [10, 0, 0, 9])).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    let response = send(&app, request("POST", "/api/auth/login", [10, 0, 0, 9])).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        json(response).await["message"],
        "Too many login attempts, please try again later."
    );
}

#[tokio::test]
async fn repeat_offenders_get_banned_on_one_policy_only() {
    let app = app(
        gatekeeper(&[
            ("POLICY_API_MAX", "3"),
            ("PROGRESSIVE_PENALTY_STEP", "1"),
            ("PROGRESSIVE_FLOOR", "1"),
            ("PROGRESSIVE_BAN_THRESHOLD", "2"),
        ]),
        Arc::new(AtomicUsize::new(0)),
    );
    let client = [192, 168, 1, 50];

    for _ in 0..3 {
        let response = send(&app, request("GET", "/api/users", client)).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let throttled = send(&app, request("GET", "/api/users", client)).await;
    assert_eq!(throttled.status(), StatusCode::TOO_MANY_REQUESTS);

    let banned = send(&app, request("GET", "/api/users", client)).await;
    assert_eq!(banned.status(), StatusCode::FORBIDDEN);
    assert!(banned.headers().contains_key("retry-after"));
    let body = json(banned).await;
    assert_eq!(body["error"], "Banned");
    assert_eq!(
        body["message"],
        "Access blocked due to repeated rate limit violations."
    );

    let search = send(&app, request("GET", "/api/search", client)).await;
    assert_eq!(search.status(), StatusCode::OK);
}

#[tokio::test]
async fn unreachable_counter_store_fails_open_to_local_limits() {
    let gatekeeper = gatekeeper(&[
        ("RATE_LIMIT_BACKEND", "redis"),
        ("REDIS_URL", "redis://127.0.0.1:1"),
        ("RATE_LIMIT_STORE_TIMEOUT_MS", "100"),
        ("POLICY_SEARCH_MAX", "2"),
    ]);
    let metrics = gatekeeper.metrics();
    let app = app(gatekeeper, Arc::new(AtomicUsize::new(0)));

    for expected_remaining in ["1", "0"] {
        let response = send(&app, request("GET", "/api/search", [10, 1, 1, 1])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, "x-ratelimit-remaining"), expected_remaining);
    }

    let response = send(&app, request("GET", "/api/search", [10, 1, 1, 1])).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(
        metrics
            .render_prometheus()
            .contains("admission_fallback_total 3")
    );
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = app(gatekeeper(&[]), Arc::new(AtomicUsize::new(0)));
    let mut req = request("GET", "/", [10, 0, 0, 1]);
    req.headers_mut().insert("x-request-id", "abc-123".parse().unwrap());

    let response = send(&app, req).await;
    assert_eq!(header(&response, "x-request-id"), "abc-123");
    assert_eq!(header(&response, "x-ratelimit-limit"), "1000");
}

#[tokio::test]
async fn disabled_rate_limiting_passes_everything_through() {
    let app = app(
        gatekeeper(&[("RATE_LIMIT_ENABLED", "false"), ("POLICY_SEARCH_MAX", "1")]),
        Arc::new(AtomicUsize::new(0)),
    );

    for _ in 0..3 {
        let response = send(&app, request("GET", "/api/search", [10, 0, 0, 1])).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }
}
