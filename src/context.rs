use http::{HeaderMap, Method, Uri};
use std::{
    net::IpAddr,
    sync::Arc,
    time::Instant,
};

use crate::ratelimit::{Decision, Limiter};

/// Admission verdict remembered until the response is known.
#[derive(Clone)]
pub struct Admission {
    pub key: String,
    pub limiter: Arc<dyn Limiter>,
    pub decision: Decision,
}

#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub started_at: Instant,
    pub admission: Option<Admission>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            client_ip,
            started_at: Instant::now(),
            admission: None,
        }
    }
}
