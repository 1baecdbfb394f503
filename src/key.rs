use std::net::IpAddr;

use http::{HeaderMap, HeaderName};

use crate::{context::RequestContext, error::ConfigError};

/// Maps a request to the identity its quota is charged against.
///
/// Only low-cardinality identities belong here: every distinct key costs one
/// window record per limiter until the sweep removes it.
#[derive(Debug, Clone, Default)]
pub struct KeyExtractor {
    header: Option<HeaderName>,
    trust_forwarded_for: bool,
    per_route: bool,
}

impl KeyExtractor {
    pub fn new(
        header: Option<&str>,
        trust_forwarded_for: bool,
        per_route: bool,
    ) -> Result<Self, ConfigError> {
        let header = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(parse_key_header)
            .transpose()?;

        Ok(Self {
            header,
            trust_forwarded_for,
            per_route,
        })
    }

    pub fn extract(&self, ctx: &RequestContext) -> String {
        let identity = self
            .header_identity(&ctx.headers)
            .or_else(|| self.forwarded_identity(&ctx.headers).map(|ip| ip.to_string()))
            .or_else(|| ctx.client_ip.map(|ip| ip.to_string()))
            .unwrap_or_else(|| "anonymous".to_string());

        if self.per_route {
            format!("{}:{}", identity, ctx.uri.path())
        } else {
            identity
        }
    }

    fn header_identity(&self, headers: &HeaderMap) -> Option<String> {
        let header = self.header.as_ref()?;
        headers
            .get(header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
    }

    fn forwarded_identity(&self, headers: &HeaderMap) -> Option<IpAddr> {
        if !self.trust_forwarded_for {
            return None;
        }
        headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|first| first.trim().parse().ok())
    }
}

/// Header names are matched case-insensitively; anything `http` rejects is a startup error.
pub fn parse_key_header(name: &str) -> Result<HeaderName, ConfigError> {
    HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| {
        ConfigError::Invalid(format!("key header is not a valid header name: {name:?}"))
    })
}
