use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::ratelimit::Decision;

pub type AdmissionResult<T> = Result<T, AdmissionError>;

/// Rejections surfaced to clients by the admission layer.
#[derive(Debug)]
pub enum AdmissionError {
    RateLimited { message: String, retry_after_secs: u64 },
    Banned { message: String, retry_after_secs: u64 },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
    retry_after: u64,
}

impl AdmissionError {
    /// Builds the rejection for a denied decision.
    pub fn from_decision(decision: &Decision, message: &str) -> Self {
        let retry_after_secs = decision.retry_after_secs.unwrap_or(0);
        if decision.banned {
            Self::Banned {
                message: message.to_string(),
                retry_after_secs,
            }
        } else {
            Self::RateLimited {
                message: message.to_string(),
                retry_after_secs,
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "Too many requests",
            Self::Banned { .. } => "Banned",
        }
    }

    pub fn message(&self) -> String {
        match self {
            Self::RateLimited { message, .. } | Self::Banned { message, .. } => message.clone(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Banned { .. } => StatusCode::FORBIDDEN,
        }
    }

    fn retry_after_secs(&self) -> u64 {
        match self {
            Self::RateLimited { retry_after_secs, .. } | Self::Banned { retry_after_secs, .. } => {
                *retry_after_secs
            }
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after_secs = self.retry_after_secs();
        let mut response = (status, Json(ErrorBody {
            error: self.code(),
            message: self.message(),
            retry_after: retry_after_secs,
        }))
            .into_response();

        if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }

        if !response.headers().contains_key(header::CONTENT_TYPE) {
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }

        response
    }
}

/// Startup-time configuration problems. The process refuses to start on any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid policy {name}: {reason}")]
    InvalidPolicy { name: String, reason: &'static str },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn policy(name: &str, reason: &'static str) -> Self {
        Self::InvalidPolicy {
            name: name.to_string(),
            reason,
        }
    }
}

/// Failures talking to the shared counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("counter store timed out after {0:?}")]
    Timeout(Duration),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}
