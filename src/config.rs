use anyhow::{Context, Result, anyhow};
use std::{
    env,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use crate::{
    key::parse_key_header,
    ratelimit::{
        policy::{PolicyConfig, RouteClass},
        progressive::ProgressiveConfig,
    },
};

#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    pub bind_addr: SocketAddr,
    pub rate_limit: RateLimitConfig,
    pub policies: Vec<PolicyRoute>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub backend: CounterBackendConfig,
    pub key_header: Option<String>,
    pub trust_forwarded_for: bool,
    pub per_route_keys: bool,
    pub sweep_interval: Duration,
    pub store_timeout: Duration,
    pub progressive: ProgressiveConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CounterBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterKind {
    FixedWindow,
    Progressive,
    Distributed,
}

impl FromStr for LimiterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fixed" | "fixed_window" => Ok(Self::FixedWindow),
            "progressive" => Ok(Self::Progressive),
            "distributed" => Ok(Self::Distributed),
            other => Err(anyhow!("unsupported limiter kind: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicyRoute {
    pub name: String,
    pub path_prefix: String,
    pub policy: PolicyConfig,
    pub kind: LimiterKind,
}

impl AdmissionConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any variable source; invalid values are errors, never defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let bind_addr = vars
            .string("BIND_ADDR", "0.0.0.0:8080")
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let backend_name = vars.string("RATE_LIMIT_BACKEND", "memory").to_ascii_lowercase();
        let backend = match backend_name.as_str() {
            "memory" | "in_memory" => CounterBackendConfig::InMemory,
            "redis" => CounterBackendConfig::Redis {
                url: vars.string("REDIS_URL", "redis://127.0.0.1:6379"),
                key_prefix: vars.string("REDIS_KEY_PREFIX", "admission:ratelimit"),
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        let defaults = ProgressiveConfig::default();
        let progressive = ProgressiveConfig {
            penalty_step: vars.parse("PROGRESSIVE_PENALTY_STEP", defaults.penalty_step)?,
            floor_limit: vars.parse("PROGRESSIVE_FLOOR", defaults.floor_limit)?,
            ban_threshold: vars.parse("PROGRESSIVE_BAN_THRESHOLD", defaults.ban_threshold)?,
            ban_message: vars.string("PROGRESSIVE_BAN_MESSAGE", &defaults.ban_message),
        };
        progressive.validate("progressive")?;

        let store_timeout =
            Duration::from_millis(vars.parse("RATE_LIMIT_STORE_TIMEOUT_MS", 250u64)?);
        if store_timeout.is_zero() {
            return Err(anyhow!("RATE_LIMIT_STORE_TIMEOUT_MS must be greater than zero"));
        }

        let sweep_interval = Duration::from_secs(vars.parse("RATE_LIMIT_SWEEP_SECONDS", 60u64)?);
        if sweep_interval.is_zero() {
            return Err(anyhow!("RATE_LIMIT_SWEEP_SECONDS must be greater than zero"));
        }

        let key_header = vars
            .get("RATE_LIMIT_KEY_HEADER")
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty());
        if let Some(header) = &key_header {
            parse_key_header(header).context("invalid RATE_LIMIT_KEY_HEADER")?;
        }

        let rate_limit = RateLimitConfig {
            enabled: vars.parse("RATE_LIMIT_ENABLED", true)?,
            backend,
            key_header,
            trust_forwarded_for: vars.parse("RATE_LIMIT_TRUST_FORWARDED_FOR", false)?,
            per_route_keys: vars.parse("RATE_LIMIT_PER_ROUTE", false)?,
            sweep_interval,
            store_timeout,
            progressive,
        };

        let policies = RouteClass::ALL
            .iter()
            .map(|class| policy_route(&vars, *class, &rate_limit.backend))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            bind_addr,
            rate_limit,
            policies,
        })
    }
}

fn policy_route<F>(
    vars: &Vars<F>,
    class: RouteClass,
    backend: &CounterBackendConfig,
) -> Result<PolicyRoute>
where
    F: Fn(&str) -> Option<String>,
{
    let name = class.name();
    let var = |suffix: &str| format!("POLICY_{}_{}", name.to_ascii_uppercase(), suffix);
    let defaults = class.default_policy();

    let path_prefix = match class {
        RouteClass::CatchAll => class.default_prefix().to_string(),
        _ => vars.string(&var("PREFIX"), class.default_prefix()),
    };
    if !path_prefix.starts_with('/') {
        return Err(anyhow!("{} must start with '/'", var("PREFIX")));
    }

    let window_ms = vars.parse(&var("WINDOW_MS"), defaults.window.as_millis() as u64)?;
    let policy = PolicyConfig::new(
        Duration::from_millis(window_ms),
        vars.parse(&var("MAX"), defaults.max)?,
        vars.string(&var("MESSAGE"), &defaults.message),
    )
    .skip_successful(vars.parse(&var("SKIP_SUCCESSFUL"), defaults.skip_successful_requests)?)
    .skip_failed(vars.parse(&var("SKIP_FAILED"), defaults.skip_failed_requests)?);
    policy.validate(name)?;

    let default_kind = match (class, backend) {
        (RouteClass::Api, _) => LimiterKind::Progressive,
        (_, CounterBackendConfig::Redis { .. }) => LimiterKind::Distributed,
        (_, CounterBackendConfig::InMemory) => LimiterKind::FixedWindow,
    };
    let kind = vars.parse(&var("KIND"), default_kind)?;
    if kind == LimiterKind::Distributed && *backend == CounterBackendConfig::InMemory {
        return Err(anyhow!(
            "policy {name} uses the distributed limiter but RATE_LIMIT_BACKEND is not redis"
        ));
    }

    Ok(PolicyRoute {
        name: name.to_string(),
        path_prefix,
        policy,
        kind,
    })
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid {key}={raw}: {e}")),
            None => Ok(default),
        }
    }
}
