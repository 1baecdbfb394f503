use std::{
    sync::Arc,
    time::Duration,
};

use chrono::TimeDelta;

use crate::{
    error::ConfigError,
    ratelimit::{Limiter, Outcome},
};

const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyConfig {
    pub window: Duration,
    pub max: u64,
    pub message: String,
    pub skip_successful_requests: bool,
    pub skip_failed_requests: bool,
}

impl PolicyConfig {
    pub fn new(window: Duration, max: u64, message: impl Into<String>) -> Self {
        Self {
            window,
            max,
            message: message.into(),
            skip_successful_requests: false,
            skip_failed_requests: false,
        }
    }

    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::policy(name, "max must be greater than zero"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::policy(name, "window must be greater than zero"));
        }
        if self.window > MAX_WINDOW {
            return Err(ConfigError::policy(name, "window must not exceed 366 days"));
        }
        Ok(())
    }

    pub fn window_delta(&self) -> TimeDelta {
        TimeDelta::from_std(self.window.min(MAX_WINDOW)).unwrap_or_else(|_| TimeDelta::zero())
    }

    /// Whole seconds covered by the window, rounded up.
    pub fn window_secs(&self) -> u64 {
        (self.window.as_millis() as u64).div_ceil(1_000)
    }

    /// Whether a request that finished with `outcome` gets its hit refunded.
    pub fn refunds(&self, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Success => self.skip_successful_requests,
            Outcome::Failure => self.skip_failed_requests,
        }
    }
}

/// Route classes with their reference prefixes and budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Auth,
    Api,
    Search,
    Upload,
    CatchAll,
}

impl RouteClass {
    pub const ALL: [RouteClass; 5] = [
        RouteClass::Auth,
        RouteClass::Api,
        RouteClass::Search,
        RouteClass::Upload,
        RouteClass::CatchAll,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Api => "api",
            Self::Search => "search",
            Self::Upload => "upload",
            Self::CatchAll => "default",
        }
    }

    pub fn default_prefix(self) -> &'static str {
        match self {
            Self::Auth => "/api/auth",
            Self::Api => "/api",
            Self::Search => "/api/search",
            Self::Upload => "/api/upload",
            Self::CatchAll => "/",
        }
    }

    pub fn default_policy(self) -> PolicyConfig {
        match self {
            // only failed logins consume quota
            Self::Auth => PolicyConfig::new(
                Duration::from_secs(15 * 60),
                5,
                "Too many login attempts, please try again later.",
            )
            .skip_successful(true),
            Self::Api => PolicyConfig::new(
                Duration::from_secs(15 * 60),
                100,
                "Too many requests from this client, please try again later.",
            ),
            Self::Search => PolicyConfig::new(
                Duration::from_secs(60),
                30,
                "Too many search requests, please slow down.",
            ),
            Self::Upload => PolicyConfig::new(
                Duration::from_secs(60 * 60),
                10,
                "Upload limit reached, please try again later.",
            ),
            Self::CatchAll => PolicyConfig::new(
                Duration::from_secs(15 * 60),
                1_000,
                "Rate limit exceeded. Please try again later.",
            ),
        }
    }
}

pub struct PolicyEntry {
    pub path_prefix: String,
    pub limiter: Arc<dyn Limiter>,
}

/// Ordered route-prefix table; exactly one limiter per request.
pub struct PolicyTable {
    entries: Vec<PolicyEntry>,
}

impl PolicyTable {
    pub fn new(mut entries: Vec<PolicyEntry>) -> Result<Self, ConfigError> {
        for entry in &entries {
            if !entry.path_prefix.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "policy {} has a prefix that does not start with '/': {}",
                    entry.limiter.name(),
                    entry.path_prefix
                )));
            }
            entry.limiter.policy().validate(entry.limiter.name())?;
        }

        // most specific prefix first, catch-all last
        entries.sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));

        for pair in entries.windows(2) {
            if pair[0].path_prefix == pair[1].path_prefix {
                return Err(ConfigError::Invalid(format!(
                    "duplicate policy prefix: {}",
                    pair[0].path_prefix
                )));
            }
        }

        if entries.last().map(|e| e.path_prefix.as_str()) != Some("/") {
            return Err(ConfigError::Invalid(
                "policy table needs a catch-all entry for '/'".to_string(),
            ));
        }

        Ok(Self { entries })
    }

    pub fn resolve(&self, path: &str) -> &PolicyEntry {
        let catch_all = self.entries.len() - 1;
        self.entries
            .iter()
            .find(|entry| covers(&entry.path_prefix, path))
            .unwrap_or(&self.entries[catch_all])
    }
}

/// Prefix match on whole path segments: `/api` covers `/api` and `/api/x`, not `/apiary`.
fn covers(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{fixed_window::FixedWindowLimiter, store::WindowStore};

    fn entry(store: &Arc<WindowStore>, prefix: &str, class: RouteClass) -> PolicyEntry {
        PolicyEntry {
            path_prefix: prefix.to_string(),
            limiter: Arc::new(FixedWindowLimiter::new(
                class.name(),
                class.default_policy(),
                store.clone(),
            )),
        }
    }

    fn reference_table() -> PolicyTable {
        let store = Arc::new(WindowStore::new());
        PolicyTable::new(
            RouteClass::ALL
                .iter()
                .map(|class| entry(&store, class.default_prefix(), *class))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn rejects_zero_max_and_zero_window() {
        let zero_max = PolicyConfig::new(Duration::from_secs(1), 0, "x");
        assert!(matches!(
            zero_max.validate("p"),
            Err(ConfigError::InvalidPolicy { .. })
        ));

        let zero_window = PolicyConfig::new(Duration::ZERO, 5, "x");
        assert!(zero_window.validate("p").is_err());

        assert!(RouteClass::Auth.default_policy().validate("auth").is_ok());
    }

    #[test]
    fn resolves_most_specific_prefix() {
        let table = reference_table();

        assert_eq!(table.resolve("/api/auth/login").limiter.name(), "auth");
        assert_eq!(table.resolve("/api/search").limiter.name(), "search");
        assert_eq!(table.resolve("/api/upload/file").limiter.name(), "upload");
        assert_eq!(table.resolve("/api/users").limiter.name(), "api");
        assert_eq!(table.resolve("/index.html").limiter.name(), "default");
    }

    #[test]
    fn prefixes_match_whole_segments() {
        let table = reference_table();

        assert_eq!(table.resolve("/api").limiter.name(), "api");
        assert_eq!(table.resolve("/api/").limiter.name(), "api");
        assert_eq!(table.resolve("/apiary").limiter.name(), "default");
        assert_eq!(table.resolve("/api/authz").limiter.name(), "api");
        assert_eq!(table.resolve("/api/searches").limiter.name(), "api");
        assert_eq!(table.resolve("/").limiter.name(), "default");
    }

    #[test]
    fn requires_catch_all_entry() {
        let store = Arc::new(WindowStore::new());
        let result = PolicyTable::new(vec![entry(&store, "/api", RouteClass::Api)]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_duplicate_prefixes() {
        let store = Arc::new(WindowStore::new());
        let result = PolicyTable::new(vec![
            entry(&store, "/api", RouteClass::Api),
            entry(&store, "/api", RouteClass::Search),
            entry(&store, "/", RouteClass::CatchAll),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn refund_follows_skip_flags() {
        let policy = RouteClass::Auth.default_policy();
        assert!(policy.refunds(Outcome::Success));
        assert!(!policy.refunds(Outcome::Failure));
        assert_eq!(policy.window_secs(), 900);
    }
}
