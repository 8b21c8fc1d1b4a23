//! Server tunables.
//!
//! [`ServerConfig`] is built once at startup and shared read-only (behind an
//! `Arc`) by the dispatcher, the exchange processors and both reapers.
//! Values come from built-in defaults, optionally overlaid by a JSON document
//! ([`ServerConfig::from_json`]) and by `HTTP_ENGINE_*` environment variables
//! ([`ServerConfig::from_env`]).

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::router::MatchMode;

pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_IDLE_CHECK: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 200;
pub const DEFAULT_TIMER_CHECK: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_REQUEST_HEADERS: usize = 200;
pub const DEFAULT_MAX_REQUEST_HEADER_SIZE: usize = 380 * 1024;
pub const DEFAULT_DRAIN_AMOUNT: u64 = 64 * 1024;

const ENV_PREFIX: &str = "HTTP_ENGINE_";

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

/// Immutable server configuration.
///
/// `None` for a limit means "unbounded"; `None` for a timeout means the
/// corresponding check is disabled.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use http_engine::config::ServerConfig;
///
/// let config = ServerConfig::default()
///     .with_idle_interval(Duration::from_secs(5))
///     .with_max_request_time(Some(Duration::from_secs(2)));
///
/// // A silent fresh connection is reaped after the shorter of the two.
/// assert_eq!(config.newly_accepted_interval(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Time a connection may sit in IDLE before it is closed.
    pub idle_interval: Duration,
    /// Period of the idle reaper.
    pub idle_check: Duration,
    /// Ceiling on simultaneously open connections.
    pub max_connections: Option<usize>,
    /// Ceiling on connections kept warm in IDLE.
    pub max_idle_connections: usize,
    /// Longest time a connection may spend in REQUEST.
    pub max_request_time: Option<Duration>,
    /// Longest time a connection may spend in RESPONSE.
    pub max_response_time: Option<Duration>,
    /// Period of the request/response reaper.
    pub timer_check: Duration,
    pub max_request_headers: usize,
    pub max_request_header_size: usize,
    pub tcp_nodelay: bool,
    /// Unread request body bytes discarded to keep a connection reusable.
    pub drain_amount: u64,
    pub match_mode: MatchMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            idle_interval: DEFAULT_IDLE_INTERVAL,
            idle_check: DEFAULT_IDLE_CHECK,
            max_connections: None,
            max_idle_connections: DEFAULT_MAX_IDLE_CONNECTIONS,
            max_request_time: None,
            max_response_time: None,
            timer_check: DEFAULT_TIMER_CHECK,
            max_request_headers: DEFAULT_MAX_REQUEST_HEADERS,
            max_request_header_size: DEFAULT_MAX_REQUEST_HEADER_SIZE,
            tcp_nodelay: false,
            drain_amount: DEFAULT_DRAIN_AMOUNT,
            match_mode: MatchMode::PathPrefix,
        }
    }
}

// Wire shape of a configuration document. Every field is optional and
// overlays the defaults; non-positive limits and timeouts mean "unbounded".
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigDocument {
    idle_interval_secs: Option<u64>,
    idle_check_millis: Option<u64>,
    max_connections: Option<i64>,
    max_idle_connections: Option<u64>,
    max_request_secs: Option<i64>,
    max_response_secs: Option<i64>,
    timer_millis: Option<u64>,
    max_request_headers: Option<u64>,
    max_request_header_size: Option<u64>,
    nodelay: Option<bool>,
    drain_amount: Option<u64>,
    path_matcher: Option<MatchMode>,
}

impl ServerConfig {
    /// Loads defaults overlaid with `HTTP_ENGINE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for values that do not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().overlay_env(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Loads defaults overlaid with a JSON document.
    ///
    /// ```
    /// use http_engine::config::ServerConfig;
    ///
    /// let document = r#"{ "max_idle_connections": 1, "max_connections": 0 }"#;
    /// let config = ServerConfig::from_json(document).unwrap();
    /// assert_eq!(config.max_idle_connections, 1);
    /// assert_eq!(config.max_connections, None);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON or unknown keys.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let doc: ConfigDocument = serde_json::from_str(document)?;
        Ok(Self::default().overlay(doc))
    }

    fn overlay(mut self, doc: ConfigDocument) -> Self {
        if let Some(v) = doc.idle_interval_secs {
            self.idle_interval = Duration::from_secs(v);
        }
        if let Some(v) = doc.idle_check_millis {
            self.idle_check = Duration::from_millis(v.max(1));
        }
        if let Some(v) = doc.max_connections {
            self.max_connections = positive(v).map(|n| n as usize);
        }
        if let Some(v) = doc.max_idle_connections {
            self.max_idle_connections = v as usize;
        }
        if let Some(v) = doc.max_request_secs {
            self.max_request_time = positive(v).map(Duration::from_secs);
        }
        if let Some(v) = doc.max_response_secs {
            self.max_response_time = positive(v).map(Duration::from_secs);
        }
        if let Some(v) = doc.timer_millis {
            self.timer_check = Duration::from_millis(v.max(1));
        }
        if let Some(v) = doc.max_request_headers {
            self.max_request_headers = v as usize;
        }
        if let Some(v) = doc.max_request_header_size {
            self.max_request_header_size = v as usize;
        }
        if let Some(v) = doc.nodelay {
            self.tcp_nodelay = v;
        }
        if let Some(v) = doc.drain_amount {
            self.drain_amount = v;
        }
        if let Some(v) = doc.path_matcher {
            self.match_mode = v;
        }
        self
    }

    // Split out from `from_env` so tests can supply variables without
    // touching the process environment.
    fn overlay_env<F>(self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(
            key: &str,
            raw: Option<String>,
        ) -> Result<Option<T>, ConfigError> {
            raw.map(|value| {
                value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{key}"),
                    value,
                })
            })
            .transpose()
        }

        let path_matcher = match lookup("PATH_MATCHER") {
            Some(raw) => Some(raw.parse::<MatchMode>().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}PATH_MATCHER"),
                value: raw,
            })?),
            None => None,
        };

        let doc = ConfigDocument {
            idle_interval_secs: parse("IDLE_INTERVAL_SECS", lookup("IDLE_INTERVAL_SECS"))?,
            idle_check_millis: parse("IDLE_CHECK_MILLIS", lookup("IDLE_CHECK_MILLIS"))?,
            max_connections: parse("MAX_CONNECTIONS", lookup("MAX_CONNECTIONS"))?,
            max_idle_connections: parse("MAX_IDLE_CONNECTIONS", lookup("MAX_IDLE_CONNECTIONS"))?,
            max_request_secs: parse("MAX_REQUEST_SECS", lookup("MAX_REQUEST_SECS"))?,
            max_response_secs: parse("MAX_RESPONSE_SECS", lookup("MAX_RESPONSE_SECS"))?,
            timer_millis: parse("TIMER_MILLIS", lookup("TIMER_MILLIS"))?,
            max_request_headers: parse("MAX_REQUEST_HEADERS", lookup("MAX_REQUEST_HEADERS"))?,
            max_request_header_size: parse(
                "MAX_REQUEST_HEADER_SIZE",
                lookup("MAX_REQUEST_HEADER_SIZE"),
            )?,
            nodelay: parse("NODELAY", lookup("NODELAY"))?,
            drain_amount: parse("DRAIN_AMOUNT", lookup("DRAIN_AMOUNT"))?,
            path_matcher,
        };
        Ok(self.overlay(doc))
    }

    /// Idle interval applied to connections that have not sent a byte yet.
    ///
    /// Such a connection cannot be told apart from one that will never send
    /// a request, so a configured maximum request time caps it.
    pub fn newly_accepted_interval(&self) -> Duration {
        match self.max_request_time {
            Some(max) => self.idle_interval.min(max),
            None => self.idle_interval,
        }
    }

    /// Returns `true` if the request/response reaper has anything to do.
    pub fn has_exchange_timeouts(&self) -> bool {
        self.max_request_time.is_some() || self.max_response_time.is_some()
    }

    #[must_use]
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    #[must_use]
    pub fn with_idle_check(mut self, period: Duration) -> Self {
        self.idle_check = period;
        self
    }

    #[must_use]
    pub fn with_max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    #[must_use]
    pub fn with_max_idle_connections(mut self, max: usize) -> Self {
        self.max_idle_connections = max;
        self
    }

    /// `None` or a zero duration disables the request-time check.
    #[must_use]
    pub fn with_max_request_time(mut self, max: Option<Duration>) -> Self {
        self.max_request_time = max.filter(|d| !d.is_zero());
        self
    }

    /// `None` or a zero duration disables the response-time check.
    #[must_use]
    pub fn with_max_response_time(mut self, max: Option<Duration>) -> Self {
        self.max_response_time = max.filter(|d| !d.is_zero());
        self
    }

    #[must_use]
    pub fn with_timer_check(mut self, period: Duration) -> Self {
        self.timer_check = period;
        self
    }

    #[must_use]
    pub fn with_max_request_headers(mut self, max: usize) -> Self {
        self.max_request_headers = max;
        self
    }

    #[must_use]
    pub fn with_max_request_header_size(mut self, bytes: usize) -> Self {
        self.max_request_header_size = bytes;
        self
    }

    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    #[must_use]
    pub fn with_drain_amount(mut self, bytes: u64) -> Self {
        self.drain_amount = bytes;
        self
    }

    #[must_use]
    pub fn with_match_mode(mut self, mode: MatchMode) -> Self {
        self.match_mode = mode;
        self
    }
}

fn positive(v: i64) -> Option<u64> {
    (v > 0).then_some(v as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let c = ServerConfig::default();
        assert_eq!(c.idle_interval, Duration::from_secs(30));
        assert_eq!(c.idle_check, Duration::from_secs(10));
        assert_eq!(c.max_connections, None);
        assert_eq!(c.max_idle_connections, 200);
        assert_eq!(c.max_request_time, None);
        assert_eq!(c.max_response_time, None);
        assert_eq!(c.timer_check, Duration::from_secs(1));
        assert_eq!(c.max_request_headers, 200);
        assert_eq!(c.max_request_header_size, 389_120);
        assert!(!c.tcp_nodelay);
        assert!(!c.has_exchange_timeouts());
    }

    #[test]
    fn env_overrides() {
        let c = ServerConfig::default()
            .overlay_env(env(&[
                ("IDLE_INTERVAL_SECS", "5"),
                ("MAX_IDLE_CONNECTIONS", "1"),
                ("MAX_REQUEST_SECS", "2"),
                ("MAX_RESPONSE_SECS", "-1"),
                ("NODELAY", "true"),
                ("PATH_MATCHER", "stringprefix"),
            ]))
            .unwrap();
        assert_eq!(c.idle_interval, Duration::from_secs(5));
        assert_eq!(c.max_idle_connections, 1);
        assert_eq!(c.max_request_time, Some(Duration::from_secs(2)));
        assert_eq!(c.max_response_time, None);
        assert!(c.tcp_nodelay);
        assert_eq!(c.match_mode, MatchMode::StringPrefix);
        assert_eq!(c.newly_accepted_interval(), Duration::from_secs(2));
    }

    #[test]
    fn env_rejects_garbage() {
        let err = ServerConfig::default()
            .overlay_env(env(&[("MAX_CONNECTIONS", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref key, .. } if key == "HTTP_ENGINE_MAX_CONNECTIONS"
        ));
    }

    #[test]
    fn json_overlay() {
        let c = ServerConfig::from_json(
            r#"{ "max_connections": 10, "max_response_secs": 3, "path_matcher": "stringprefix" }"#,
        )
        .unwrap();
        assert_eq!(c.max_connections, Some(10));
        assert_eq!(c.max_response_time, Some(Duration::from_secs(3)));
        assert_eq!(c.match_mode, MatchMode::StringPrefix);
        assert!(c.has_exchange_timeouts());
    }

    #[test]
    fn json_rejects_unknown_keys() {
        assert!(matches!(
            ServerConfig::from_json(r#"{ "idle": 1 }"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_timeouts_disable_checks() {
        let c = ServerConfig::default()
            .with_max_request_time(Some(Duration::ZERO))
            .with_max_response_time(None);
        assert!(!c.has_exchange_timeouts());
    }
}
