//! Configuration types for a FluxMQ session

use crate::error::SessionError;
use ::config::{Config, Environment};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Consumer group membership of a session.
///
/// Group operations match on this instead of probing an optional name, so a
/// session that was started without a group can never reach the network with
/// a group request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum GroupIdentity {
    /// The session does not belong to a consumer group
    #[default]
    NoGroup,
    /// The session acts on behalf of the named consumer group
    Group(String),
}

impl GroupIdentity {
    /// Create a group identity from a name
    pub fn group<S: Into<String>>(name: S) -> Self {
        GroupIdentity::Group(name.into())
    }

    /// The group name, if any
    pub fn name(&self) -> Option<&str> {
        match self {
            GroupIdentity::NoGroup => None,
            GroupIdentity::Group(name) => Some(name),
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, GroupIdentity::Group(_))
    }

    /// The group name, or [`SessionError::GroupRequired`] naming `operation`
    pub fn require(&self, operation: &'static str) -> Result<&str, SessionError> {
        self.name()
            .ok_or_else(|| SessionError::group_required(operation))
    }
}

impl From<Option<String>> for GroupIdentity {
    fn from(name: Option<String>) -> Self {
        match name {
            Some(name) if !name.is_empty() => GroupIdentity::Group(name),
            _ => GroupIdentity::NoGroup,
        }
    }
}

impl fmt::Display for GroupIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupIdentity::NoGroup => write!(f, "<no group>"),
            GroupIdentity::Group(name) => write!(f, "{}", name),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bootstrap broker addresses (`host:port`); the first one answers metadata requests
    pub brokers: Vec<String>,
    /// Client identifier sent in every request header
    pub client_id: String,
    /// Consumer group the session acts for
    pub consumer_group: GroupIdentity,
    /// Timeout applied to every broker round trip
    pub sync_timeout: Duration,
    /// Period of the background cluster metadata refresh
    pub metadata_update_interval: Duration,
    /// Period of the background coordinator refresh (group sessions only)
    pub consumer_group_update_interval: Duration,
    /// Coordinator discovery retry configuration
    pub coordinator_retry: RetryConfig,
    /// Fetch configuration
    pub fetch_config: FetchConfig,
    /// Delay between two streaming poller ticks
    pub stream_poll_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "fluxmq-session".to_string(),
            consumer_group: GroupIdentity::NoGroup,
            sync_timeout: Duration::from_secs(5),
            metadata_update_interval: Duration::from_secs(30),
            consumer_group_update_interval: Duration::from_secs(30),
            coordinator_retry: RetryConfig::default(),
            fetch_config: FetchConfig::default(),
            stream_poll_interval: Duration::from_millis(500),
        }
    }
}

impl SessionConfig {
    /// Check the configuration and parse every broker address
    pub fn validate(&self) -> Result<Vec<(String, u16)>, SessionError> {
        if self.brokers.is_empty() {
            return Err(SessionError::invalid_config(
                "At least one broker must be specified",
            ));
        }
        if self.coordinator_retry.max_attempts == 0 {
            return Err(SessionError::invalid_config(
                "Coordinator retry budget must be at least 1",
            ));
        }
        if self.sync_timeout.is_zero() {
            return Err(SessionError::invalid_config("Sync timeout must be non-zero"));
        }
        if self.metadata_update_interval.is_zero() || self.consumer_group_update_interval.is_zero()
        {
            return Err(SessionError::invalid_config(
                "Update intervals must be non-zero",
            ));
        }
        if let GroupIdentity::Group(name) = &self.consumer_group {
            if name.is_empty() {
                return Err(SessionError::invalid_config(
                    "Consumer group name must not be empty",
                ));
            }
        }

        self.brokers
            .iter()
            .map(|address| parse_broker_address(address))
            .collect()
    }

    /// Load a configuration from `FLUXMQ_SESSION_*` environment variables.
    ///
    /// Unset variables keep their [`Default`] values. Brokers are a comma
    /// separated list, durations are given in milliseconds.
    pub fn from_env() -> Result<Self, SessionError> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("FLUXMQ_SESSION"))
            .build()
            .map_err(|e| SessionError::invalid_config(e.to_string()))?;

        let env = settings
            .try_deserialize::<EnvSettings>()
            .map_err(|e| SessionError::invalid_config(e.to_string()))?;

        Ok(env.into())
    }
}

/// Flat, serde friendly view of [`SessionConfig`]
#[derive(Debug, Deserialize)]
#[serde(default)]
struct EnvSettings {
    brokers: String,
    client_id: String,
    consumer_group: Option<String>,
    sync_timeout_ms: u64,
    metadata_update_interval_ms: u64,
    consumer_group_update_interval_ms: u64,
    retry_attempts: u32,
    retry_backoff_ms: u64,
    fetch_min_bytes: i32,
    fetch_max_bytes: i32,
    fetch_max_wait_ms: u64,
    stream_poll_interval_ms: u64,
}

impl Default for EnvSettings {
    fn default() -> Self {
        let config = SessionConfig::default();
        Self {
            brokers: config.brokers.join(","),
            client_id: config.client_id,
            consumer_group: None,
            sync_timeout_ms: config.sync_timeout.as_millis() as u64,
            metadata_update_interval_ms: config.metadata_update_interval.as_millis() as u64,
            consumer_group_update_interval_ms: config.consumer_group_update_interval.as_millis()
                as u64,
            retry_attempts: config.coordinator_retry.max_attempts,
            retry_backoff_ms: config.coordinator_retry.backoff.as_millis() as u64,
            fetch_min_bytes: config.fetch_config.min_bytes,
            fetch_max_bytes: config.fetch_config.max_bytes,
            fetch_max_wait_ms: config.fetch_config.max_wait.as_millis() as u64,
            stream_poll_interval_ms: config.stream_poll_interval.as_millis() as u64,
        }
    }
}

impl From<EnvSettings> for SessionConfig {
    fn from(env: EnvSettings) -> Self {
        Self {
            brokers: env
                .brokers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            client_id: env.client_id,
            consumer_group: GroupIdentity::from(env.consumer_group),
            sync_timeout: Duration::from_millis(env.sync_timeout_ms),
            metadata_update_interval: Duration::from_millis(env.metadata_update_interval_ms),
            consumer_group_update_interval: Duration::from_millis(
                env.consumer_group_update_interval_ms,
            ),
            coordinator_retry: RetryConfig {
                max_attempts: env.retry_attempts,
                backoff: Duration::from_millis(env.retry_backoff_ms),
            },
            fetch_config: FetchConfig {
                min_bytes: env.fetch_min_bytes,
                max_bytes: env.fetch_max_bytes,
                max_wait: Duration::from_millis(env.fetch_max_wait_ms),
            },
            stream_poll_interval: Duration::from_millis(env.stream_poll_interval_ms),
        }
    }
}

/// Coordinator discovery retry configuration.
///
/// Discovery sleeps a fixed `backoff` between attempts; there is no jitter or
/// growth so the worst case is exactly `(max_attempts - 1) * backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Number of discovery attempts, including the first
    pub max_attempts: u32,
    /// Sleep between two failed attempts
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(400),
        }
    }
}

/// Fetch configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchConfig {
    /// Minimum fetch size in bytes
    pub min_bytes: i32,
    /// Maximum bytes returned for the partition
    pub max_bytes: i32,
    /// Maximum time the broker waits for `min_bytes`
    pub max_wait: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            max_wait: Duration::from_millis(100),
        }
    }
}

/// Split a `host:port` broker address
pub fn parse_broker_address(address: &str) -> Result<(String, u16), SessionError> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        SessionError::invalid_config(format!("Broker address '{}' is not host:port", address))
    })?;

    if host.is_empty() {
        return Err(SessionError::invalid_config(format!(
            "Broker address '{}' has an empty host",
            address
        )));
    }

    let port = port.parse::<u16>().map_err(|_| {
        SessionError::invalid_config(format!("Broker address '{}' has an invalid port", address))
    })?;

    Ok((host.to_string(), port))
}

/// Builder for SessionConfig
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.brokers = brokers.into_iter().map(|s| s.into()).collect();
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn consumer_group<S: Into<String>>(mut self, group: S) -> Self {
        self.config.consumer_group = GroupIdentity::Group(group.into());
        self
    }

    pub fn no_consumer_group(mut self) -> Self {
        self.config.consumer_group = GroupIdentity::NoGroup;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.sync_timeout = timeout;
        self
    }

    pub fn metadata_update_interval(mut self, interval: Duration) -> Self {
        self.config.metadata_update_interval = interval;
        self
    }

    pub fn consumer_group_update_interval(mut self, interval: Duration) -> Self {
        self.config.consumer_group_update_interval = interval;
        self
    }

    pub fn coordinator_retry(mut self, retry: RetryConfig) -> Self {
        self.config.coordinator_retry = retry;
        self
    }

    pub fn fetch_config(mut self, fetch_config: FetchConfig) -> Self {
        self.config.fetch_config = fetch_config;
        self
    }

    pub fn stream_poll_interval(mut self, interval: Duration) -> Self {
        self.config.stream_poll_interval = interval;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
