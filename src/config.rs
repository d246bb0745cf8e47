//! Client and service configuration
//!
//! Values are explicit and passed into constructors. `from_env` reads the
//! `COUNTER_*` variables and falls back to the demo defaults for anything
//! unset.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid broker endpoint '{0}'")]
    InvalidEndpoint(String),
    #[error("No broker endpoints configured")]
    NoBrokers,
    #[error("Unknown protocol '{0}' (expected mqtt3.1.1 or amqp0.9.1)")]
    UnknownProtocol(String),
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
    #[error("Hierarchy segment '{0}' must be non-empty and must not contain '.' or '/'")]
    InvalidSegment(String),
}

/// Broker wire protocol. The two schemes differ by default port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Mqtt311,
    Amqp091,
}

impl Protocol {
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Mqtt311 => 1883,
            Protocol::Amqp091 => 5672,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Mqtt311 => "mqtt3.1.1",
            Protocol::Amqp091 => "amqp0.9.1",
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt3.1.1" | "mqtt" => Ok(Protocol::Mqtt311),
            "amqp0.9.1" | "amqp" => Ok(Protocol::Amqp091),
            other => Err(ConfigError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the broker cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
}

impl BrokerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host` or `host:port`, using `default_port` when the port is omitted
    pub fn parse(s: &str, default_port: u16) -> Result<Self, ConfigError> {
        let s = s.trim();
        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ConfigError::InvalidEndpoint(s.to_string()))?;
                (host, port)
            }
            None => (s, default_port),
        };
        if host.is_empty() || port == 0 {
            return Err(ConfigError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Broker cluster connection settings shared by client and service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub protocol: Protocol,
    pub endpoints: Vec<BrokerEndpoint>,
    pub username: String,
    pub password: String,
    /// Per-node connection timeout
    pub connect_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let protocol = Protocol::default();
        Self {
            protocol,
            endpoints: vec![
                BrokerEndpoint::new("rabbitmq1", protocol.default_port()),
                BrokerEndpoint::new("rabbitmq2", protocol.default_port()),
            ],
            username: "intersect_username".to_string(),
            password: "intersect_password".to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    fn from_vars(vars: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let protocol = match vars("COUNTER_PROTOCOL") {
            Some(p) => p.parse()?,
            None => defaults.protocol,
        };
        let endpoints = match vars("COUNTER_BROKERS") {
            Some(list) => parse_endpoints(&list, protocol.default_port())?,
            None => vec![
                BrokerEndpoint::new("rabbitmq1", protocol.default_port()),
                BrokerEndpoint::new("rabbitmq2", protocol.default_port()),
            ],
        };
        Ok(Self {
            protocol,
            endpoints,
            username: vars("COUNTER_USERNAME").unwrap_or(defaults.username),
            password: vars("COUNTER_PASSWORD").unwrap_or(defaults.password),
            connect_timeout: secs_var(vars, "COUNTER_CONNECT_TIMEOUT_SECS", defaults.connect_timeout)?,
        })
    }
}

/// Parse a comma-separated endpoint list
pub fn parse_endpoints(list: &str, default_port: u16) -> Result<Vec<BrokerEndpoint>, ConfigError> {
    let endpoints = list
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| BrokerEndpoint::parse(s, default_port))
        .collect::<Result<Vec<_>, _>>()?;
    if endpoints.is_empty() {
        return Err(ConfigError::NoBrokers);
    }
    Ok(endpoints)
}

/// Addressing namespace: `organization.facility.system.-.<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    pub organization: String,
    pub facility: String,
    pub system: String,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self {
            organization: "intersect".to_string(),
            facility: "resilience".to_string(),
            system: "clustering-demo".to_string(),
        }
    }
}

impl Hierarchy {
    /// Full dotted address of a named participant in this namespace
    pub fn address(&self, name: &str) -> String {
        format!(
            "{}.{}.{}.-.{}",
            self.organization, self.facility, self.system, name
        )
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for segment in [&self.organization, &self.facility, &self.system] {
            validate_segment(segment)?;
        }
        Ok(())
    }

    fn from_vars(vars: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let hierarchy = Self {
            organization: vars("COUNTER_ORGANIZATION").unwrap_or(defaults.organization),
            facility: vars("COUNTER_FACILITY").unwrap_or(defaults.facility),
            system: vars("COUNTER_SYSTEM").unwrap_or(defaults.system),
        };
        hierarchy.validate()?;
        Ok(hierarchy)
    }
}

fn validate_segment(segment: &str) -> Result<(), ConfigError> {
    if segment.is_empty() || segment.contains('.') || segment.contains('/') {
        return Err(ConfigError::InvalidSegment(segment.to_string()));
    }
    Ok(())
}

/// Reconnect timing shared by both runtimes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Pause between tearing down the old connection and dialing again
    pub pause: Duration,
    /// Upper bound for the delay between failed attempts
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            pause: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.pause
            .checked_mul(factor)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    fn from_vars(vars: &impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            pause: secs_var(vars, "COUNTER_RECONNECT_PAUSE_SECS", defaults.pause)?,
            max_backoff: secs_var(vars, "COUNTER_MAX_BACKOFF_SECS", defaults.max_backoff)?,
        })
    }
}

/// Configuration for the counting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub broker: BrokerConfig,
    pub hierarchy: Hierarchy,
    /// Name of this client within the hierarchy
    pub client_name: String,
    /// Name of the service the client talks to
    pub service_name: String,
    pub stale_threshold: Duration,
    pub tick_interval: Duration,
    /// Delay between a count reply and the next poll; zero polls immediately
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            hierarchy: Hierarchy::default(),
            client_name: "counting-client".to_string(),
            service_name: "counting-service".to_string(),
            stale_threshold: Duration::from_secs(5),
            tick_interval: Duration::from_secs(1),
            poll_interval: Duration::ZERO,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let client_name = vars("COUNTER_CLIENT_NAME").unwrap_or(defaults.client_name);
        let service_name = vars("COUNTER_SERVICE_NAME").unwrap_or(defaults.service_name);
        validate_segment(&client_name)?;
        validate_segment(&service_name)?;
        let stale_threshold =
            secs_var(&vars, "COUNTER_STALE_THRESHOLD_SECS", defaults.stale_threshold)?;

        // A poll delay at or past the threshold would make every healthy wait look stale
        let poll_interval = match vars("COUNTER_POLL_INTERVAL_SECS") {
            Some(value) if value.trim() == "0" => Duration::ZERO,
            Some(_) => secs_var(&vars, "COUNTER_POLL_INTERVAL_SECS", defaults.poll_interval)?,
            None => defaults.poll_interval,
        };
        if poll_interval >= stale_threshold {
            return Err(ConfigError::InvalidValue {
                name: "COUNTER_POLL_INTERVAL_SECS",
                value: format!("{}", poll_interval.as_secs_f64()),
            });
        }

        Ok(Self {
            broker: BrokerConfig::from_vars(&vars)?,
            hierarchy: Hierarchy::from_vars(&vars)?,
            client_name,
            service_name,
            stale_threshold,
            tick_interval: secs_var(&vars, "COUNTER_TICK_INTERVAL_SECS", defaults.tick_interval)?,
            poll_interval,
            reconnect: ReconnectPolicy::from_vars(&vars)?,
        })
    }

    pub fn client_address(&self) -> String {
        self.hierarchy.address(&self.client_name)
    }

    pub fn service_address(&self) -> String {
        self.hierarchy.address(&self.service_name)
    }
}

/// Configuration for the counting service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub broker: BrokerConfig,
    pub hierarchy: Hierarchy,
    pub service_name: String,
    pub status_interval: Duration,
    /// How often a lost connection is retried
    pub tick_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            hierarchy: Hierarchy::default(),
            service_name: "counting-service".to_string(),
            status_interval: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let service_name = vars("COUNTER_SERVICE_NAME").unwrap_or(defaults.service_name);
        validate_segment(&service_name)?;
        Ok(Self {
            broker: BrokerConfig::from_vars(&vars)?,
            hierarchy: Hierarchy::from_vars(&vars)?,
            service_name,
            status_interval: secs_var(&vars, "COUNTER_STATUS_INTERVAL_SECS", defaults.status_interval)?,
            tick_interval: secs_var(&vars, "COUNTER_TICK_INTERVAL_SECS", defaults.tick_interval)?,
            reconnect: ReconnectPolicy::from_vars(&vars)?,
        })
    }

    pub fn service_address(&self) -> String {
        self.hierarchy.address(&self.service_name)
    }
}

/// Read a positive number of (possibly fractional) seconds
fn secs_var(
    vars: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(value) = vars(name) else {
        return Ok(default);
    };
    let parsed = value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|duration| !duration.is_zero());
    match parsed {
        Some(duration) => Ok(duration),
        None => Err(ConfigError::InvalidValue { name, value }),
    }
}
