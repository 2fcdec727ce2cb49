//! Queue RPC bridge configuration
//!
//! Values are resolved in three layers:
//! 1. Built-in defaults (local broker, `user`/`password` credentials, HTTP on port 5000)
//! 2. Optional TOML file named by `BRIDGE_CONFIG_FILE`
//! 3. `BRIDGE_*` environment variables
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `BRIDGE_CONFIG_FILE` | - | Path to a TOML config file |
//! | `BRIDGE_BROKER_HOST` | `localhost` | RabbitMQ host |
//! | `BRIDGE_BROKER_PORT` | `5672` | RabbitMQ AMQP port |
//! | `BRIDGE_BROKER_USER` | `user` | Broker username |
//! | `BRIDGE_BROKER_PASSWORD` | `password` | Broker password |
//! | `BRIDGE_BROKER_VHOST` | `/` | Virtual host |
//! | `BRIDGE_HTTP_HOST` | `127.0.0.1` | HTTP bind address |
//! | `BRIDGE_HTTP_PORT` | `5000` | HTTP port |
//! | `BRIDGE_CONSUMER_PREFETCH` | `1` | Unacked deliveries per consumer channel |
//! | `BRIDGE_DEAD_LETTER_EXCHANGE` | - | Republish failed messages here (off by default) |
//! | `BRIDGE_RECONNECT_MAX_ATTEMPTS` | `5` | Connection attempts before giving up |
//! | `BRIDGE_RECONNECT_INITIAL_DELAY_MS` | `500` | First backoff delay |
//! | `BRIDGE_RECONNECT_MAX_DELAY_MS` | `30000` | Backoff ceiling |
//! | `BRIDGE_DETECTOR_URL` | `http://localhost:8000/detect` | Human detection service |
//! | `BRIDGE_DETECTOR_TIMEOUT_MS` | `30000` | Detection request timeout |
//! | `BRIDGE_GATEWAY_ENABLED` | `false` | Mount the broker-backed `/math/add` route |
//! | `BRIDGE_GATEWAY_TIMEOUT_MS` | `10000` | Reply wait for gateway calls |

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rb_common::{default_registrations, QueueRegistration, MATH_QUEUE};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILE_VAR: &str = "BRIDGE_CONFIG_FILE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Shown in the broker management UI
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "user".to_string(),
            password: "password".to_string(),
            vhost: "/".to_string(),
            connection_name: "rb-service".to_string(),
        }
    }
}

impl BrokerConfig {
    /// AMQP URI with credentials and vhost percent-encoded
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
        )
    }

    /// URI safe for logging
    pub fn redacted_uri(&self) -> String {
        format!(
            "amqp://{}:***@{}:{}/{}",
            urlencoding::encode(&self.username),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub prefetch: u16,
    pub consumer_tag_prefix: String,
    /// Exchange receiving bodies of messages that could not be processed.
    /// Unset keeps the drop-after-ack behavior.
    pub dead_letter_exchange: Option<String>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            prefetch: 1,
            consumer_tag_prefix: "rb-consumer".to_string(),
            dead_letter_exchange: None,
        }
    }
}

/// Bounded exponential backoff for broker connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the ceiling
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub url: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000/detect".to_string(),
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl DetectorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Broker-backed HTTP routes that act as an RPC caller
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub math_queue: String,
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            math_queue: MATH_QUEUE.to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub broker: BrokerConfig,
    pub http: HttpConfig,
    pub consumer: ConsumerConfig,
    pub reconnect: ReconnectConfig,
    pub detector: DetectorConfig,
    pub gateway: GatewayConfig,
    pub queues: Vec<QueueRegistration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            http: HttpConfig::default(),
            consumer: ConsumerConfig::default(),
            reconnect: ReconnectConfig::default(),
            detector: DetectorConfig::default(),
            gateway: GatewayConfig::default(),
            queues: default_registrations(),
        }
    }
}

impl ServiceConfig {
    /// Load defaults, then the optional config file, then environment overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_FILE_VAR) {
            Ok(path) if !path.is_empty() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        info!(path = %path.display(), "Loading configuration file");
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `BRIDGE_*` overrides using the given variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };

        env.string("BRIDGE_BROKER_HOST", &mut self.broker.host);
        env.parse("BRIDGE_BROKER_PORT", &mut self.broker.port)?;
        env.string("BRIDGE_BROKER_USER", &mut self.broker.username);
        env.string("BRIDGE_BROKER_PASSWORD", &mut self.broker.password);
        env.string("BRIDGE_BROKER_VHOST", &mut self.broker.vhost);

        env.string("BRIDGE_HTTP_HOST", &mut self.http.host);
        env.parse("BRIDGE_HTTP_PORT", &mut self.http.port)?;

        env.parse("BRIDGE_CONSUMER_PREFETCH", &mut self.consumer.prefetch)?;
        if let Some(exchange) = env.get("BRIDGE_DEAD_LETTER_EXCHANGE") {
            self.consumer.dead_letter_exchange = Some(exchange).filter(|e| !e.is_empty());
        }

        env.parse("BRIDGE_RECONNECT_MAX_ATTEMPTS", &mut self.reconnect.max_attempts)?;
        env.parse("BRIDGE_RECONNECT_INITIAL_DELAY_MS", &mut self.reconnect.initial_delay_ms)?;
        env.parse("BRIDGE_RECONNECT_MAX_DELAY_MS", &mut self.reconnect.max_delay_ms)?;

        env.string("BRIDGE_DETECTOR_URL", &mut self.detector.url);
        env.parse("BRIDGE_DETECTOR_TIMEOUT_MS", &mut self.detector.timeout_ms)?;

        env.parse("BRIDGE_GATEWAY_ENABLED", &mut self.gateway.enabled)?;
        env.parse("BRIDGE_GATEWAY_TIMEOUT_MS", &mut self.gateway.timeout_ms)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queues.is_empty() {
            return Err(ConfigError::invalid("queues", "at least one queue must be registered"));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(ConfigError::invalid("queues", "queue name must not be empty"));
            }
            if !seen.insert(queue.name.as_str()) {
                return Err(ConfigError::invalid(
                    "queues",
                    format!("queue '{}' is registered twice", queue.name),
                ));
            }
        }

        if self.consumer.prefetch == 0 {
            return Err(ConfigError::invalid("consumer.prefetch", "must be greater than zero"));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::invalid("reconnect.max_attempts", "must be at least 1"));
        }
        if self.gateway.enabled && !seen.contains(self.gateway.math_queue.as_str()) {
            tracing::warn!(
                queue = %self.gateway.math_queue,
                "Gateway targets a queue this service does not consume"
            );
        }

        Ok(())
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<()>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(key) {
            *target = raw
                .trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::invalid(key, e.to_string()))?;
        }
        Ok(())
    }
}
