// src/config.rs
use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::message::MessageKind;

pub const TICKET_TIMEOUT_MIN_MS: u64 = 10_000;
pub const TICKET_TIMEOUT_MAX_MS: u64 = 30_000;
pub const REPLY_TIMEOUT_MIN_MS: u64 = 10_000;
pub const REPLY_TIMEOUT_MAX_MS: u64 = 3_600_000;

const ENV_PREFIX: &str = "TICKET_GATEWAY_";

/// Percent-encodes everything outside the URI unreserved set.
fn encode_uri_component(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => encoded.push(byte as char),
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}

/// Immutable broker connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterDescriptor {
    pub username: String,
    pub password: String,
    pub virtual_host: String,
    #[serde(default = "default_use_ssl")]
    pub use_ssl: bool,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default = "default_node_id")]
    pub node_id: u32,
}

impl ClusterDescriptor {
    pub fn amqp_uri(&self) -> String {
        let scheme = if self.use_ssl { "amqps" } else { "amqp" };
        format!(
            "{}://{}:{}@{}:{}/{}",
            scheme,
            encode_uri_component(&self.username),
            encode_uri_component(&self.password),
            self.host,
            self.port,
            encode_uri_component(&self.virtual_host)
        )
    }

    /// Address for logs, without credentials.
    pub fn address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.virtual_host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_channels_per_connection")]
    pub channels_per_connection: usize,
    #[serde(default = "default_channel_acquire_timeout_ms")]
    pub channel_acquire_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

impl ConnectionSettings {
    pub fn channel_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_acquire_timeout_ms)
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connections: default_connections(),
            channels_per_connection: default_channels_per_connection(),
            channel_acquire_timeout_ms: default_channel_acquire_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProducerSettings {
    #[serde(default = "default_true")]
    pub wait_for_publish_confirmations: bool,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
    /// Resends allowed after the first publish. The only retry ceiling for outbound messages.
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
    #[serde(default = "default_true")]
    pub persistent: bool,
    #[serde(default = "default_confirm_timeout_ms")]
    pub confirm_timeout_ms: u64,
}

impl ProducerSettings {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            wait_for_publish_confirmations: true,
            max_buffer_size: default_max_buffer_size(),
            max_retry_count: default_max_retry_count(),
            persistent: true,
            confirm_timeout_ms: default_confirm_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    #[serde(default = "default_true")]
    pub exclusive: bool,
    #[serde(default = "default_consumer_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retry_count")]
    pub max_retry_count: u32,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            exclusive: true,
            concurrency: default_consumer_concurrency(),
            max_retry_count: default_max_retry_count(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
    #[serde(default)]
    pub timeout_callback_enabled: bool,
    #[serde(default = "default_callback_queue_size")]
    pub callback_queue_size: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            messages_per_second: default_messages_per_second(),
            timeout_callback_enabled: false,
            callback_queue_size: default_callback_queue_size(),
        }
    }
}

/// Response timeouts per reply-expecting message kind, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSettings {
    #[serde(default = "default_ticket_timeout_ms")]
    pub ticket_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub cancel_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub cashout_ms: u64,
    #[serde(default = "default_reply_timeout_ms")]
    pub non_sr_settle_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            ticket_ms: default_ticket_timeout_ms(),
            cancel_ms: default_reply_timeout_ms(),
            cashout_ms: default_reply_timeout_ms(),
            non_sr_settle_ms: default_reply_timeout_ms(),
        }
    }
}

impl TimeoutSettings {
    /// Timeout for a kind. Fire-and-forget kinds fall back to the ticket timeout,
    /// which then only bounds how long `close()` waits.
    pub fn for_kind(&self, kind: MessageKind) -> Duration {
        let millis = match kind {
            MessageKind::Cancel => self.cancel_ms,
            MessageKind::Cashout => self.cashout_ms,
            MessageKind::NonSrSettle => self.non_sr_settle_ms,
            _ => self.ticket_ms,
        };
        Duration::from_millis(millis)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub cluster: ClusterDescriptor,
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub producer: ProducerSettings,
    #[serde(default)]
    pub consumer: ConsumerSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub timeouts: TimeoutSettings,
}

// Default values
fn default_true() -> bool { true }
fn default_use_ssl() -> bool { true }
fn default_port() -> u16 { 5671 }
fn default_prefetch_count() -> u16 { 10 }
fn default_node_id() -> u32 { 1 }
fn default_connections() -> usize { 1 }
fn default_channels_per_connection() -> usize { 8 }
fn default_channel_acquire_timeout_ms() -> u64 { 2_000 }
fn default_reconnect_attempts() -> u32 { 10 }
fn default_reconnect_delay_ms() -> u64 { 1_000 }
fn default_reconnect_max_delay_ms() -> u64 { 30_000 }
fn default_max_buffer_size() -> usize { 1_000 }
fn default_max_retry_count() -> u32 { 3 }
fn default_confirm_timeout_ms() -> u64 { 10_000 }
fn default_consumer_concurrency() -> usize { 1 }
fn default_messages_per_second() -> u32 { 40 }
fn default_callback_queue_size() -> usize { 1_024 }
fn default_ticket_timeout_ms() -> u64 { 15_000 }
fn default_reply_timeout_ms() -> u64 { 600_000 }

impl GatewayConfig {
    /// Configuration with defaults for everything but the cluster.
    pub fn new(cluster: ClusterDescriptor) -> Self {
        Self {
            cluster,
            connection: ConnectionSettings::default(),
            producer: ProducerSettings::default(),
            consumer: ConsumerSettings::default(),
            limits: LimitSettings::default(),
            timeouts: TimeoutSettings::default(),
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config file at {}", path.display()))?;

        let config: GatewayConfig = serde_json::from_str(&content)
            .context("Configuration file contains invalid JSON or missing required fields")?;

        config.validate()?;
        Ok(config)
    }

    /// Loads from the first config file found, see [`find_config_file`].
    pub fn load() -> Result<Self> {
        let path = find_config_file()?;
        Self::from_json_file(&path)
    }

    /// Loads from `TICKET_GATEWAY_*` environment variables, reading `.env` first.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let cluster = ClusterDescriptor {
            username: required_var("USERNAME")?,
            password: required_var("PASSWORD")?,
            virtual_host: required_var("VIRTUAL_HOST")?,
            use_ssl: parsed_var("USE_SSL")?.unwrap_or_else(default_use_ssl),
            host: required_var("HOST")?,
            port: parsed_var("PORT")?.unwrap_or_else(default_port),
            prefetch_count: parsed_var("PREFETCH_COUNT")?.unwrap_or_else(default_prefetch_count),
            node_id: parsed_var("NODE_ID")?.unwrap_or_else(default_node_id),
        };

        let mut config = GatewayConfig::new(cluster);
        if let Some(rate) = parsed_var("MESSAGES_PER_SECOND")? {
            config.limits.messages_per_second = rate;
        }
        if let Some(enabled) = parsed_var("TIMEOUT_CALLBACK_ENABLED")? {
            config.limits.timeout_callback_enabled = enabled;
        }
        if let Some(exclusive) = parsed_var("EXCLUSIVE_CONSUMER")? {
            config.consumer.exclusive = exclusive;
        }
        if let Some(retries) = parsed_var("MAX_RETRY_COUNT")? {
            config.producer.max_retry_count = retries;
            config.consumer.max_retry_count = retries;
        }
        if let Some(millis) = parsed_var("TICKET_TIMEOUT_MS")? {
            config.timeouts.ticket_ms = millis;
        }
        if let Some(millis) = parsed_var("CANCEL_TIMEOUT_MS")? {
            config.timeouts.cancel_ms = millis;
        }
        if let Some(millis) = parsed_var("CASHOUT_TIMEOUT_MS")? {
            config.timeouts.cashout_ms = millis;
        }
        if let Some(millis) = parsed_var("NON_SR_SETTLE_TIMEOUT_MS")? {
            config.timeouts.non_sr_settle_ms = millis;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let cluster = &self.cluster;
        if cluster.username.is_empty() {
            return Err(anyhow!("Configuration error: cluster.username cannot be empty"));
        }
        if cluster.host.is_empty() {
            return Err(anyhow!("Configuration error: cluster.host cannot be empty"));
        }
        if cluster.virtual_host.is_empty() {
            return Err(anyhow!("Configuration error: cluster.virtual_host cannot be empty"));
        }
        if self.connection.connections == 0 || self.connection.channels_per_connection == 0 {
            return Err(anyhow!(
                "Configuration error: connection.connections and connection.channels_per_connection must be at least 1"
            ));
        }
        if self.consumer.concurrency == 0 {
            return Err(anyhow!("Configuration error: consumer.concurrency must be at least 1"));
        }
        if self.consumer.exclusive && self.consumer.concurrency > 1 {
            return Err(anyhow!(
                "Configuration error: consumer.concurrency must be 1 for exclusive reply queues (got {})",
                self.consumer.concurrency
            ));
        }
        if self.producer.max_buffer_size == 0 {
            return Err(anyhow!("Configuration error: producer.max_buffer_size must be at least 1"));
        }
        if self.limits.messages_per_second == 0 {
            return Err(anyhow!("Configuration error: limits.messages_per_second must be positive"));
        }

        check_range("timeouts.ticket_ms", self.timeouts.ticket_ms, TICKET_TIMEOUT_MIN_MS, TICKET_TIMEOUT_MAX_MS)?;
        check_range("timeouts.cancel_ms", self.timeouts.cancel_ms, REPLY_TIMEOUT_MIN_MS, REPLY_TIMEOUT_MAX_MS)?;
        check_range("timeouts.cashout_ms", self.timeouts.cashout_ms, REPLY_TIMEOUT_MIN_MS, REPLY_TIMEOUT_MAX_MS)?;
        check_range(
            "timeouts.non_sr_settle_ms",
            self.timeouts.non_sr_settle_ms,
            REPLY_TIMEOUT_MIN_MS,
            REPLY_TIMEOUT_MAX_MS,
        )?;

        Ok(())
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<()> {
    if value < min || value > max {
        return Err(anyhow!(
            "Configuration error: {} must be between {} and {} (got {})",
            name,
            min,
            max,
            value
        ));
    }
    Ok(())
}

fn required_var(name: &str) -> Result<String> {
    let key = format!("{}{}", ENV_PREFIX, name);
    env::var(&key).context(format!("Missing environment variable {}", key))
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match env::var(&key) {
        Ok(value) => value
            .parse()
            .map(Some)
            .context(format!("Invalid value for {}", key)),
        Err(_) => Ok(None),
    }
}

// Configuration file discovery
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("ticket-gateway.json")),
        ("Current directory (alternative)", Path::new("config/ticket-gateway.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".ticket-gateway.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find ticket-gateway.json configuration file. \
         Please create one in the current directory, config/, or your home directory."
    ))
}

pub fn create_default_config_file(path: &Path, cluster: ClusterDescriptor) -> Result<()> {
    let json = serde_json::to_string_pretty(&GatewayConfig::new(cluster))
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json).context(format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
