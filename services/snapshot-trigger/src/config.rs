//! Configuration management for the snapshot trigger service.
//!
//! Configuration is layered with the `config` crate. Later sources override
//! earlier ones:
//!
//! 1. `broker_config.yaml` (flat `mqtt_broker_host` / `mqtt_broker_port` keys)
//! 2. `config/snapshot-trigger.{toml,yaml,json}`
//! 3. `/etc/snapshot-trigger/config`
//! 4. Environment variables prefixed with `SNAPSHOT`, e.g.
//!    `SNAPSHOT__CAMERA_API__API_KEY`

use config::{Config as ConfigBuilder, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the snapshot trigger service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Camera vendor API access
    pub camera_api: CameraApiConfig,

    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Prometheus exporter port, exporter disabled when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

/// MQTT broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic filter to subscribe to ("#" receives every topic)
    #[serde(default = "default_topic_filter")]
    pub topic_filter: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Capacity of the request channel between client and event loop
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
}

/// Camera vendor API configuration.
#[derive(Clone, Deserialize)]
pub struct CameraApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API credential, supplied through a config file or
    /// `SNAPSHOT__CAMERA_API__API_KEY`
    pub api_key: String,

    /// Header carrying the credential
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl fmt::Debug for CameraApiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraApiConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("api_key_header", &self.api_key_header)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

/// Detection criteria that qualify an event as a capture trigger.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
    /// Detection class that triggers a capture
    #[serde(default = "default_object_type")]
    pub object_type: String,

    /// Confidence (0-100) the detection must strictly exceed
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

/// Whether the cooldown is shared by every device or tracked per device.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CooldownScope {
    #[default]
    Global,
    PerDevice,
}

/// Cooldown between permitted captures.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    #[serde(default)]
    pub scope: CooldownScope,
}

/// How the poll phase obtains a fresh response after a miss.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    /// Re-issue the generate request on every poll attempt
    #[default]
    Resubmit,
    /// Keep inspecting the response returned by the first request
    ReuseInitial,
}

/// Where snapshot workflows run relative to the message loop.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Each workflow runs on its own task, the receive loop stays responsive
    #[default]
    Spawned,
    /// The message handler awaits the workflow before returning
    Inline,
}

/// Snapshot workflow timing and retry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Pause between obtaining the snapshot URL and fetching it
    #[serde(default = "default_download_delay_secs")]
    pub download_delay_secs: u64,

    #[serde(default)]
    pub poll_strategy: PollStrategy,

    /// Hard upper bound on one workflow run
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Upper bound on concurrently running workflows in spawned mode
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

/// Local output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory receiving downloaded images
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Append-only log of every received message
    #[serde(default = "default_message_log_path")]
    pub message_log_path: PathBuf,

    /// chrono format of the timestamp prefix of image file names
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

// Default value functions
fn default_service_name() -> String {
    "snapshot-trigger".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_mqtt_host() -> String {
    "localhost".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_client_id() -> String {
    "snapshot-trigger".to_string()
}
fn default_topic_filter() -> String {
    "#".to_string()
}
fn default_keep_alive_secs() -> u64 {
    60
}
fn default_channel_capacity() -> usize {
    100
}
fn default_reconnect_base_delay_ms() -> u64 {
    1000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_base_url() -> String {
    "https://api.meraki.com/api/v1".to_string()
}
fn default_api_key_header() -> String {
    "X-Cisco-Meraki-API-Key".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_object_type() -> String {
    "person".to_string()
}
fn default_min_confidence() -> f64 {
    70.0
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_max_poll_attempts() -> u32 {
    10
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_download_delay_secs() -> u64 {
    5
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_message_log_path() -> PathBuf {
    PathBuf::from("file.log")
}
fn default_timestamp_format() -> String {
    "%d%m%Y_%H%M%S".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            metrics_port: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            topic_filter: default_topic_filter(),
            keep_alive_secs: default_keep_alive_secs(),
            username: None,
            password: None,
            channel_capacity: default_channel_capacity(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl CameraApiConfig {
    /// Create an API configuration with default endpoint settings
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: default_base_url(),
            api_key: api_key.into(),
            api_key_header: default_api_key_header(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            object_type: default_object_type(),
            min_confidence: default_min_confidence(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            scope: CooldownScope::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_poll_attempts: default_max_poll_attempts(),
            poll_interval_secs: default_poll_interval_secs(),
            download_delay_secs: default_download_delay_secs(),
            poll_strategy: PollStrategy::default(),
            deadline_secs: default_deadline_secs(),
            dispatch: DispatchMode::default(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

impl WorkflowConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn download_delay(&self) -> Duration {
        Duration::from_secs(self.download_delay_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    /// Total time spent waiting by a run that exhausts its poll attempts
    /// and then downloads.
    pub fn wait_budget(&self) -> Duration {
        self.poll_interval() * self.max_poll_attempts.saturating_sub(1) + self.download_delay()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            message_log_path: default_message_log_path(),
            timestamp_format: default_timestamp_format(),
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

impl Config {
    /// Load configuration from files and environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        // Legacy broker file: flat keys, lowest precedence
        let legacy = ConfigBuilder::builder()
            .add_source(File::new("broker_config.yaml", FileFormat::Yaml).required(false))
            .build()?;
        if let Ok(host) = legacy.get_string("mqtt_broker_host") {
            builder = builder.set_default("mqtt.host", host)?;
        }
        if let Ok(port) = legacy.get_int("mqtt_broker_port") {
            builder = builder.set_default("mqtt.port", port)?;
        }

        let config = builder
            .add_source(File::with_name("config/snapshot-trigger").required(false))
            .add_source(File::with_name("/etc/snapshot-trigger/config").required(false))
            // SNAPSHOT__MQTT__HOST -> mqtt.host
            .add_source(
                Environment::with_prefix("SNAPSHOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.mqtt.host.is_empty() {
            return Err(ConfigValidationError::MissingField("mqtt.host".to_string()));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "mqtt.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }

        if self.camera_api.api_key.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "camera_api.api_key".to_string(),
            ));
        }
        if !self.camera_api.base_url.starts_with("http://")
            && !self.camera_api.base_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "camera_api.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.rate_limit.cooldown_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "rate_limit.cooldown_secs".to_string(),
                message: "Cooldown must be greater than 0".to_string(),
            });
        }

        if self.workflow.max_poll_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "workflow.max_poll_attempts".to_string(),
                message: "At least one poll attempt is required".to_string(),
            });
        }
        if self.workflow.deadline() < self.workflow.wait_budget() {
            return Err(ConfigValidationError::InvalidValue {
                field: "workflow.deadline_secs".to_string(),
                message: format!(
                    "Deadline {}s is shorter than the poll budget {}s",
                    self.workflow.deadline_secs,
                    self.workflow.wait_budget().as_secs()
                ),
            });
        }
        if self.workflow.max_concurrent_jobs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "workflow.max_concurrent_jobs".to_string(),
                message: "Must allow at least one job".to_string(),
            });
        }

        Ok(())
    }
}
