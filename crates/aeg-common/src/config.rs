//! Configuration structures for the acquisition engine.
//!
//! Supports TOML deserialization with sensible defaults, and an explicit
//! `validate()` pass that returns structured [`ConfigurationError`]s rather
//! than panicking or relying on data-annotation reflection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicyConfig;

/// Minimum poll interval: 100ms.
pub const MIN_POLL_INTERVAL_MS: u64 = 100;
/// Maximum poll interval: 5 minutes.
pub const MAX_POLL_INTERVAL_MS: u64 = 5 * 60 * 1000;
/// Default health threshold for the offline transition.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Default per-subscriber queue capacity for both broadcast streams.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One register word, dword, or qword read width for a counter channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterCount {
    /// Single 16-bit register.
    Word,
    /// Two registers combined into a 32-bit value.
    Dword,
    /// Four registers combined into a 64-bit value.
    Qword,
}

impl RegisterCount {
    /// Number of 16-bit registers this width spans.
    #[must_use]
    pub fn register_len(self) -> u16 {
        match self {
            Self::Word => 1,
            Self::Dword => 2,
            Self::Qword => 4,
        }
    }

    /// Bit width of the assembled integer, used for counter rollover math.
    #[must_use]
    pub fn bit_width(self) -> u32 {
        u32::from(self.register_len()) * 16
    }
}

/// Per-channel configuration for a Modbus counter device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterChannelConfig {
    /// Channel number, unique within the owning device.
    pub channel_number: u16,
    /// Whether this channel is polled.
    pub enabled: bool,
    /// Starting Modbus holding-register address.
    pub start_register: u16,
    /// Register width for this channel's value.
    pub register_count: RegisterCount,
    /// Minimum acceptable raw value.
    pub min_value: i64,
    /// Maximum acceptable raw value.
    pub max_value: i64,
    /// Maximum acceptable `|rate|`, in units/second.
    pub max_rate_of_change: f64,
    /// Raw value at/above which an observation is flagged as overflow.
    pub overflow_threshold: i64,
    /// Multiplicative scale applied to the raw value.
    pub scale_factor: f64,
    /// Additive offset applied after scaling.
    pub offset: f64,
    /// Decimal places to report for the scaled value.
    pub decimal_places: u8,
    /// Rate engine retention window, in seconds.
    pub rate_window_seconds: u64,
}

impl Default for CounterChannelConfig {
    fn default() -> Self {
        Self {
            channel_number: 0,
            enabled: true,
            start_register: 0,
            register_count: RegisterCount::Dword,
            min_value: 0,
            max_value: i64::MAX,
            max_rate_of_change: f64::MAX,
            overflow_threshold: i64::MAX,
            scale_factor: 1.0,
            offset: 0.0,
            decimal_places: 0,
            rate_window_seconds: 60,
        }
    }
}

/// Per-channel configuration for a scale device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleChannelConfig {
    /// Channel number, unique within the owning device.
    pub channel_number: u16,
    /// Whether this channel is polled.
    pub enabled: bool,
    /// Engineering unit override; `None` uses the protocol template's default.
    pub unit: Option<String>,
    /// Decimal places to report for the weight value.
    pub decimal_places: u8,
    /// Maximum acceptable `|rate|`, in units/second.
    pub max_rate_of_change: f64,
    /// Stability tolerance window used alongside the template's motion markers.
    pub stability_tolerance: f64,
    /// Scale capacity (maximum legal weight).
    pub capacity: f64,
    /// Scale resolution (smallest meaningful increment).
    pub resolution: f64,
    /// Rate engine retention window, in seconds.
    pub rate_window_seconds: u64,
}

impl Default for ScaleChannelConfig {
    fn default() -> Self {
        Self {
            channel_number: 0,
            enabled: true,
            unit: None,
            decimal_places: 2,
            max_rate_of_change: f64::MAX,
            stability_tolerance: 0.01,
            capacity: f64::MAX,
            resolution: 0.01,
            rate_window_seconds: 60,
        }
    }
}

/// Device-kind-specific configuration, replacing the source's
/// inheritance/marker-interface hierarchy with a tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceKind {
    /// A Modbus/TCP counter module.
    CounterModbusTcp {
        /// Modbus unit identifier (slave address).
        unit_id: u8,
        /// Enabled and disabled channels, in configured order.
        channels: Vec<CounterChannelConfig>,
    },
    /// A TCP-attached serial scale speaking a regex-discovered protocol.
    ScaleTcpSerial {
        /// Skip discovery and force this catalog template id.
        forced_protocol_template_id: Option<String>,
        /// Enabled and disabled channels, in configured order.
        channels: Vec<ScaleChannelConfig>,
    },
}

impl DeviceKind {
    /// Channel numbers configured on this device, in configured order.
    #[must_use]
    pub fn channel_numbers(&self) -> Vec<u16> {
        match self {
            Self::CounterModbusTcp { channels, .. } => {
                channels.iter().map(|c| c.channel_number).collect()
            }
            Self::ScaleTcpSerial { channels, .. } => {
                channels.iter().map(|c| c.channel_number).collect()
            }
        }
    }

    /// Whether at least one channel is enabled.
    #[must_use]
    pub fn has_enabled_channel(&self) -> bool {
        match self {
            Self::CounterModbusTcp { channels, .. } => channels.iter().any(|c| c.enabled),
            Self::ScaleTcpSerial { channels, .. } => channels.iter().any(|c| c.enabled),
        }
    }

    /// Number of configured channels (enabled or not).
    #[must_use]
    pub fn channel_count(&self) -> usize {
        match self {
            Self::CounterModbusTcp { channels, .. } => channels.len(),
            Self::ScaleTcpSerial { channels, .. } => channels.len(),
        }
    }
}

/// Immutable per-device configuration. Replaced atomically on reload;
/// never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique key within the fleet, 1..=50 characters.
    pub device_id: String,
    /// Dotted IPv4 address of the device.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Timeout for establishing the transport connection.
    pub connect_timeout_ms: u64,
    /// Timeout for a single transport read.
    pub read_timeout_ms: u64,
    /// Delay between reconnect/retry attempts.
    pub retry_delay_ms: u64,
    /// Maximum retry attempts per cycle read.
    pub max_retries: u32,
    /// Target period between successive cycle starts.
    pub poll_interval_ms: u64,
    /// Consecutive full-cycle failures before the device is marked offline.
    pub max_consecutive_failures: u32,
    /// Opaque metadata attached to every observation from this device.
    pub tags: BTreeMap<String, String>,
    /// Device-kind-specific fields and channels.
    pub kind: DeviceKind,
}

impl DeviceConfig {
    /// Validate this device in isolation (fleet-wide uniqueness is checked
    /// by [`EngineConfig::validate`]).
    pub fn validate(&self) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();
        let path_prefix = format!("devices[{}]", self.device_id);

        if self.device_id.is_empty() || self.device_id.chars().count() > 50 {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.device_id"),
                ConfigurationErrorKind::OutOfRange,
                "device_id must be 1..=50 characters",
            ));
        }

        if self.host.parse::<std::net::Ipv4Addr>().is_err() {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.host"),
                ConfigurationErrorKind::Invalid,
                format!("'{}' is not a dotted IPv4 address", self.host),
            ));
        }

        if self.port == 0 {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.port"),
                ConfigurationErrorKind::OutOfRange,
                "port must be in 1..=65535",
            ));
        }

        if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&self.poll_interval_ms) {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.poll_interval_ms"),
                ConfigurationErrorKind::OutOfRange,
                format!(
                    "poll_interval_ms must be in {MIN_POLL_INTERVAL_MS}..={MAX_POLL_INTERVAL_MS}"
                ),
            ));
        }

        if self.poll_interval_ms <= self.read_timeout_ms {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.poll_interval_ms"),
                ConfigurationErrorKind::Invariant,
                "poll_interval_ms must be strictly greater than read_timeout_ms",
            ));
        }

        if let DeviceKind::CounterModbusTcp { unit_id, .. } = &self.kind {
            if *unit_id == 0 {
                errors.push(ConfigurationError::new(
                    format!("{path_prefix}.unit_id"),
                    ConfigurationErrorKind::OutOfRange,
                    "unit_id must be in 1..=255",
                ));
            }
        }

        if self.kind.channel_count() == 0 {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.channels"),
                ConfigurationErrorKind::MissingField,
                "device must declare at least one channel",
            ));
        } else if !self.kind.has_enabled_channel() {
            errors.push(ConfigurationError::new(
                format!("{path_prefix}.channels"),
                ConfigurationErrorKind::Invariant,
                "at least one channel must be enabled",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for n in self.kind.channel_numbers() {
            if !seen.insert(n) {
                errors.push(ConfigurationError::new(
                    format!("{path_prefix}.channels[{n}]"),
                    ConfigurationErrorKind::DuplicateId,
                    format!("duplicate channel_number {n}"),
                ));
            }
        }

        if let DeviceKind::CounterModbusTcp { channels, .. } = &self.kind {
            for c in channels {
                if c.min_value > c.max_value {
                    errors.push(ConfigurationError::new(
                        format!("{path_prefix}.channels[{}].min_value", c.channel_number),
                        ConfigurationErrorKind::Invariant,
                        "min_value must be <= max_value",
                    ));
                }
                if c.rate_window_seconds == 0 {
                    errors.push(ConfigurationError::new(
                        format!(
                            "{path_prefix}.channels[{}].rate_window_seconds",
                            c.channel_number
                        ),
                        ConfigurationErrorKind::OutOfRange,
                        "rate_window_seconds must be > 0 (sample-count windows are not supported)",
                    ));
                }
            }
        }

        if let DeviceKind::ScaleTcpSerial { channels, .. } = &self.kind {
            for c in channels {
                if c.rate_window_seconds == 0 {
                    errors.push(ConfigurationError::new(
                        format!(
                            "{path_prefix}.channels[{}].rate_window_seconds",
                            c.channel_number
                        ),
                        ConfigurationErrorKind::OutOfRange,
                        "rate_window_seconds must be > 0 (sample-count windows are not supported)",
                    ));
                }
            }
        }

        errors
    }

    /// Duration view of `poll_interval_ms`.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Duration view of `read_timeout_ms`.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Duration view of `connect_timeout_ms`.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Duration view of `retry_delay_ms`.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Where the TSDB writer sends its batched points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum TsdbBackend {
    /// Discard all writes; always reports healthy.
    #[default]
    None,
    /// Append line-protocol-formatted points to a file.
    File {
        /// Destination file path.
        path: PathBuf,
    },
}

/// TSDB writer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsdbConfig {
    /// Backend selection.
    pub backend: TsdbBackend,
    /// Flush the buffer once it reaches this many points.
    pub write_batch_size: usize,
    /// Flush the buffer at least this often, regardless of size.
    pub flush_interval_ms: u64,
    /// Bound on the in-memory buffer; beyond this, oldest points are dropped.
    pub max_buffered_points: usize,
    /// Retry policy for backend writes.
    pub retry: RetryPolicyConfig,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            backend: TsdbBackend::None,
            write_batch_size: 100,
            flush_interval_ms: 1000,
            max_buffered_points: 10_000,
            retry: RetryPolicyConfig::default(),
        }
    }
}

/// Observation/health broadcast queue sizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber bound on the observation stream.
    pub observation_queue_capacity: usize,
    /// Per-subscriber bound on the health stream.
    pub health_queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            observation_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            health_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// A user-supplied addition to the built-in scale protocol template catalog.
///
/// Regexes are kept as source strings here (this type is `serde`-friendly);
/// `acq-protocol` compiles them into a `CompiledTemplate` at load time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolTemplateConfig {
    /// Unique template identifier within the catalog.
    pub id: String,
    /// Commands sent in order during discovery, as UTF-8 source (CRLF appended).
    pub commands: Vec<String>,
    /// Regex source patterns tested against each response, case-insensitively.
    pub response_patterns: Vec<String>,
    /// Regex with exactly one numeric capture group, for weight extraction.
    pub weight_pattern: String,
    /// Default engineering unit when the pattern has no named unit group.
    pub unit: String,
    /// Substring marking a stable (non-moving) reading.
    pub stable_marker: Option<String>,
    /// Substrings marking an in-motion reading.
    pub motion_markers: Vec<String>,
}

/// Top-level configuration root for the acquisition engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// The configured device fleet.
    pub devices: Vec<DeviceConfig>,
    /// Maximum number of workers concurrently inside their read phase.
    pub max_concurrent_devices: usize,
    /// Time-series writer configuration.
    pub tsdb: TsdbConfig,
    /// Broadcast bus sizing.
    pub bus: BusConfig,
    /// User-added protocol templates, appended after the built-in catalog.
    pub protocol_templates: Vec<ProtocolTemplateConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            max_concurrent_devices: 8,
            tsdb: TsdbConfig::default(),
            bus: BusConfig::default(),
            protocol_templates: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string. Does not validate.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the whole configuration: per-device rules plus fleet-wide
    /// invariants (distinct `device_id`s). Returns an empty vector when valid.
    #[must_use]
    pub fn validate(&self) -> Vec<ConfigurationError> {
        let mut errors = Vec::new();

        if self.max_concurrent_devices == 0 {
            errors.push(ConfigurationError::new(
                "max_concurrent_devices",
                ConfigurationErrorKind::OutOfRange,
                "max_concurrent_devices must be > 0",
            ));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for device in &self.devices {
            errors.extend(device.validate());
            if !seen_ids.insert(device.device_id.clone()) {
                errors.push(ConfigurationError::new(
                    format!("devices[{}]", device.device_id),
                    ConfigurationErrorKind::DuplicateId,
                    format!("duplicate device_id '{}' in fleet", device.device_id),
                ));
            }
        }

        errors
    }
}

/// The kind of rule a [`ConfigurationError`] violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationErrorKind {
    /// A required field was absent or empty.
    MissingField,
    /// A value fell outside its legal range.
    OutOfRange,
    /// A value was syntactically invalid (e.g. unparsable IP address).
    Invalid,
    /// An identifier collided with another in the same scope.
    DuplicateId,
    /// A cross-field invariant was violated.
    Invariant,
}

/// One structured validation failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationError {
    /// Dotted field path of the offending value.
    pub path: String,
    /// Category of the violation.
    pub kind: ConfigurationErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl ConfigurationError {
    /// Build a new validation error.
    pub fn new(
        path: impl Into<String>,
        kind: ConfigurationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors from loading (not validating) configuration: I/O and TOML parsing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}
