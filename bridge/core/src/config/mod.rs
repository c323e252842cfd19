//! TOML Configuration File Support
//!
//! Centralized configuration loading for the bridge, from a TOML file at
//! `~/.config/hostbridge/bridge.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [runtime]
//! root_dir = "/run/user/1000/hostbridge"
//!
//! [broker]
//! input_buffer_capacity = 4096
//! output_buffer_capacity = 4096
//!
//! [audio]
//! enabled = true
//! per_connection_threads = true
//! backend = "file"
//! output = "/run/user/1000/hostbridge/audio.fifo"
//!
//! [shm]
//! enabled = true
//!
//! [guest]
//! enabled = true
//! host = "127.0.0.1"
//! port = 7946
//! reconnect_backoff_ms = 100
//! connect_timeout_ms = 1000
//! io_timeout_ms = 5000
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::{AudioBackend, AudioError, BackendKind};
use crate::broker::StreamCapacities;
use crate::guest::GuestChannelConfig;
use crate::paths::{self, AUDIO_SOCKET, SHM_SOCKET, X11_SOCKET};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Runtime section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeToml {
    /// Directory holding every service socket
    pub root_dir: Option<String>,
}

/// Broker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerToml {
    /// Initial per-connection input buffer size in bytes
    pub input_buffer_capacity: Option<usize>,

    /// Initial per-connection output buffer size in bytes
    pub output_buffer_capacity: Option<usize>,
}

/// Audio section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioToml {
    /// Whether the audio service runs
    pub enabled: Option<bool>,

    /// Service each audio connection on its own thread
    pub per_connection_threads: Option<bool>,

    /// Playback backend: "null" or "file"
    pub backend: Option<BackendKind>,

    /// Output path for the file backend
    pub output: Option<String>,
}

/// Shared-memory section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmToml {
    /// Whether the shared-memory service runs
    pub enabled: Option<bool>,
}

/// Guest channel section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestToml {
    /// Whether the guest channel runs
    pub enabled: Option<bool>,

    /// Agent host
    pub host: Option<String>,

    /// Agent port
    pub port: Option<u16>,

    /// Delay between connection attempts in milliseconds
    pub reconnect_backoff_ms: Option<u64>,

    /// Connection attempt timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,

    /// Read/write timeout in milliseconds (0 = no timeout)
    pub io_timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeToml {
    /// Runtime configuration section
    pub runtime: RuntimeToml,
    /// Broker configuration section
    pub broker: BrokerToml,
    /// Audio configuration section
    pub audio: AudioToml,
    /// Shared-memory configuration section
    pub shm: ShmToml,
    /// Guest channel configuration section
    pub guest: GuestToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the bridge
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    /// Directory holding every service socket
    pub root_dir: PathBuf,
    /// Initial per-connection stream buffer sizes
    pub capacities: StreamCapacities,
    /// Whether the audio service runs
    pub audio_enabled: bool,
    /// Service each audio connection on its own thread
    pub audio_per_connection_threads: bool,
    /// Playback backend
    pub audio_backend: BackendKind,
    /// Output path for [`BackendKind::File`]
    pub audio_output: Option<PathBuf>,
    /// Whether the shared-memory service runs
    pub shm_enabled: bool,
    /// Whether the guest channel runs
    pub guest_enabled: bool,
    /// Guest channel settings
    pub guest: GuestChannelConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            root_dir: paths::default_runtime_dir(),
            capacities: StreamCapacities::default(),
            audio_enabled: true,
            audio_per_connection_threads: true,
            audio_backend: BackendKind::default(),
            audio_output: None,
            shm_enabled: true,
            guest_enabled: true,
            guest: GuestChannelConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Audio service socket
    #[must_use]
    pub fn audio_socket_path(&self) -> PathBuf {
        paths::socket_path(&self.root_dir, AUDIO_SOCKET)
    }

    /// Shared-memory service socket
    #[must_use]
    pub fn shm_socket_path(&self) -> PathBuf {
        paths::socket_path(&self.root_dir, SHM_SOCKET)
    }

    /// Display server socket (reserved)
    #[must_use]
    pub fn x11_socket_path(&self) -> PathBuf {
        paths::socket_path(&self.root_dir, X11_SOCKET)
    }

    /// Build the configured playback backend; the null backend when audio
    /// is disabled
    ///
    /// # Errors
    ///
    /// Returns an error if the file backend has no output path.
    pub fn create_audio_backend(&self) -> Result<Arc<dyn AudioBackend>, AudioError> {
        if !self.audio_enabled {
            return BackendKind::Null.create(None);
        }
        self.audio_backend.create(self.audio_output.as_deref())
    }

    /// Check values that would make a service unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacities.input == 0 {
            return Err(ConfigError::ValidationError(
                "broker.input_buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.capacities.output == 0 {
            return Err(ConfigError::ValidationError(
                "broker.output_buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.audio_enabled
            && self.audio_backend == BackendKind::File
            && self.audio_output.is_none()
        {
            return Err(ConfigError::ValidationError(
                "audio.output is required by the file backend".to_string(),
            ));
        }
        if self.guest_enabled {
            if self.guest.port == 0 {
                return Err(ConfigError::ValidationError(
                    "guest.port must be non-zero".to_string(),
                ));
            }
            if self.guest.host.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "guest.host must not be empty".to_string(),
                ));
            }
            if self.guest.connect_timeout.is_zero() {
                return Err(ConfigError::ValidationError(
                    "guest.connect_timeout_ms must be greater than zero".to_string(),
                ));
            }
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "runtime.root_dir must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/hostbridge/bridge.toml` or
/// `~/.config/hostbridge/bridge.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hostbridge").join("bridge.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<BridgeConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BridgeConfig, ConfigError> {
    let mut config = BridgeConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;
            let toml_config: BridgeToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;
            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BridgeConfig, toml: &BridgeToml) {
    if let Some(ref root) = toml.runtime.root_dir {
        config.root_dir = PathBuf::from(root);
    }

    if let Some(capacity) = toml.broker.input_buffer_capacity {
        config.capacities.input = capacity;
    }
    if let Some(capacity) = toml.broker.output_buffer_capacity {
        config.capacities.output = capacity;
    }

    if let Some(enabled) = toml.audio.enabled {
        config.audio_enabled = enabled;
    }
    if let Some(threaded) = toml.audio.per_connection_threads {
        config.audio_per_connection_threads = threaded;
    }
    if let Some(backend) = toml.audio.backend {
        config.audio_backend = backend;
    }
    if let Some(ref output) = toml.audio.output {
        config.audio_output = Some(PathBuf::from(output));
    }

    if let Some(enabled) = toml.shm.enabled {
        config.shm_enabled = enabled;
    }

    if let Some(enabled) = toml.guest.enabled {
        config.guest_enabled = enabled;
    }
    if let Some(ref host) = toml.guest.host {
        config.guest.host.clone_from(host);
    }
    if let Some(port) = toml.guest.port {
        config.guest.port = port;
    }
    if let Some(ms) = toml.guest.reconnect_backoff_ms {
        config.guest.reconnect_backoff = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.guest.connect_timeout_ms {
        config.guest.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.guest.io_timeout_ms {
        config.guest.io_timeout = Duration::from_millis(ms);
    }
}

fn parse_flag(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false")
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name to its value.
fn apply_env_config(config: &mut BridgeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(root) = lookup("HOSTBRIDGE_ROOT_DIR") {
        if !root.is_empty() {
            config.root_dir = PathBuf::from(root);
            config.source = ConfigSource::Env;
        }
    }

    if let Some(host) = lookup("HOSTBRIDGE_GUEST_HOST") {
        if !host.is_empty() {
            config.guest.host = host;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(port) = lookup("HOSTBRIDGE_GUEST_PORT") {
        if let Ok(port) = port.parse::<u16>() {
            config.guest.port = port;
            config.source = ConfigSource::Env;
        }
    }

    if let Some(enabled) = lookup("HOSTBRIDGE_AUDIO") {
        config.audio_enabled = parse_flag(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(backend) = lookup("HOSTBRIDGE_AUDIO_BACKEND") {
        if let Ok(backend) = backend.parse::<BackendKind>() {
            config.audio_backend = backend;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(output) = lookup("HOSTBRIDGE_AUDIO_OUTPUT") {
        if !output.is_empty() {
            config.audio_output = Some(PathBuf::from(output));
            config.source = ConfigSource::Env;
        }
    }
    if let Some(enabled) = lookup("HOSTBRIDGE_SHM") {
        config.shm_enabled = parse_flag(&enabled);
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = lookup("HOSTBRIDGE_GUEST") {
        config.guest_enabled = parse_flag(&enabled);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Runtime root override
    pub root_dir: Option<PathBuf>,
    /// Guest host override
    pub guest_host: Option<String>,
    /// Guest port override
    pub guest_port: Option<u16>,
    /// Audio service enabled override
    pub audio_enabled: Option<bool>,
    /// Playback backend override
    pub audio_backend: Option<BackendKind>,
    /// File backend output override
    pub audio_output: Option<PathBuf>,
    /// Shared-memory service enabled override
    pub shm_enabled: Option<bool>,
    /// Guest channel enabled override
    pub guest_enabled: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set runtime root override
    #[must_use]
    pub fn with_root_dir(mut self, path: PathBuf) -> Self {
        self.root_dir = Some(path);
        self
    }

    /// Set guest host override
    #[must_use]
    pub fn with_guest_host(mut self, host: String) -> Self {
        self.guest_host = Some(host);
        self
    }

    /// Set guest port override
    #[must_use]
    pub fn with_guest_port(mut self, port: u16) -> Self {
        self.guest_port = Some(port);
        self
    }

    /// Set audio service enabled override
    #[must_use]
    pub fn with_audio_enabled(mut self, enabled: bool) -> Self {
        self.audio_enabled = Some(enabled);
        self
    }

    /// Set playback backend override
    #[must_use]
    pub fn with_audio_backend(mut self, backend: BackendKind) -> Self {
        self.audio_backend = Some(backend);
        self
    }

    /// Set file backend output override
    #[must_use]
    pub fn with_audio_output(mut self, path: PathBuf) -> Self {
        self.audio_output = Some(path);
        self
    }

    /// Set shared-memory service enabled override
    #[must_use]
    pub fn with_shm_enabled(mut self, enabled: bool) -> Self {
        self.shm_enabled = Some(enabled);
        self
    }

    /// Set guest channel enabled override
    #[must_use]
    pub fn with_guest_enabled(mut self, enabled: bool) -> Self {
        self.guest_enabled = Some(enabled);
        self
    }

    fn is_empty(&self) -> bool {
        self.root_dir.is_none()
            && self.guest_host.is_none()
            && self.guest_port.is_none()
            && self.audio_enabled.is_none()
            && self.audio_backend.is_none()
            && self.audio_output.is_none()
            && self.shm_enabled.is_none()
            && self.guest_enabled.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BridgeConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref root) = self.root_dir {
            config.root_dir.clone_from(root);
        }
        if let Some(ref host) = self.guest_host {
            config.guest.host.clone_from(host);
        }
        if let Some(port) = self.guest_port {
            config.guest.port = port;
        }
        if let Some(enabled) = self.audio_enabled {
            config.audio_enabled = enabled;
        }
        if let Some(backend) = self.audio_backend {
            config.audio_backend = backend;
        }
        if let Some(ref output) = self.audio_output {
            config.audio_output = Some(output.clone());
        }
        if let Some(enabled) = self.shm_enabled {
            config.shm_enabled = enabled;
        }
        if let Some(enabled) = self.guest_enabled {
            config.guest_enabled = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
