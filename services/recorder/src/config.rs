//! Configuration management for the recorder service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the recorder service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecorderConfig {
    /// Ingest endpoint configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Staging and output directories
    #[serde(default)]
    pub storage: StorageConfig,

    /// Periodic assembly configuration
    #[serde(default)]
    pub assembly: AssemblyConfig,

    /// External encoder configuration
    #[serde(default)]
    pub encoder: EncoderConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus exporter configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Periodic statistics logging
    #[serde(default)]
    pub stats: StatsConfig,
}

/// WebSocket ingest endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path devices connect to (e.g., "/upload")
    #[serde(default = "default_path")]
    pub path: String,
}

/// Staging store and output location.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding frames between arrival and cleanup
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Directory assembled videos are written to
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// File extension for staged frames
    #[serde(default = "default_frame_extension")]
    pub frame_extension: String,
}

/// Periodic assembly configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AssemblyConfig {
    /// Seconds between assembly ticks
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Output video frame rate
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
}

/// External encoder invocation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EncoderConfig {
    /// Encoder executable name or path
    #[serde(default = "default_encoder_binary")]
    pub binary: String,

    /// Video codec
    #[serde(default = "default_codec")]
    pub codec: String,

    /// Codec preset (omitted from the command line when empty)
    #[serde(default = "default_preset")]
    pub preset: String,

    /// Target bitrate (e.g., "1M")
    #[serde(default = "default_bitrate")]
    pub bitrate: String,

    /// Optional output resolution as WIDTHxHEIGHT
    #[serde(default)]
    pub resolution: Option<String>,

    /// Output pixel format
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    /// Output container extension
    #[serde(default = "default_container_extension")]
    pub container_extension: String,

    /// Wall-clock limit for a single encode in seconds
    #[serde(default = "default_encoder_timeout")]
    pub timeout_secs: u64,
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
}

/// Prometheus metrics exporter configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Install the exporter at startup
    #[serde(default)]
    pub enabled: bool,

    /// Exporter listen port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Periodic statistics logging.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Interval between stats log lines in seconds
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8081
}
fn default_path() -> String {
    "/upload".to_string()
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("image_cache")
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("output_videos")
}
fn default_frame_extension() -> String {
    "jpg".to_string()
}
fn default_interval_secs() -> u64 {
    60
}
fn default_target_fps() -> u32 {
    30
}
fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}
fn default_codec() -> String {
    "libx264".to_string()
}
fn default_preset() -> String {
    "fast".to_string()
}
fn default_bitrate() -> String {
    "1M".to_string()
}
fn default_pixel_format() -> String {
    "yuv420p".to_string()
}
fn default_container_extension() -> String {
    "mp4".to_string()
}
fn default_encoder_timeout() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_stats_interval() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            output_dir: default_output_dir(),
            frame_extension: default_frame_extension(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            target_fps: default_target_fps(),
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            binary: default_encoder_binary(),
            codec: default_codec(),
            preset: default_preset(),
            bitrate: default_bitrate(),
            resolution: None,
            pixel_format: default_pixel_format(),
            container_extension: default_container_extension(),
            timeout_secs: default_encoder_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_stats_interval(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with RECORDER_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. RECORDER_ASSEMBLY__TARGET_FPS=15
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("RECORDER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.server.port == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port must be greater than 0".to_string(),
            });
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.path".to_string(),
                message: "Path must start with '/'".to_string(),
            });
        }
        if self.server.path == "/health" {
            return Err(ConfigValidationError::InvalidValue {
                field: "server.path".to_string(),
                message: "'/health' is reserved for the health endpoint".to_string(),
            });
        }

        if self.storage.staging_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.staging_dir".to_string(),
            ));
        }
        if self.storage.output_dir.as_os_str().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "storage.output_dir".to_string(),
            ));
        }

        if self.assembly.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "assembly.interval_secs".to_string(),
                message: "Interval must be at least 1 second".to_string(),
            });
        }
        if !(1..=240).contains(&self.assembly.target_fps) {
            return Err(ConfigValidationError::InvalidValue {
                field: "assembly.target_fps".to_string(),
                message: "FPS must be between 1 and 240".to_string(),
            });
        }

        for (field, value) in [
            ("encoder.binary", &self.encoder.binary),
            ("encoder.codec", &self.encoder.codec),
            ("encoder.pixel_format", &self.encoder.pixel_format),
            ("encoder.container_extension", &self.encoder.container_extension),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigValidationError::MissingField(field.to_string()));
            }
        }
        if self.encoder.timeout_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "encoder.timeout_secs".to_string(),
                message: "Timeout must be at least 1 second".to_string(),
            });
        }
        if let Some(resolution) = &self.encoder.resolution {
            if parse_resolution(resolution).is_none() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "encoder.resolution".to_string(),
                    message: format!("Expected WIDTHxHEIGHT, got {:?}", resolution),
                });
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            return Err(ConfigValidationError::InvalidValue {
                field: "logging.format".to_string(),
                message: "Format must be 'json' or 'pretty'".to_string(),
            });
        }

        Ok(())
    }
}

impl AssemblyConfig {
    /// Get the tick interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl EncoderConfig {
    /// Get the encode timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl StatsConfig {
    /// Get the stats logging interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Parse a `WIDTHxHEIGHT` string into positive dimensions.
pub fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once(['x', 'X'])?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().parse().ok()?;
    (w > 0 && h > 0).then_some((w, h))
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
