//! Strongly-typed settings for the two binaries.
//!
//! Both configurations are loaded with Figment from a TOML file and then
//! overridden by environment variables prefixed with `PTD_DIRECTOR_`, using a
//! double underscore as the key separator:
//!
//! ```text
//! PTD_DIRECTOR_APPLICATION__LOG_LEVEL=debug
//! PTD_DIRECTOR_SERVER__LISTEN=0.0.0.0:4951
//! PTD_DIRECTOR_CLIENT__LABEL=resnet50
//! ```

use crate::instrument::RangingMode;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PTD_DIRECTOR_";

/// Default port of the director's command protocol.
pub const DEFAULT_PORT: u16 = 4950;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration file '{0}' does not exist")]
    MissingFile(PathBuf),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Settings shared by both binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// ============================================================================
// Server (director host)
// ============================================================================

/// Top-level configuration of `ptd-server`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub application: ApplicationConfig,
    pub server: ServerConfig,
    pub ptd: PtdConfig,
}

/// Listener, output layout and calibration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the command protocol listens on.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Root directory for per-session output.
    pub out_dir: PathBuf,
    /// Range used for the ranging phase.
    #[serde(default)]
    pub ranging_mode: RangingMode,
    /// Headroom multiplier applied to ranging maxima before testing.
    #[serde(default = "default_correction_factor")]
    pub correction_factor: f64,
    /// Optional JSON file with externally derived max amps/volts per label.
    #[serde(default)]
    pub calibration_file: Option<PathBuf>,
    /// Keep the daemon running after `done` instead of releasing it.
    #[serde(default)]
    pub keep_daemon_between_sessions: bool,
    /// TCP keepalive timers for accepted client connections.
    #[serde(default)]
    pub keepalive: KeepaliveSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            out_dir: PathBuf::from("power_logs"),
            ranging_mode: RangingMode::default(),
            correction_factor: default_correction_factor(),
            calibration_file: None,
            keep_daemon_between_sessions: false,
            keepalive: KeepaliveSettings::default(),
        }
    }
}

/// Dead-peer detection timers, `[server.keepalive]`.
///
/// The kernel takes whole seconds, so both intervals must be at least 1000 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepaliveSettings {
    #[serde(default = "default_keepalive_ms")]
    pub idle_ms: u64,
    #[serde(default = "default_keepalive_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_keepalive_count")]
    pub count: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            idle_ms: default_keepalive_ms(),
            interval_ms: default_keepalive_ms(),
            count: default_keepalive_count(),
        }
    }
}

/// How to launch and talk to the PTDaemon instrument daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PtdConfig {
    /// Path of the daemon executable.
    pub executable: PathBuf,
    /// Control port the daemon listens on (`-p`).
    #[serde(default = "default_ptd_port")]
    pub network_port: u16,
    /// Analyzer model number passed to the daemon.
    pub device_type: u32,
    /// Device port of the analyzer, e.g. `/dev/usbtmc0` or `COM1`.
    pub device_port: String,
    /// Interface selection flag such as `-g` or `-y`; empty for serial.
    #[serde(default)]
    pub interface_flag: String,
    /// DC measurement flag, when the analyzer measures DC.
    #[serde(default)]
    pub dc_flag: Option<String>,
    /// Channel selection (`-c`), required by multichannel analyzers.
    #[serde(default)]
    pub channel: Option<Vec<u32>>,
    /// Raw log file the daemon appends every sample to (`-l`).
    pub log_file: PathBuf,
    /// Hardware settling time after a range change.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Attempts to connect to the daemon control port.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    /// Pause between connect attempts.
    #[serde(default = "default_connect_retry_interval_ms")]
    pub connect_retry_interval_ms: u64,
    /// Upper bound for a single daemon reply.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    /// Sampling interval passed to `Go`.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u32,
    /// Trigger value passed to `Go`.
    #[serde(default)]
    pub trigger: u32,
}

impl Default for PtdConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("ptd"),
            network_port: default_ptd_port(),
            device_type: 49,
            device_port: String::new(),
            interface_flag: String::new(),
            dc_flag: None,
            channel: None,
            log_file: PathBuf::from("ptd_logfile.log"),
            settle_delay_ms: default_settle_delay_ms(),
            connect_retries: default_connect_retries(),
            connect_retry_interval_ms: default_connect_retry_interval_ms(),
            reply_timeout_ms: default_reply_timeout_ms(),
            sample_interval_ms: default_sample_interval_ms(),
            trigger: 0,
        }
    }
}

impl PtdConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Command-line arguments for the daemon, in the order it expects them.
    pub fn daemon_args(&self) -> Vec<String> {
        let mut args = vec![
            "-l".to_string(),
            self.log_file.display().to_string(),
            "-p".to_string(),
            self.network_port.to_string(),
        ];
        if let Some(channel) = &self.channel {
            let joined: Vec<String> = channel.iter().map(u32::to_string).collect();
            args.push("-c".to_string());
            args.push(joined.join(","));
        }
        if let Some(dc_flag) = &self.dc_flag {
            args.push(dc_flag.clone());
        }
        if !self.interface_flag.is_empty() {
            args.push(self.interface_flag.clone());
        }
        args.push(self.device_type.to_string());
        args.push(self.device_port.clone());
        args
    }
}

impl ServerSettings {
    /// Load from a TOML file plus `PTD_DIRECTOR_` environment overrides,
    /// then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = extract(path.as_ref())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_log_level(&self.application.log_level)?;

        if !(self.server.correction_factor.is_finite() && self.server.correction_factor > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid correction_factor {}. Must be a positive number",
                self.server.correction_factor
            )));
        }
        if self.server.out_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "'server.out_dir' cannot be empty".to_string(),
            ));
        }
        if self.ptd.executable.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "'ptd.executable' cannot be empty".to_string(),
            ));
        }
        if self.ptd.device_port.is_empty() {
            return Err(ConfigError::ValidationError(
                "'ptd.device_port' cannot be empty".to_string(),
            ));
        }
        if self.ptd.network_port == self.server.listen.port() {
            return Err(ConfigError::ValidationError(format!(
                "PTDaemon port {} collides with the listen port",
                self.ptd.network_port
            )));
        }
        if self.ptd.connect_retries == 0 {
            return Err(ConfigError::ValidationError(
                "'ptd.connect_retries' must be > 0".to_string(),
            ));
        }
        let keepalive = &self.server.keepalive;
        if keepalive.idle_ms < 1000 || keepalive.interval_ms < 1000 {
            return Err(ConfigError::ValidationError(format!(
                "Keepalive idle_ms ({}) and interval_ms ({}) must be at least 1000",
                keepalive.idle_ms, keepalive.interval_ms
            )));
        }
        if keepalive.count == 0 {
            return Err(ConfigError::ValidationError(
                "'server.keepalive.count' must be > 0".to_string(),
            ));
        }
        if let Some(channel) = &self.ptd.channel {
            if channel.is_empty() || channel.len() > 2 {
                return Err(ConfigError::ValidationError(format!(
                    "'ptd.channel' should consist of one or two numbers, got {:?}",
                    channel
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Client (system under test)
// ============================================================================

/// Top-level configuration of `ptd-client`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub application: ApplicationConfig,
    pub client: ClientConfig,
}

/// Everything one measurement run needs on the SUT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Director address as `host:port`.
    pub server_addr: String,
    /// Shell command run under measurement.
    pub workload: String,
    /// Label included in the session id.
    #[serde(default)]
    pub label: String,
    /// Directory the workload writes its logs into.
    pub loadgen_logs: PathBuf,
    /// Local directory collecting the run's logs.
    pub output: PathBuf,
    /// Upload the zipped workload logs after each phase.
    #[serde(default)]
    pub send_logs: bool,
    /// Remove a stale loadgen logs directory instead of failing.
    #[serde(default)]
    pub force: bool,
    /// Skip the testing phase.
    #[serde(default)]
    pub ranging_only: bool,
    /// Abort the run when the workload exits non-zero.
    #[serde(default = "default_true")]
    pub fail_on_workload_error: bool,
    /// Largest tolerated clock difference to the director.
    #[serde(default = "default_max_time_drift_ms")]
    pub max_time_drift_ms: u64,
    /// Ask the server to exit once this client disconnects.
    #[serde(default)]
    pub stop_server: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            workload: String::new(),
            label: String::new(),
            loadgen_logs: PathBuf::from("loadgen_logs"),
            output: PathBuf::from("results"),
            send_logs: false,
            force: false,
            ranging_only: false,
            fail_on_workload_error: true,
            max_time_drift_ms: default_max_time_drift_ms(),
            stop_server: false,
        }
    }
}

impl ClientSettings {
    /// Load from a TOML file plus `PTD_DIRECTOR_` environment overrides,
    /// then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = extract(path.as_ref())?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_log_level(&self.application.log_level)?;

        if self.client.server_addr.is_empty() {
            return Err(ConfigError::ValidationError(
                "'client.server_addr' cannot be empty".to_string(),
            ));
        }
        if self.client.workload.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "'client.workload' cannot be empty".to_string(),
            ));
        }
        if !is_valid_label(&self.client.label) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid label '{}'. Should be alphanumeric or -_",
                self.client.label
            )));
        }
        Ok(())
    }
}

/// Labels end up in directory names and in the daemon's log marker.
pub fn is_valid_label(label: &str) -> bool {
    label
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn extract<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingFile(path.to_path_buf()));
    }
    Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::LoadError(Box::new(e)))
}

fn validate_log_level(level: &str) -> Result<(), ConfigError> {
    if !VALID_LOG_LEVELS.contains(&level) {
        return Err(ConfigError::ValidationError(format!(
            "Invalid log_level '{}'. Must be one of: {}",
            level,
            VALID_LOG_LEVELS.join(", ")
        )));
    }
    Ok(())
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_correction_factor() -> f64 {
    1.1
}

fn default_ptd_port() -> u16 {
    8888
}

fn default_settle_delay_ms() -> u64 {
    10_000
}

fn default_connect_retries() -> u32 {
    60
}

fn default_connect_retry_interval_ms() -> u64 {
    1000
}

fn default_reply_timeout_ms() -> u64 {
    5000
}

fn default_sample_interval_ms() -> u32 {
    1000
}

fn default_keepalive_ms() -> u64 {
    2000
}

fn default_keepalive_count() -> u32 {
    10
}

fn default_max_time_drift_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}
