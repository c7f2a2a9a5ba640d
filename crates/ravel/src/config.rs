//! Configuration loading and validation for the ravel binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

use crate::director::DirectorTimers;
use crate::realserver::RealServerTimers;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Which worker this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Director,
    Realserver,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_mode")]
    pub mode: Mode,

    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub interfaces: InterfaceSettings,

    #[serde(default)]
    pub haproxy: HAProxySettings,

    #[serde(default)]
    pub ipvs: IpvsSettings,

    #[serde(default)]
    pub iptables: IpTablesSettings,

    #[serde(default)]
    pub timers: TimerSettings,

    #[serde(default)]
    pub watch: WatchSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

fn default_mode() -> Mode {
    Mode::Director
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.interfaces.validate()?;
        self.haproxy.validate()?;
        self.ipvs.validate()?;
        self.iptables.validate()?;
        self.timers.validate()?;
        Ok(())
    }
}

/// Identity of this node within the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Node name as known to the watcher (required for the realserver).
    #[serde(default)]
    pub name: String,
}

/// Network devices the workers manage.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InterfaceSettings {
    #[validate(length(min = 1))]
    pub loopback: String,

    #[validate(length(min = 1))]
    pub primary: String,
}

/// HAProxy supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct HAProxySettings {
    #[validate(custom = "validate_absolute_path")]
    pub binary: String,

    #[validate(custom = "validate_absolute_path")]
    pub config_dir: String,
}

/// IPVS programming settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IpvsSettings {
    #[validate(length(min = 1))]
    pub scheduler: String,

    #[validate(range(min = 1, max = 65535))]
    pub weight: u32,
}

/// Managed iptables naming.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct IpTablesSettings {
    #[validate(length(min = 1))]
    pub table: String,

    #[validate(length(min = 1))]
    pub base_chain: String,
}

/// Reconcile cadence.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TimerSettings {
    /// Director parity-gated tick.
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_fast_interval")]
    pub parity_interval: Duration,

    /// Director unconditional re-sync.
    #[serde(with = "humantime_serde")]
    pub forced_reconfigure_interval: Duration,

    /// Realserver fast parity-gated tick.
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_fast_interval")]
    pub check_interval: Duration,

    /// Realserver unconditional re-sync.
    #[serde(with = "humantime_serde")]
    pub slow_interval: Duration,

    /// Realserver forced reconfigure (parity bypassed).
    #[serde(with = "humantime_serde")]
    pub realserver_forced_interval: Duration,

    /// Whether the realserver forced tick is active.
    pub forced_reconfigure: bool,
}

/// Source of cluster state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSettings {
    /// Snapshot file polled by the file watcher.
    pub file: PathBuf,
}

/// Metrics exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    pub enabled: bool,
    pub listen_addr: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            loopback: "lo".to_string(),
            primary: "eth0".to_string(),
        }
    }
}

impl Default for HAProxySettings {
    fn default() -> Self {
        Self {
            binary: "/usr/sbin/haproxy".to_string(),
            config_dir: "/etc/ravel".to_string(),
        }
    }
}

impl Default for IpvsSettings {
    fn default() -> Self {
        Self {
            scheduler: "wlc".to_string(),
            weight: 1,
        }
    }
}

impl Default for IpTablesSettings {
    fn default() -> Self {
        Self {
            table: "nat".to_string(),
            base_chain: "RAVEL".to_string(),
        }
    }
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            parity_interval: Duration::from_millis(2000),
            forced_reconfigure_interval: Duration::from_secs(30),
            check_interval: Duration::from_millis(100),
            slow_interval: Duration::from_secs(60),
            realserver_forced_interval: Duration::from_secs(600),
            forced_reconfigure: false,
        }
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/etc/ravel/cluster.yaml"),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:9100".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Director,
            node: NodeSettings::default(),
            interfaces: InterfaceSettings::default(),
            haproxy: HAProxySettings::default(),
            ipvs: IpvsSettings::default(),
            iptables: IpTablesSettings::default(),
            timers: TimerSettings::default(),
            watch: WatchSettings::default(),
            metrics: MetricsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

// Custom validators

fn validate_absolute_path(path: &str) -> Result<(), ValidationError> {
    if path.trim().is_empty() || !path.starts_with('/') {
        return Err(ValidationError::new("path_not_absolute"));
    }
    Ok(())
}

fn validate_fast_interval(interval: &Duration) -> Result<(), ValidationError> {
    let millis = interval.as_millis();
    if !(10..=60_000).contains(&millis) {
        return Err(ValidationError::new("interval_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/ravel/ravel.yaml")];

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config/ravel/ravel.yaml"));
        }

        paths.push(PathBuf::from("./ravel.yaml"));

        paths.into_iter().find(|p| p.exists() && p.is_file())
    }

    pub fn director_timers(&self) -> DirectorTimers {
        DirectorTimers {
            parity: self.timers.parity_interval,
            forced_reconfigure: self.timers.forced_reconfigure_interval,
            ..DirectorTimers::default()
        }
    }

    pub fn realserver_timers(&self) -> RealServerTimers {
        RealServerTimers {
            check: self.timers.check_interval,
            slow: self.timers.slow_interval,
            forced: self.timers.realserver_forced_interval,
        }
    }
}
