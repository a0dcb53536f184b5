//! Configuration loading and validation for the VIP manager

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "VIP_MANAGER_CONFIG";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("Configuration file {0} does not exist")]
    NotFound(PathBuf),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub cluster: ClusterSettings,

    #[serde(default)]
    pub leader_election: LeaderElectionSettings,

    #[serde(default)]
    pub bgp: BgpSettings,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.cluster.validate()?;
        self.leader_election.validate()?;
        self.metrics.validate()?;

        let needs_interface = self.engine.arp || self.engine.routing_table;
        if needs_interface && self.node.interface.trim().is_empty() {
            let mut errors = ValidationErrors::new();
            errors.add("node", ValidationError::new("interface_required"));
            return Err(errors);
        }
        Ok(())
    }
}

/// Identity and interfaces of this node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Cluster node name; empty means "use the local hostname"
    pub name: String,

    /// Interface VIPs are bound to
    pub interface: String,

    /// Overrides `interface` for service VIPs
    pub services_interface: String,

    /// When set, service traffic is mirrored to this interface
    pub mirror_dest_interface: String,
}

impl NodeSettings {
    /// The interface carrying service traffic.
    pub fn service_interface(&self) -> &str {
        if self.services_interface.is_empty() {
            &self.interface
        } else {
            &self.services_interface
        }
    }
}

/// Advertisement engine flags, evaluated in the order BGP, ARP, WireGuard, RoutingTable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub bgp: bool,
    pub arp: bool,
    pub wireguard: bool,
    pub routing_table: bool,

    pub wireguard_interface: String,
    pub routing_table_id: u32,
    pub routing_protocol: u8,
}

/// Which backend holds leader-election locks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderElectionType {
    #[default]
    Kubernetes,
    Etcd,
}

/// How to reach the cluster API
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClusterSettings {
    pub leader_election_type: LeaderElectionType,

    /// Explicit API server address (host:port or URL)
    pub kubernetes_addr: String,

    /// This node hosts the control plane
    pub control_plane: bool,

    /// Look for a reachable API server instead of using the alias address
    pub detect_control_plane: bool,

    #[validate(range(min = 1, max = 65535))]
    pub port: u32,
}

/// Per-service leader election timing
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_election_timing"))]
pub struct LeaderElectionSettings {
    /// Namespace holding the leases; empty means the service-account namespace
    pub namespace: String,

    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,

    #[serde(with = "humantime_serde")]
    pub renew_deadline: Duration,

    #[serde(with = "humantime_serde")]
    pub retry_period: Duration,
}

/// BGP engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BgpSettings {
    /// Node annotation prefix carrying AS/peer parameters; empty disables lookup
    pub annotations: String,

    /// Path to the gobgp CLI
    pub gobgp: String,
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub listen_addr: String,
}

/// OpenTelemetry export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
    pub otlp_endpoint: String,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bgp: false,
            arp: false,
            wireguard: false,
            routing_table: false,
            wireguard_interface: "wg0".to_string(),
            routing_table_id: 198,
            routing_protocol: 248,
        }
    }
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            leader_election_type: LeaderElectionType::Kubernetes,
            kubernetes_addr: String::new(),
            control_plane: false,
            detect_control_plane: false,
            port: 6443,
        }
    }
}

impl Default for LeaderElectionSettings {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            lease_duration: Duration::from_secs(5),
            renew_deadline: Duration::from_secs(3),
            retry_period: Duration::from_secs(1),
        }
    }
}

impl Default for BgpSettings {
    fn default() -> Self {
        Self {
            annotations: String::new(),
            gobgp: "gobgp".to_string(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:2112".to_string(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: "vip-manager".to_string(),
            otlp_endpoint: "http://localhost:4317".to_string(),
        }
    }
}

// Custom validators

fn validate_election_timing(settings: &LeaderElectionSettings) -> Result<(), ValidationError> {
    if settings.retry_period.is_zero() {
        return Err(ValidationError::new("retry_period_zero"));
    }
    if settings.retry_period >= settings.renew_deadline {
        return Err(ValidationError::new("retry_period_not_below_renew_deadline"));
    }
    if settings.renew_deadline >= settings.lease_duration {
        return Err(ValidationError::new("renew_deadline_not_below_lease_duration"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    ///
    /// Defaults are used only when no file exists. A file named by
    /// `VIP_MANAGER_CONFIG` must exist, and any file found must parse.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Self::load_from(explicit, &Self::default_paths())
    }

    fn load_from(explicit: Option<PathBuf>, defaults: &[PathBuf]) -> Result<Self, ConfigError> {
        match locate(explicit, defaults)? {
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
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/vip-manager/config.yaml")];

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config/vip-manager/config.yaml"));
        }

        paths.push(PathBuf::from("./vip-manager.yaml"));
        paths
    }
}

/// Find configuration file: the explicit path, else the first default that exists
fn locate(explicit: Option<PathBuf>, defaults: &[PathBuf]) -> Result<Option<PathBuf>, ConfigError> {
    match explicit {
        Some(path) if path.is_file() => Ok(Some(path)),
        Some(path) => Err(ConfigError::NotFound(path)),
        None => Ok(defaults.iter().find(|p| p.is_file()).cloned()),
    }
}
