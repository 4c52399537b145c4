//! Pusher Configuration
//!
//! Centralized configuration for the pusher node. Values are layered:
//! defaults, then the JSON config file shared with the rest of the LiteIM
//! deployment (`conf/conf.json`), then environment variables. The result is
//! validated once at startup and never changes afterwards.

use backoff::ExponentialBackoff;
use liteim_core::ServiceRole;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default location of the deployment config file
pub const DEFAULT_CONFIG_PATH: &str = "conf/conf.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which registry implementation backs registration and discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryBackend {
    /// etcd cluster at `etcd_endpoints`
    Etcd,
    /// In-process registry, for single-node development runs
    Memory,
}

impl std::str::FromStr for RegistryBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "etcd" => Ok(Self::Etcd),
            "memory" => Ok(Self::Memory),
            other => Err(ConfigError::InvalidValue {
                key: "REGISTRY_BACKEND",
                value: other.to_string(),
            }),
        }
    }
}

/// Pusher configuration with sensible defaults
#[derive(Debug, Clone)]
pub struct PusherConfig {
    // RPC settings
    /// Port the push RPC service listens on and advertises (file: GRPCPort, env: RPC_PORT)
    pub rpc_port: u16,

    /// Time allowed for in-flight requests to finish once the RPC service stops
    pub rpc_drain_timeout: Duration,

    // Service roles
    /// Role this node registers under (file: PushServiceName, env: PUSH_SERVICE_NAME)
    pub push_service_name: ServiceRole,

    /// Role this node discovers (file: GatewayServiceName, env: GATEWAY_SERVICE_NAME)
    pub gateway_service_name: ServiceRole,

    // Registry settings
    /// Registry implementation (env: REGISTRY_BACKEND)
    pub registry_backend: RegistryBackend,

    /// Etcd endpoints (file: EtcdEndpoints, env: ETCD_ENDPOINTS, comma-separated)
    pub etcd_endpoints: Vec<String>,

    // Identity settings
    /// Explicit advertised address, skips interface enumeration (env: POD_IP)
    pub advertise_ip: Option<Ipv4Addr>,

    /// Pick the lexicographically smallest interface instead of the first one (env: STABLE_IDENTITY)
    pub stable_identity: bool,

    // Lease settings
    /// TTL for the registration lease (file: LeaseTtlSecs)
    pub lease_ttl: Duration,

    /// Interval for lease keep-alive, 1/3 of TTL recommended (file: KeepaliveIntervalSecs)
    pub keepalive_interval: Duration,

    // Retry settings
    /// Initial interval for renewal and watch retries
    pub retry_backoff_initial: Duration,

    /// Maximum interval for renewal and watch retries
    pub retry_backoff_max: Duration,

    /// Multiplier for retry backoff
    pub retry_backoff_multiplier: f64,

    /// Upper bound for connecting and initial registration before startup fails
    pub connect_max_elapsed: Duration,

    // Shutdown settings
    /// Bound on each component's exit during shutdown
    pub exit_timeout: Duration,
}

impl Default for PusherConfig {
    fn default() -> Self {
        Self {
            rpc_port: 9000,
            rpc_drain_timeout: Duration::from_secs(10),

            push_service_name: ServiceRole::push_service(),
            gateway_service_name: ServiceRole::gateway_service(),

            registry_backend: RegistryBackend::Etcd,
            etcd_endpoints: vec!["http://127.0.0.1:2379".to_string()],

            advertise_ip: None,
            stable_identity: false,

            lease_ttl: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(5),

            retry_backoff_initial: Duration::from_secs(1),
            retry_backoff_max: Duration::from_secs(10),
            retry_backoff_multiplier: 2.0,
            connect_max_elapsed: Duration::from_secs(60),

            exit_timeout: Duration::from_secs(5),
        }
    }
}

/// Keys of the shared deployment config file. Only the keys the pusher
/// core needs are read, the rest of the file belongs to other components.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConfigFile {
    #[serde(rename = "GRPCPort")]
    grpc_port: Option<u16>,
    push_service_name: Option<String>,
    gateway_service_name: Option<String>,
    etcd_endpoints: Option<Vec<String>>,
    lease_ttl_secs: Option<u64>,
    keepalive_interval_secs: Option<u64>,
    exit_timeout_secs: Option<u64>,
    rpc_drain_timeout_secs: Option<u64>,
}

impl PusherConfig {
    /// Load the config file (if present), then apply environment overrides.
    ///
    /// A missing file at the default location is not an error, a missing
    /// file that was explicitly requested is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        if required || path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            config.apply_file(&raw, &path)?;
        }

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_file(&mut self, raw: &str, path: &Path) -> Result<(), ConfigError> {
        let file: ConfigFile = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(port) = file.grpc_port {
            self.rpc_port = port;
        }
        if let Some(name) = file.push_service_name {
            self.push_service_name = parse_role("PushServiceName", name)?;
        }
        if let Some(name) = file.gateway_service_name {
            self.gateway_service_name = parse_role("GatewayServiceName", name)?;
        }
        if let Some(endpoints) = file.etcd_endpoints {
            self.etcd_endpoints = endpoints;
        }
        if let Some(secs) = file.lease_ttl_secs {
            self.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = file.keepalive_interval_secs {
            self.keepalive_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.exit_timeout_secs {
            self.exit_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.rpc_drain_timeout_secs {
            self.rpc_drain_timeout = Duration::from_secs(secs);
        }

        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(port) = var("RPC_PORT") {
            self.rpc_port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "RPC_PORT",
                value: port,
            })?;
        }

        if let Some(name) = var("PUSH_SERVICE_NAME") {
            self.push_service_name = parse_role("PUSH_SERVICE_NAME", name)?;
        }

        if let Some(name) = var("GATEWAY_SERVICE_NAME") {
            self.gateway_service_name = parse_role("GATEWAY_SERVICE_NAME", name)?;
        }

        if let Some(backend) = var("REGISTRY_BACKEND") {
            self.registry_backend = backend.parse()?;
        }

        if let Some(endpoints) = var("ETCD_ENDPOINTS") {
            self.etcd_endpoints = endpoints
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Some(ip) = var("POD_IP") {
            self.advertise_ip = Some(ip.parse().map_err(|_| ConfigError::InvalidValue {
                key: "POD_IP",
                value: ip,
            })?);
        }

        if let Some(stable) = var("STABLE_IDENTITY") {
            self.stable_identity = matches!(stable.as_str(), "1" | "true" | "yes");
        }

        Ok(())
    }

    /// Reject combinations the lifecycle cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rpc_port == 0 {
            return Err(ConfigError::Invalid(
                "rpc_port must be set, the advertised address needs a fixed port".into(),
            ));
        }
        if self.push_service_name == self.gateway_service_name {
            return Err(ConfigError::Invalid(format!(
                "push and gateway roles must differ (both '{}')",
                self.push_service_name
            )));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.lease_ttl {
            return Err(ConfigError::Invalid(format!(
                "keepalive interval {:?} must be non-zero and shorter than lease TTL {:?}",
                self.keepalive_interval, self.lease_ttl
            )));
        }
        if self.registry_backend == RegistryBackend::Etcd && self.etcd_endpoints.is_empty() {
            return Err(ConfigError::Invalid("no etcd endpoints configured".into()));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry backoff multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Exponential backoff for registry retries. `None` retries forever.
    pub fn retry_backoff(&self, max_elapsed: Option<Duration>) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.retry_backoff_initial,
            max_interval: self.retry_backoff_max,
            max_elapsed_time: max_elapsed,
            multiplier: self.retry_backoff_multiplier,
            ..Default::default()
        }
    }
}

fn parse_role(key: &'static str, name: String) -> Result<ServiceRole, ConfigError> {
    ServiceRole::new(name.clone()).map_err(|_| ConfigError::InvalidValue { key, value: name })
}
