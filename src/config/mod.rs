use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration, shared by the gateway and the limiter process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiter service and link configuration
    #[serde(default)]
    pub limiter: LimiterConfig,
    /// Policy store and refresh configuration
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Static service discovery table
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Instance offset mixed into every request id (0-9)
    #[serde(default)]
    pub server_id: i64,
    /// Generic entry path whose API name comes from a parameter
    #[serde(default = "default_entry_path")]
    pub entry_path: String,
    /// Port of the Prometheus exporter (0 disables it)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Address the limiter process listens on
    #[serde(default = "default_limiter_listen")]
    pub listen: String,
    /// Address the gateway dials
    #[serde(default = "default_limiter_addr")]
    pub addr: String,
    /// Upper bound of a single RPC call
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    /// Liveness probe interval
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// First redial delay after a failed probe
    #[serde(default = "default_redial_initial_ms")]
    pub redial_initial_ms: u64,
    /// Largest redial delay
    #[serde(default = "default_redial_max_ms")]
    pub redial_max_ms: u64,
}

/// Policy store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Path of the policy document
    #[serde(default = "default_policy_store")]
    pub store: String,
    /// Incremental refresh interval
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// How far each incremental query is backdated
    #[serde(default = "default_grace")]
    pub grace_secs: u64,
    /// Run a full reload every N refresh ticks (0 disables)
    #[serde(default = "default_full_resync_every")]
    pub full_resync_every: u32,
}

/// Static discovery table: service name -> instance addresses
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub services: HashMap<String, Vec<String>>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_entry_path() -> String {
    "/service/api".to_string()
}

fn default_metrics_port() -> u16 {
    6062
}

fn default_limiter_listen() -> String {
    "0.0.0.0:8070".to_string()
}

fn default_limiter_addr() -> String {
    "127.0.0.1:8070".to_string()
}

fn default_rpc_timeout_ms() -> u64 {
    1000
}

fn default_ping_interval() -> u64 {
    3
}

fn default_redial_initial_ms() -> u64 {
    500
}

fn default_redial_max_ms() -> u64 {
    2000
}

fn default_policy_store() -> String {
    "config/policies.yaml".to_string()
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_grace() -> u64 {
    2
}

fn default_full_resync_every() -> u32 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            server_id: 0,
            entry_path: default_entry_path(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            listen: default_limiter_listen(),
            addr: default_limiter_addr(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            ping_interval_secs: default_ping_interval(),
            redial_initial_ms: default_redial_initial_ms(),
            redial_max_ms: default_redial_max_ms(),
        }
    }
}

impl LimiterConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn redial_initial(&self) -> Duration {
        Duration::from_millis(self.redial_initial_ms)
    }

    pub fn redial_max(&self) -> Duration {
        Duration::from_millis(self.redial_max_ms.max(self.redial_initial_ms))
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            store: default_policy_store(),
            refresh_interval_secs: default_refresh_interval(),
            grace_secs: default_grace(),
            full_resync_every: default_full_resync_every(),
        }
    }
}

impl PolicyConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file, with `JUZ__`-prefixed environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GatewayError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix("JUZ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(0..10).contains(&self.server.server_id) {
            return Err(GatewayError::Config(format!(
                "server_id must be in [0,9], got {}",
                self.server.server_id
            )));
        }

        if !self.server.entry_path.starts_with('/') {
            return Err(GatewayError::Config(format!(
                "entry_path must start with '/': {}",
                self.server.entry_path
            )));
        }

        if self.policy.store.is_empty() {
            return Err(GatewayError::Config(
                "Policy store path cannot be empty".to_string(),
            ));
        }

        if self.policy.refresh_interval_secs == 0 {
            return Err(GatewayError::Config(
                "Policy refresh interval must be > 0".to_string(),
            ));
        }

        if self.limiter.ping_interval_secs == 0 {
            return Err(GatewayError::Config(
                "Limiter ping interval must be > 0".to_string(),
            ));
        }

        if self.limiter.rpc_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "Limiter RPC timeout must be > 0".to_string(),
            ));
        }

        self.limiter.addr.parse::<SocketAddr>().map_err(|e| {
            GatewayError::Config(format!(
                "Invalid limiter address '{}': {}",
                self.limiter.addr, e
            ))
        })?;

        for (service, instances) in &self.discovery.services {
            if instances.is_empty() {
                return Err(GatewayError::Config(format!(
                    "Service '{}' has no instances",
                    service
                )));
            }
        }

        Ok(())
    }

    /// Create a default configuration for testing
    pub fn default_config() -> Self {
        Self {
            server: ServerConfig::default(),
            limiter: LimiterConfig::default(),
            policy: PolicyConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}
