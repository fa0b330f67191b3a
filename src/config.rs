//! WolfRegistry Configuration
//!
//! This module provides configuration structures for a WolfRegistry node
//! and its Distro replication layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::distro::codec::WireFormat;

/// Main WolfRegistry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Distro replication configuration
    #[serde(default)]
    pub distro: DistroConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Cluster address of this node (host:port). This is the member identity.
    pub address: String,

    /// Address to bind the cluster RPC listener (defaults to `address`)
    #[serde(default)]
    pub bind_address: Option<String>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Initial member addresses (may include this node)
    #[serde(default)]
    pub members: Vec<String>,

    /// Offset added to a member's cluster port to reach its HTTP API
    #[serde(default = "default_http_port_offset")]
    pub http_port_offset: u16,

    /// Cluster client heartbeat interval in milliseconds
    #[serde(default = "default_beat_interval_ms")]
    pub beat_interval_ms: u64,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Which network binding carries Distro traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Blocking request/response over HTTP
    Http,
    /// Callback-capable framed TCP through the cluster connection manager
    Rpc,
}

/// Distro replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistroConfig {
    /// Transport binding
    #[serde(default = "default_transport")]
    pub transport: TransportKind,

    /// Wire format for key -> record maps
    #[serde(default = "default_wire_format")]
    pub wire_format: WireFormat,

    /// LZ4-compress encoded payloads
    #[serde(default)]
    pub compression: bool,

    /// Timeout for push, verify and pull calls in milliseconds
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// Timeout for snapshot pulls in milliseconds
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,

    /// Interval between verify rounds in milliseconds
    #[serde(default = "default_verify_interval_ms")]
    pub verify_interval_ms: u64,

    /// Delay before retrying a failed cold-start snapshot load in milliseconds
    #[serde(default = "default_load_retry_delay_ms")]
    pub load_retry_delay_ms: u64,

    /// Clock-skew bound for conflict resolution in milliseconds
    #[serde(default = "default_max_time_difference_ms")]
    pub max_time_difference_ms: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address (defaults to the node host at port + http_port_offset)
    #[serde(default)]
    pub bind_address: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_http_port_offset() -> u16 {
    1000
}

fn default_beat_interval_ms() -> u64 {
    3000
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_transport() -> TransportKind {
    TransportKind::Rpc
}

fn default_wire_format() -> WireFormat {
    WireFormat::Bincode
}

fn default_sync_timeout_ms() -> u64 {
    3000
}

fn default_snapshot_timeout_ms() -> u64 {
    30000
}

fn default_verify_interval_ms() -> u64 {
    5000
}

fn default_load_retry_delay_ms() -> u64 {
    30000
}

fn default_max_time_difference_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: Vec::new(),
            http_port_offset: default_http_port_offset(),
            beat_interval_ms: default_beat_interval_ms(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            wire_format: default_wire_format(),
            compression: false,
            sync_timeout_ms: default_sync_timeout_ms(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
            verify_interval_ms: default_verify_interval_ms(),
            load_retry_delay_ms: default_load_retry_delay_ms(),
            max_time_difference_ms: default_max_time_difference_ms(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: None,
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

impl DistroConfig {
    /// Get sync timeout as Duration
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Get snapshot timeout as Duration
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }

    /// Get verify interval as Duration
    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    /// Get load retry delay as Duration
    pub fn load_retry_delay(&self) -> Duration {
        Duration::from_millis(self.load_retry_delay_ms)
    }
}

impl ClusterConfig {
    /// Get heartbeat interval as Duration
    pub fn beat_interval(&self) -> Duration {
        Duration::from_millis(self.beat_interval_ms)
    }

    /// Get reconnect interval as Duration
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RegistryConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: RegistryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.address.is_empty() {
            return Err(crate::Error::Config("node.address cannot be empty".into()));
        }

        if split_host_port(&self.node.address).is_none() {
            return Err(crate::Error::Config(format!(
                "node.address must be host:port, got {}",
                self.node.address
            )));
        }

        for member in &self.cluster.members {
            if split_host_port(member).is_none() {
                return Err(crate::Error::Config(format!(
                    "cluster.members entry must be host:port, got {}",
                    member
                )));
            }
        }

        if self.distro.snapshot_timeout_ms < self.distro.sync_timeout_ms {
            return Err(crate::Error::Config(
                "distro.snapshot_timeout_ms must not be shorter than distro.sync_timeout_ms".into(),
            ));
        }

        if self.distro.transport == TransportKind::Http && !self.api.enabled {
            return Err(crate::Error::Config(
                "distro.transport = \"http\" requires api.enabled".into(),
            ));
        }

        Ok(())
    }

    /// Address the cluster RPC listener binds to
    pub fn bind_address(&self) -> &str {
        self.node
            .bind_address
            .as_deref()
            .unwrap_or(&self.node.address)
    }

    /// Address the HTTP API binds to
    pub fn api_bind_address(&self) -> String {
        match &self.api.bind_address {
            Some(addr) => addr.clone(),
            None => http_address(&self.node.address, self.cluster.http_port_offset)
                .unwrap_or_else(|| "0.0.0.0:8848".to_string()),
        }
    }

    /// Initial member list with this node included
    pub fn initial_members(&self) -> Vec<String> {
        let mut members = self.cluster.members.clone();
        if !members.contains(&self.node.address) {
            members.push(self.node.address.clone());
        }
        members.sort();
        members.dedup();
        members
    }
}

/// Split a `host:port` string
pub fn split_host_port(address: &str) -> Option<(&str, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    port.parse().ok().map(|p| (host, p))
}

/// Derive the HTTP API address of a member from its cluster address
pub fn http_address(address: &str, offset: u16) -> Option<String> {
    let (host, port) = split_host_port(address)?;
    let http_port = port.checked_add(offset)?;
    Some(format!("{}:{}", host, http_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
address = "10.0.0.1:7848"

[cluster]
members = ["10.0.0.2:7848", "10.0.0.3:7848"]

[distro]
transport = "http"
wire_format = "json"
max_time_difference_ms = 10
"#;

        let config = RegistryConfig::from_str(toml).unwrap();
        assert_eq!(config.node.address, "10.0.0.1:7848");
        assert_eq!(config.distro.transport, TransportKind::Http);
        assert_eq!(config.distro.wire_format, WireFormat::Json);
        assert_eq!(config.distro.max_time_difference_ms, 10);
        assert_eq!(config.initial_members().len(), 3);
        assert_eq!(config.api_bind_address(), "10.0.0.1:8848");
        assert_eq!(config.bind_address(), "10.0.0.1:7848");
    }

    #[test]
    fn test_defaults() {
        let config = RegistryConfig::from_str("[node]\naddress = \"127.0.0.1:7848\"\n").unwrap();
        assert_eq!(config.distro.transport, TransportKind::Rpc);
        assert!(config.distro.snapshot_timeout() > config.distro.sync_timeout());
        assert_eq!(config.initial_members(), vec!["127.0.0.1:7848".to_string()]);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let result = RegistryConfig::from_str("[node]\naddress = \"no-port\"\n");
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_http_transport_needs_api() {
        let toml = r#"
[node]
address = "127.0.0.1:7848"

[distro]
transport = "http"

[api]
enabled = false
"#;
        assert!(matches!(
            RegistryConfig::from_str(toml),
            Err(crate::Error::Config(_))
        ));
    }

    #[test]
    fn test_snapshot_timeout_must_exceed_sync_timeout() {
        let toml = r#"
[node]
address = "127.0.0.1:7848"

[distro]
sync_timeout_ms = 5000
snapshot_timeout_ms = 1000
"#;
        assert!(RegistryConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\naddress = \"127.0.0.1:7848\"").unwrap();
        let config = RegistryConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.address, "127.0.0.1:7848");
    }

    #[test]
    fn test_http_address() {
        assert_eq!(http_address("10.0.0.1:7848", 1000).as_deref(), Some("10.0.0.1:8848"));
        assert_eq!(http_address("10.0.0.1:65000", 1000), None);
        assert_eq!(http_address("bogus", 1000), None);
    }
}
