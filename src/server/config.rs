//! Gateway configuration.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dialer::DialerConfig;
use crate::fragment::FragmentConfig;
use crate::resolve::HostsMap;
use crate::transport::TransportConfig;
use crate::tunnel::RegistryConfig;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// SOCKS listen address
    pub bind_address: SocketAddr,
    /// Address UDP relay sockets bind on
    pub udp_bind_address: IpAddr,
    /// `https://` DoH endpoint or `host:port` DNS server
    pub remote_dns_addr: String,
    /// Lifetime of cached resolutions
    pub dns_cache_ttl: Duration,
    /// Static hostname overrides
    pub hosts: HostsMap,
    /// Outbound connection settings
    pub dialer: DialerConfig,
    /// Client Hello chunking
    pub fragment: FragmentConfig,
    /// Chunk the DoH client's own TLS handshakes
    pub enable_dns_fragmentation: bool,
    /// Use the remote worker at all
    pub worker_enabled: bool,
    /// Worker only unblocks DNS; traffic still goes direct
    pub worker_dns_only: bool,
    /// `wss://` URL of the worker
    pub worker_address: String,
    /// Connect here instead of resolving the worker host
    pub worker_ip_port_address: Option<SocketAddr>,
    /// Chunk the worker connection's Client Hello
    pub worker_fragmentation: bool,
    /// Tunnel timing
    pub registry: RegistryConfig,
    /// Copy idle policy
    pub transport: TransportConfig,
    /// Install Ctrl-C / SIGTERM handling in the binary
    pub capture_ctrl_c: bool,
}

impl ServerConfig {
    /// Whether requests are carried through worker tunnels.
    pub fn relay_enabled(&self) -> bool {
        self.worker_enabled && !self.worker_dns_only
    }

    /// Chunking applied to DoH connections, if any.
    pub fn dns_fragment(&self) -> Option<FragmentConfig> {
        let enabled =
            (self.worker_enabled && self.worker_dns_only) || self.enable_dns_fragmentation;
        enabled.then_some(self.fragment)
    }

    /// Chunking applied to the worker connection, if any.
    pub fn worker_fragment(&self) -> Option<FragmentConfig> {
        self.worker_fragmentation.then_some(self.fragment)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.remote_dns_addr.is_empty() {
            return Err("remote_dns_addr cannot be empty".into());
        }
        if self.dns_cache_ttl.is_zero() {
            return Err("dns_cache_ttl_secs must be positive".into());
        }
        if self.dialer.connect_timeout.is_zero() {
            return Err("dial_timeout_secs must be positive".into());
        }
        if self.dialer.tls_record_split == Some(0) {
            return Err("tls_record_split_size must be positive".into());
        }
        if self.worker_enabled && self.worker_address.is_empty() {
            return Err("worker_address is required when the worker is enabled".into());
        }
        if self.worker_enabled && !self.worker_address.contains("://") {
            return Err("worker_address must be a ws:// or wss:// URL".into());
        }
        if self.registry.link_idle_timeout.is_zero() || self.transport.tcp_idle_timeout.is_zero() {
            return Err("idle timeouts must be positive".into());
        }
        if self.registry.read_timeout.is_zero() || self.registry.write_timeout.is_zero() {
            return Err("udp_read_timeout_secs and udp_write_timeout_secs must be positive".into());
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:8085".into()
}

fn default_udp_bind_address() -> String {
    "0.0.0.0".into()
}

fn default_remote_dns_addr() -> String {
    "https://1.1.1.1/dns-query".into()
}

fn default_dns_cache_ttl() -> u64 {
    30
}

fn default_tls_record_split_size() -> usize {
    64
}

fn default_sni_chunks() -> i64 {
    10
}

fn default_chunks_after_sni() -> i64 {
    20
}

fn default_delay_ms() -> u64 {
    5
}

fn default_udp_timeout() -> u64 {
    120
}

fn default_tcp_idle() -> u64 {
    300
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// Configuration file format for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// SOCKS listen address (`ip:port`)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// UDP relay bind address (IP only)
    #[serde(default = "default_udp_bind_address")]
    pub udp_bind_address: String,
    /// Resolver endpoint
    #[serde(default = "default_remote_dns_addr")]
    pub remote_dns_addr: String,
    /// Resolution cache TTL (seconds)
    #[serde(default = "default_dns_cache_ttl")]
    pub dns_cache_ttl_secs: u64,
    /// Tune outbound sockets
    #[serde(default)]
    pub enable_low_level_sockets: bool,
    /// Split Client Hellos into several TLS records
    #[serde(default)]
    pub tls_record_split_enabled: bool,
    /// Maximum TLS record payload when splitting
    #[serde(default = "default_tls_record_split_size")]
    pub tls_record_split_size: usize,
    /// Chunk length before the SNI (<= 0 disables)
    #[serde(default = "default_sni_chunks")]
    pub sni_chunks_length: i64,
    /// Chunk length from the SNI on (<= 0 disables)
    #[serde(default = "default_chunks_after_sni")]
    pub chunks_length_after_sni: i64,
    /// Pause between chunks (milliseconds)
    #[serde(default = "default_delay_ms")]
    pub delay_between_chunks_ms: u64,
    /// Chunk DoH handshakes
    #[serde(default)]
    pub enable_dns_fragmentation: bool,
    /// Use the remote worker
    #[serde(default)]
    pub worker_enabled: bool,
    /// Worker for DNS only
    #[serde(default)]
    pub worker_dns_only: bool,
    /// Worker URL
    #[serde(default)]
    pub worker_address: String,
    /// Worker `ip:port` override
    #[serde(default)]
    pub worker_ip_port_address: String,
    /// Chunk the worker handshake
    #[serde(default)]
    pub worker_fragmentation: bool,
    /// Worker read deadline (seconds)
    #[serde(default = "default_udp_timeout")]
    pub udp_read_timeout_secs: u64,
    /// Worker write deadline (seconds)
    #[serde(default = "default_udp_timeout")]
    pub udp_write_timeout_secs: u64,
    /// Tunnel and UDP association idle timeout (seconds)
    #[serde(default = "default_udp_timeout")]
    pub udp_link_idle_timeout_secs: u64,
    /// TCP copy idle timeout (seconds)
    #[serde(default = "default_tcp_idle")]
    pub tcp_idle_timeout_secs: u64,
    /// Outbound connect timeout (seconds)
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Handle Ctrl-C / SIGTERM
    #[serde(default = "default_true")]
    pub capture_ctrl_c: bool,
    /// Static hostname overrides
    #[serde(default)]
    pub hosts: BTreeMap<String, Vec<IpAddr>>,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            udp_bind_address: default_udp_bind_address(),
            remote_dns_addr: default_remote_dns_addr(),
            dns_cache_ttl_secs: default_dns_cache_ttl(),
            enable_low_level_sockets: false,
            tls_record_split_enabled: false,
            tls_record_split_size: default_tls_record_split_size(),
            sni_chunks_length: default_sni_chunks(),
            chunks_length_after_sni: default_chunks_after_sni(),
            delay_between_chunks_ms: default_delay_ms(),
            enable_dns_fragmentation: false,
            worker_enabled: false,
            worker_dns_only: false,
            worker_address: String::new(),
            worker_ip_port_address: String::new(),
            worker_fragmentation: false,
            udp_read_timeout_secs: default_udp_timeout(),
            udp_write_timeout_secs: default_udp_timeout(),
            udp_link_idle_timeout_secs: default_udp_timeout(),
            tcp_idle_timeout_secs: default_tcp_idle(),
            dial_timeout_secs: default_dial_timeout(),
            capture_ctrl_c: true,
            hosts: BTreeMap::new(),
        }
    }
}

impl ServerConfigFile {
    /// Read a TOML file, or JSON when the extension is `.json`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, String> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("Cannot read {}: {}", path.display(), e))?;

        if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&text).map_err(|e| format!("Invalid JSON config: {}", e))
        } else {
            toml::from_str(&text).map_err(|e| format!("Invalid TOML config: {}", e))
        }
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig, String> {
        let bind_address = self
            .bind_address
            .parse()
            .map_err(|e| format!("Invalid bind_address {}: {}", self.bind_address, e))?;
        let udp_bind_address = self
            .udp_bind_address
            .parse()
            .map_err(|e| format!("Invalid udp_bind_address {}: {}", self.udp_bind_address, e))?;
        let worker_ip_port_address = if self.worker_ip_port_address.is_empty() {
            None
        } else {
            Some(self.worker_ip_port_address.parse().map_err(|e| {
                format!(
                    "Invalid worker_ip_port_address {}: {}",
                    self.worker_ip_port_address, e
                )
            })?)
        };

        let hosts: HostsMap = self
            .hosts
            .iter()
            .map(|(host, addrs)| (host.to_ascii_lowercase(), addrs.clone()))
            .collect();

        let config = ServerConfig {
            bind_address,
            udp_bind_address,
            remote_dns_addr: self.remote_dns_addr.clone(),
            dns_cache_ttl: Duration::from_secs(self.dns_cache_ttl_secs),
            hosts,
            dialer: DialerConfig {
                connect_timeout: Duration::from_secs(self.dial_timeout_secs),
                low_level_sockets: self.enable_low_level_sockets,
                tls_record_split: self
                    .tls_record_split_enabled
                    .then_some(self.tls_record_split_size),
            },
            fragment: FragmentConfig::new(
                self.sni_chunks_length,
                self.chunks_length_after_sni,
                Duration::from_millis(self.delay_between_chunks_ms),
            ),
            enable_dns_fragmentation: self.enable_dns_fragmentation,
            worker_enabled: self.worker_enabled,
            worker_dns_only: self.worker_dns_only,
            worker_address: self.worker_address.clone(),
            worker_ip_port_address,
            worker_fragmentation: self.worker_fragmentation,
            registry: RegistryConfig {
                read_timeout: Duration::from_secs(self.udp_read_timeout_secs),
                write_timeout: Duration::from_secs(self.udp_write_timeout_secs),
                link_idle_timeout: Duration::from_secs(self.udp_link_idle_timeout_secs),
            },
            transport: TransportConfig {
                tcp_idle_timeout: Duration::from_secs(self.tcp_idle_timeout_secs),
                udp_link_idle_timeout: Duration::from_secs(self.udp_link_idle_timeout_secs),
            },
            capture_ctrl_c: self.capture_ctrl_c,
        };

        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            bind_address: config.bind_address.to_string(),
            udp_bind_address: config.udp_bind_address.to_string(),
            remote_dns_addr: config.remote_dns_addr.clone(),
            dns_cache_ttl_secs: config.dns_cache_ttl.as_secs(),
            enable_low_level_sockets: config.dialer.low_level_sockets,
            tls_record_split_enabled: config.dialer.tls_record_split.is_some(),
            tls_record_split_size: config
                .dialer
                .tls_record_split
                .unwrap_or_else(default_tls_record_split_size),
            sni_chunks_length: config.fragment.before_sni as i64,
            chunks_length_after_sni: config.fragment.after_sni as i64,
            delay_between_chunks_ms: config.fragment.delay.as_millis() as u64,
            enable_dns_fragmentation: config.enable_dns_fragmentation,
            worker_enabled: config.worker_enabled,
            worker_dns_only: config.worker_dns_only,
            worker_address: config.worker_address.clone(),
            worker_ip_port_address: config
                .worker_ip_port_address
                .map(|a| a.to_string())
                .unwrap_or_default(),
            worker_fragmentation: config.worker_fragmentation,
            udp_read_timeout_secs: config.registry.read_timeout.as_secs(),
            udp_write_timeout_secs: config.registry.write_timeout.as_secs(),
            udp_link_idle_timeout_secs: config.registry.link_idle_timeout.as_secs(),
            tcp_idle_timeout_secs: config.transport.tcp_idle_timeout.as_secs(),
            dial_timeout_secs: config.dialer.connect_timeout.as_secs(),
            capture_ctrl_c: config.capture_ctrl_c,
            hosts: config
                .hosts
                .iter()
                .map(|(host, addrs)| (host.clone(), addrs.clone()))
                .collect(),
        }
    }
}
