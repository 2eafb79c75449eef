use log::warn;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ForwarderError, Result};
use crate::store::ConfigStore;
use crate::transport::http::BatchPolicy;

/// Configuration keys understood by the forwarder
pub mod keys {
    pub const ENABLED: &str = "influxdb_enabled";
    pub const MEASUREMENT: &str = "influxdb_measurement";
    pub const UDP: &str = "influxdb_udp";
    pub const UDP_LOCAL_IP: &str = "influxdb_udp_local_ip";
    pub const UDP_LOCAL_PORT: &str = "influxdb_udp_local_port";
    pub const UDP_TARGET_IP: &str = "influxdb_udp_target_ip";
    pub const UDP_TARGET_PORT: &str = "influxdb_udp_target_port";
    pub const HTTP_TARGET_IP: &str = "influxdb_http_target_ip";
    pub const HTTP_TARGET_PORT: &str = "influxdb_http_target_port";
    pub const HTTP_RETENTION_POLICY: &str = "influxdb_http_retention_policy";
    pub const USERNAME: &str = "influxdb_id";
    pub const PASSWORD: &str = "influxdb_password";
    pub const DATABASE: &str = "influxdb_db_name";
    pub const BATCH_SIZE: &str = "influxdb_batch_size";
    pub const BATCH_INTERVAL_MS: &str = "influxdb_batch_interval_ms";
    pub const QUEUE_CAPACITY: &str = "influxdb_queue_capacity";
    pub const HTTP_TIMEOUT_MS: &str = "influxdb_http_timeout_ms";
    pub const TRACE: &str = "trace";
}

/// Default values for every key
pub mod defaults {
    pub const ENABLED: bool = true;
    pub const MEASUREMENT: &str = "counter";
    pub const UDP: bool = true;
    pub const UDP_LOCAL_PORT: u16 = 0;
    pub const UDP_TARGET_IP: &str = "127.0.0.1";
    pub const UDP_TARGET_PORT: u16 = 8089;
    pub const HTTP_TARGET_IP: &str = "127.0.0.1";
    pub const HTTP_TARGET_PORT: u16 = 8086;
    pub const RETENTION_POLICY: &str = "autogen";
    pub const USERNAME: &str = "root";
    pub const PASSWORD: &str = "root";
    pub const DATABASE: &str = "scouterCounter";
    pub const BATCH_SIZE: u64 = 200;
    pub const BATCH_INTERVAL_MS: u64 = 200;
    pub const QUEUE_CAPACITY: u64 = 10_000;
    pub const HTTP_TIMEOUT_MS: u64 = 10_000;
}

/// Which transport carries points to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Udp,
    Http,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Udp => f.write_str("UDP"),
            TransportMode::Http => f.write_str("HTTP"),
        }
    }
}

/// A host and port pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first socket address of the host
    pub fn resolve(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| ForwarderError::transport(&format!("Cannot resolve {}", self), e))?
            .next()
            .ok_or_else(|| ForwarderError::Transport(format!("No address found for {}", self)))
    }

    /// Base URL of an HTTP service listening on this endpoint
    pub fn http_url(&self) -> String {
        format!("http://{}", self)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Optional local address for the datagram socket
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LocalBind {
    /// Local IP or host name; the wildcard address when unset
    pub ip: Option<String>,
    /// Local port; 0 lets the OS choose
    pub port: u16,
}

impl LocalBind {
    /// Address to bind, matching the address family of the target
    pub fn socket_addr(&self, target: &SocketAddr) -> Result<SocketAddr> {
        match &self.ip {
            Some(ip) => match ip.parse::<IpAddr>() {
                Ok(addr) => Ok(SocketAddr::new(addr, self.port)),
                Err(_) => Endpoint::new(ip.clone(), self.port).resolve(),
            },
            None => {
                let wildcard = if target.is_ipv6() {
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                };
                Ok(SocketAddr::new(wildcard, self.port))
            }
        }
    }
}

/// Database account
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Everything the HTTP transport needs to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub endpoint: Endpoint,
    pub credentials: Credentials,
    /// Database created on connect
    pub database: String,
}

/// Snapshot of the forwarding configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Master on/off switch
    pub enabled: bool,
    /// Measurement every point is written to
    pub measurement: String,
    pub mode: TransportMode,
    pub udp_local: LocalBind,
    pub udp_target: Endpoint,
    pub http_target: Endpoint,
    pub credentials: Credentials,
    pub database: String,
    pub retention_policy: String,
    /// Log full error details for failed samples
    pub trace: bool,
}

impl TransportConfig {
    /// Read every recognised key from the store, falling back to defaults
    pub fn from_store(store: &dyn ConfigStore) -> Self {
        let mode = if store.get_bool(keys::UDP, defaults::UDP) {
            TransportMode::Udp
        } else {
            TransportMode::Http
        };

        Self {
            enabled: store.get_bool(keys::ENABLED, defaults::ENABLED),
            measurement: store.get_string(keys::MEASUREMENT, defaults::MEASUREMENT),
            mode,
            udp_local: LocalBind {
                ip: store.get_opt_string(keys::UDP_LOCAL_IP),
                port: store.get_u16(keys::UDP_LOCAL_PORT, defaults::UDP_LOCAL_PORT),
            },
            udp_target: Endpoint::new(
                store.get_string(keys::UDP_TARGET_IP, defaults::UDP_TARGET_IP),
                store.get_u16(keys::UDP_TARGET_PORT, defaults::UDP_TARGET_PORT),
            ),
            http_target: Endpoint::new(
                store.get_string(keys::HTTP_TARGET_IP, defaults::HTTP_TARGET_IP),
                store.get_u16(keys::HTTP_TARGET_PORT, defaults::HTTP_TARGET_PORT),
            ),
            credentials: Credentials {
                username: store.get_string(keys::USERNAME, defaults::USERNAME),
                password: store.get_string(keys::PASSWORD, defaults::PASSWORD),
            },
            database: store.get_string(keys::DATABASE, defaults::DATABASE),
            retention_policy: store
                .get_string(keys::HTTP_RETENTION_POLICY, defaults::RETENTION_POLICY),
            trace: store.get_bool(keys::TRACE, false),
        }
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            endpoint: self.http_target.clone(),
            credentials: self.credentials.clone(),
            database: self.database.clone(),
        }
    }
}

/// Read the batching policy of the HTTP transport (applied at startup only)
pub fn batch_policy_from_store(store: &dyn ConfigStore) -> BatchPolicy {
    let mut max_points = store.get_u64(keys::BATCH_SIZE, defaults::BATCH_SIZE) as usize;
    if max_points == 0 {
        warn!("Config error: {} must be positive, using {}", keys::BATCH_SIZE, defaults::BATCH_SIZE);
        max_points = defaults::BATCH_SIZE as usize;
    }
    let mut interval_ms = store.get_u64(keys::BATCH_INTERVAL_MS, defaults::BATCH_INTERVAL_MS);
    if interval_ms == 0 {
        warn!(
            "Config error: {} must be positive, using {}",
            keys::BATCH_INTERVAL_MS,
            defaults::BATCH_INTERVAL_MS
        );
        interval_ms = defaults::BATCH_INTERVAL_MS;
    }

    BatchPolicy {
        max_points,
        max_wait: Duration::from_millis(interval_ms),
        queue_capacity: (store.get_u64(keys::QUEUE_CAPACITY, defaults::QUEUE_CAPACITY) as usize)
            .max(max_points),
    }
}

/// HTTP client timeout (applied at startup only)
pub fn http_timeout_from_store(store: &dyn ConfigStore) -> Duration {
    Duration::from_millis(store.get_u64(keys::HTTP_TIMEOUT_MS, defaults::HTTP_TIMEOUT_MS))
}

/// Logging level
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl FromStr for LogLevel {
    type Err = ForwarderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(ForwarderError::Config(format!("Unknown log level: {}", other))),
        }
    }
}
