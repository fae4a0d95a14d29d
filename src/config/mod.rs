//! Configuration management

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mux::UdpResolver;
use crate::pool::SessionPool;
use crate::server::Server;
use crate::transport::TcpCarrierDialer;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Accepted credentials (username to password); empty accepts anyone
    #[serde(default)]
    pub auth: HashMap<String, String>,
    /// Upstream DNS server answering tunneled queries, e.g. "8.8.8.8:53"
    pub dns_server: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8899".to_string(),
            auth: HashMap::new(),
            dns_server: None,
        }
    }
}

impl ServerConfig {
    /// Build the server this section describes.
    pub fn build_server(&self) -> Result<Server, crate::Error> {
        let mut server = Server::new(self.auth.clone());
        if let Some(dns) = &self.dns_server {
            let addr = dns.parse().map_err(|_| {
                crate::Error::Config(format!("invalid dns server address: {}", dns))
            })?;
            server = server.with_resolver(Arc::new(UdpResolver::new(addr)));
        }
        Ok(server)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Upstream tunnel servers
    pub servers: Vec<UpstreamConfig>,
    /// Sessions kept open proactively
    #[serde(default = "default_min_sess")]
    pub min_sess: usize,
    /// Streams per session before opening another
    #[serde(default = "default_max_conn")]
    pub max_conn: usize,
}

fn default_min_sess() -> usize {
    1
}

fn default_max_conn() -> usize {
    16
}

/// One upstream tunnel endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Server address, host:port
    pub address: String,
    pub username: String,
    pub password: String,
}

impl ClientConfig {
    /// Build the session pool this section describes.
    pub fn build_pool(&self) -> SessionPool {
        let pool = SessionPool::new(self.min_sess, self.max_conn);
        for upstream in &self.servers {
            pool.add_session_factory(
                Arc::new(TcpCarrierDialer),
                &upstream.address,
                &upstream.username,
                &upstream.password,
            );
        }
        pool
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
