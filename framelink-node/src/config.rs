//! Configuration for the echo node.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use framelink_core::LinkConfig;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Connection and request tuning, shared by `serve` and `call`.
    pub link: LinkConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind in `serve` mode.
    pub listen_addr: String,
    /// TCP port to listen on in `serve` mode.
    pub listen_port: u16,
    /// Default peer for `call` mode.
    pub connect: String,
    /// Maximum concurrent sessions; further sockets are closed on accept.
    pub max_connections: usize,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".into(),
            listen_port: 7400,
            connect: "127.0.0.1:7400".into(),
            max_connections: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// The socket address `serve` binds.
    pub fn listen_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.network.listen_addr, self.network.listen_port).parse()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        assert!(text.contains("listen_port"));
        assert!(text.contains("max_read_chunk"));
        assert!(text.contains("request_timeout_ms"));
    }

    #[test]
    fn roundtrip_config() {
        let text = toml::to_string_pretty(&NodeConfig::default()).unwrap();
        let parsed: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.listen_port, 7400);
        assert_eq!(parsed.link.stall_threshold_ms, 3000);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: NodeConfig = toml::from_str("[link]\nbuffer_capacity = 80\n").unwrap();
        assert_eq!(parsed.link.buffer_capacity, 80);
        assert_eq!(parsed.link.max_read_chunk, 64 * 1024);
        assert_eq!(parsed.logging.level, "info");
    }

    #[test]
    fn listen_addr_combines_host_and_port() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.listen_addr().unwrap(), "0.0.0.0:7400".parse().unwrap());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = NodeConfig::load(Path::new("/nonexistent/framelink-node.toml"));
        assert_eq!(cfg.network.listen_port, 7400);
    }

    #[test]
    fn written_default_loads_back() {
        let path = std::env::temp_dir().join(format!("framelink-node-{}.toml", std::process::id()));
        NodeConfig::write_default(&path).unwrap();
        let cfg = NodeConfig::load(&path);
        std::fs::remove_file(&path).unwrap();
        assert_eq!(cfg.network.listen_port, 7400);
        assert_eq!(cfg.link.request_timeout_ms, LinkConfig::default().request_timeout_ms);
    }
}
