//! Configuration handling for the link binary.
//!
//! Values come from the YAML config file first, then environment variables,
//! then command-line flags (applied in `main`).

use anyhow::{anyhow, Context, Result};
use link_session::{RelayConfig, SessionConfig, RELAY_PORT};
use link_wire::DEFAULT_MAX_CONTENT_LENGTH;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Link binary configuration
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Relay host clients connect to
    pub relay_host: String,
    /// Relay port; also the port the relay listens on
    pub relay_port: u16,
    /// Timeout for requests sent by the client
    pub request_timeout: Duration,
    /// Time allowed for the relay to assign a peer ID
    pub handshake_timeout: Duration,
    /// Period of the update loop
    pub tick_interval: Duration,
    /// Largest accepted message body
    pub max_content_length: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            relay_host: "127.0.0.1".to_string(),
            relay_port: RELAY_PORT,
            request_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(10),
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    link: Option<FileConfig>,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    relay: Option<RelaySection>,
    request_timeout: Option<String>,
    handshake_timeout: Option<String>,
    tick_interval: Option<String>,
    max_content_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RelaySection {
    host: Option<String>,
    port: Option<u16>,
}

impl LinkConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file falls back to defaults; a file that exists but does not
    /// parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();
        let path = config_path.as_ref();

        match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                if let Some(file) = root.link {
                    config.apply_file_config(file)?;
                }
                info!("Loaded configuration from {:?}", path);
            }
            Err(_) => warn!("Config file {:?} not found, using defaults", path),
        }

        config.apply_environment_overrides();

        info!(
            "Final link configuration: relay={}:{}, request_timeout={:?}",
            config.relay_host, config.relay_port, config.request_timeout
        );
        Ok(config)
    }

    fn apply_file_config(&mut self, file: FileConfig) -> Result<()> {
        if let Some(relay) = file.relay {
            if let Some(host) = relay.host {
                self.relay_host = host;
            }
            if let Some(port) = relay.port {
                self.relay_port = port;
            }
        }
        if let Some(value) = file.request_timeout {
            self.request_timeout = parse_duration("request_timeout", &value)?;
        }
        if let Some(value) = file.handshake_timeout {
            self.handshake_timeout = parse_duration("handshake_timeout", &value)?;
        }
        if let Some(value) = file.tick_interval {
            self.tick_interval = parse_duration("tick_interval", &value)?;
        }
        if let Some(max) = file.max_content_length {
            self.max_content_length = max;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_environment_overrides(&mut self) {
        if let Ok(host) = std::env::var("LINK_RELAY_HOST") {
            info!("Relay host overridden by environment: {}", host);
            self.relay_host = host;
        }

        if let Ok(port) = std::env::var("LINK_RELAY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    self.relay_port = port;
                    info!("Relay port overridden by environment: {}", port);
                }
                Err(_) => warn!("Ignoring invalid LINK_RELAY_PORT {:?}", port),
            }
        }

        if let Ok(timeout) = std::env::var("LINK_REQUEST_TIMEOUT") {
            match humantime::parse_duration(&timeout) {
                Ok(timeout) => {
                    self.request_timeout = timeout;
                    info!("Request timeout overridden by environment: {:?}", timeout);
                }
                Err(_) => warn!("Ignoring invalid LINK_REQUEST_TIMEOUT {:?}", timeout),
            }
        }
    }

    /// Resolve the relay address
    pub fn relay_addr(&self) -> Result<SocketAddr> {
        (self.relay_host.as_str(), self.relay_port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve relay host {}", self.relay_host))?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| anyhow!("relay host {} has no IPv4 address", self.relay_host))
    }

    /// Settings for a session manager
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            relay_addr: self.relay_addr()?,
            handshake_timeout: self.handshake_timeout,
            default_request_timeout: self.request_timeout,
            max_content_length: self.max_content_length,
            ..SessionConfig::default()
        })
    }

    /// Settings for a relay
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen_port: self.relay_port,
            max_content_length: self.max_content_length,
            ..RelayConfig::default()
        }
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid duration for {}: {:?}", key, value))
}
