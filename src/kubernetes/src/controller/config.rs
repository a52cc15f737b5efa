use std::fs;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, Error};

pub const DEFAULT_WEBHOOK_PORT: u16 = 443;
pub const DEFAULT_METRICS_ADDR: &str = ":50052";
pub const DEFAULT_READINESS_ADDR: &str = "0";
pub const DEFAULT_KEEPALIVED_HTTP_PORT: u16 = 8080;
pub const DEFAULT_SPEAKER_ENDPOINT: &str = "127.0.0.1:50051";
pub const DEFAULT_SPEAKER_TIMEOUT: u64 = 10;
pub const DEFAULT_REQUEUE_INTERVAL: u64 = 30;
pub const DEFAULT_IP_STRATEGY: &str = "default";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub webhook_port: u16,
    pub metrics_addr: String,
    pub readiness_addr: String,
    pub keepalived_http_port: u16,
    pub speaker_endpoint: String,
    pub speaker_timeout: u64,
    pub requeue_interval: u64,
    pub ip_strategy: String,
    pub port_forward: Option<PortForward>,
}

/// Settings of port-forward mode. The local speaker listens on
/// `local_bgp_port` and BGP traffic from `router_addr` is redirected to it.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub router_addr: String,
    pub local_bgp_port: u16,
    pub local_addr: Option<String>,
}

impl Config {
    pub fn load(file: &str) -> Result<Self, Error> {
        let contents = fs::read_to_string(file).map_err(Error::StdIo)?;
        serde_yaml::from_str(&contents).map_err(|_| Error::Config(ConfigError::FailedToLoad))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_port: DEFAULT_WEBHOOK_PORT,
            metrics_addr: DEFAULT_METRICS_ADDR.to_string(),
            readiness_addr: DEFAULT_READINESS_ADDR.to_string(),
            keepalived_http_port: DEFAULT_KEEPALIVED_HTTP_PORT,
            speaker_endpoint: DEFAULT_SPEAKER_ENDPOINT.to_string(),
            speaker_timeout: DEFAULT_SPEAKER_TIMEOUT,
            requeue_interval: DEFAULT_REQUEUE_INTERVAL,
            ip_strategy: DEFAULT_IP_STRATEGY.to_string(),
            port_forward: None,
        }
    }
}

/// Turns a listen address in `host:port` or `:port` form into something
/// `HttpServer::bind` accepts. `0` and the empty string disable the listener.
pub fn bind_addr(addr: &str) -> Result<Option<String>, Error> {
    let addr = addr.trim();
    if addr.is_empty() || addr == "0" {
        return Ok(None);
    }
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(ConfigError::InvalidArgument(addr.to_string())))?;
    port.parse::<u16>()
        .map_err(|_| Error::Config(ConfigError::InvalidArgument(addr.to_string())))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(Some(format!("{host}:{port}")))
}
