use crate::error::ProxyError;
use crate::relay::RelayOptions;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

pub const DEFAULT_TARGET: &str = "http://127.0.0.1:8551";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_METRICS_PORT: u16 = 9092;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
    #[serde(default)]
    pub format: Option<LogFormat>,
    /// Colored text output. Ignored for json.
    #[serde(default)]
    pub color: Option<bool>,
}

fn default_target() -> String {
    DEFAULT_TARGET.to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

fn default_stream_path_prefixes() -> Vec<String> {
    vec!["/eth/v1/events".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upstream base URL. Request paths are appended to it verbatim.
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Initial deadline of every call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Deadline extension granted per relayed event. Defaults to the call timeout.
    #[serde(default)]
    pub stream_extension_secs: Option<u64>,
    /// Prometheus endpoint port, 0 disables it.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    /// Paths treated as event streams even without a `text/event-stream` content type.
    #[serde(default = "default_stream_path_prefixes")]
    pub stream_path_prefixes: Vec<String>,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: default_target(),
            bind_address: default_bind_address(),
            port: DEFAULT_PORT,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            stream_extension_secs: None,
            metrics_port: DEFAULT_METRICS_PORT,
            stream_path_prefixes: default_stream_path_prefixes(),
            private_key: None,
            certificate: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("cannot read {}: {}", path, e)))?;
        serde_json::from_str(&content).map_err(|e| ProxyError::Config(format!("invalid config {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("cannot serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Metrics listener on the same interface as the proxy, if enabled.
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        (self.metrics_port != 0).then(|| SocketAddr::new(self.bind_address, self.metrics_port))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn stream_extension(&self) -> Duration {
        self.stream_extension_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.call_timeout())
    }

    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.private_key, &self.certificate) {
            (Some(key), Some(cert)) => Some((key.as_str(), cert.as_str())),
            _ => None,
        }
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            target: self.target.clone(),
            call_timeout: self.call_timeout(),
            stream_extension: self.stream_extension(),
            stream_path_prefixes: self.stream_path_prefixes.clone(),
        }
    }
}
