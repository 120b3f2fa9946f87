//! Driver configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via VELOCY_CONFIG)
//! 3. Environment variables

use crate::connection::{ConnectionConfig, Credentials};
use crate::host::HostDescription;
use crate::resolver::DEFAULT_HOST_LIST_TTL;
use crate::tls::TlsClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use velocy_protocol::{DEFAULT_CHUNK_SIZE, DEFAULT_PORT, MAX_CHUNK_SIZE};

/// Default redirect bound per request.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Transport used for connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Vst,
    Http,
}

impl Protocol {
    /// Connections per host when not configured.
    pub fn default_max_connections(self) -> usize {
        match self {
            Protocol::Vst => 1,
            Protocol::Http => 20,
        }
    }
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vst" => Ok(Protocol::Vst),
            "http" | "http1" => Ok(Protocol::Http),
            other => Err(ConfigError::ValidationError(format!(
                "unknown protocol '{}'",
                other
            ))),
        }
    }
}

/// Host selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingStrategy {
    /// Sequential failover.
    #[default]
    None,
    /// Random starting host with failover.
    OneRandom,
    RoundRobin,
}

impl FromStr for LoadBalancingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "NONE" => Ok(LoadBalancingStrategy::None),
            "ONE_RANDOM" => Ok(LoadBalancingStrategy::OneRandom),
            "ROUND_ROBIN" => Ok(LoadBalancingStrategy::RoundRobin),
            other => Err(ConfigError::ValidationError(format!(
                "unknown load balancing strategy '{}'",
                other
            ))),
        }
    }
}

/// Driver configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Initial hosts, as `host:port`.
    pub hosts: Vec<HostDescription>,
    pub protocol: Protocol,
    pub user: Option<String>,
    pub password: Option<String>,
    /// JWT; takes precedence over user and password.
    pub jwt: Option<String>,
    /// Default database for requests built by the driver.
    pub database: String,
    /// Connections per host. Defaults per protocol.
    pub max_connections: Option<usize>,
    pub connect_timeout_ms: u64,
    /// Response timeout; 0 disables it.
    pub request_timeout_ms: u64,
    /// Maximum chunk content size.
    pub chunk_size: usize,
    pub load_balancing: LoadBalancingStrategy,
    /// Refresh the host list from the cluster's endpoint list.
    pub acquire_host_list: bool,
    /// Host list age that triggers a refresh; 0 refreshes before every
    /// request.
    pub acquire_host_list_interval_secs: u64,
    pub max_redirects: usize,
    pub tls: TlsClientConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            hosts: vec![HostDescription::new("127.0.0.1", DEFAULT_PORT)],
            protocol: Protocol::Vst,
            user: Some("root".to_string()),
            password: None,
            jwt: None,
            database: "_system".to_string(),
            max_connections: None,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            load_balancing: LoadBalancingStrategy::None,
            acquire_host_list: false,
            acquire_host_list_interval_secs: DEFAULT_HOST_LIST_TTL.as_secs(),
            max_redirects: DEFAULT_MAX_REDIRECTS,
            tls: TlsClientConfig::default(),
        }
    }
}

impl std::fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConfig")
            .field("hosts", &self.hosts)
            .field("protocol", &self.protocol)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("jwt", &self.jwt.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("max_connections", &self.max_connections)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("chunk_size", &self.chunk_size)
            .field("load_balancing", &self.load_balancing)
            .field("acquire_host_list", &self.acquire_host_list)
            .field(
                "acquire_host_list_interval_secs",
                &self.acquire_host_list_interval_secs,
            )
            .field("max_redirects", &self.max_redirects)
            .field("tls", &self.tls)
            .finish()
    }
}

impl DriverConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("VELOCY_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))
    }

    /// Applies `VELOCY_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Applies overrides looked up by variable name. Unparseable values are
    /// ignored.
    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |value: String| value == "1" || value.eq_ignore_ascii_case("true");

        if let Some(hosts) = var("VELOCY_HOSTS") {
            let parsed: Result<Vec<HostDescription>, _> = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(HostDescription::parse_location)
                .collect();
            if let Ok(parsed) = parsed {
                self.hosts = parsed;
            }
        }
        if let Some(protocol) = var("VELOCY_PROTOCOL").and_then(|v| v.parse().ok()) {
            self.protocol = protocol;
        }
        if let Some(user) = var("VELOCY_USER") {
            self.user = Some(user);
        }
        if let Some(password) = var("VELOCY_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(jwt) = var("VELOCY_JWT") {
            self.jwt = Some(jwt);
        }
        if let Some(database) = var("VELOCY_DATABASE") {
            self.database = database;
        }
        if let Some(n) = var("VELOCY_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.max_connections = Some(n);
        }
        if let Some(ms) = var("VELOCY_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = var("VELOCY_REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.request_timeout_ms = ms;
        }
        if let Some(size) = var("VELOCY_CHUNK_SIZE").and_then(|v| v.parse().ok()) {
            self.chunk_size = size;
        }
        if let Some(strategy) = var("VELOCY_LOAD_BALANCING").and_then(|v| v.parse().ok()) {
            self.load_balancing = strategy;
        }
        if let Some(acquire) = var("VELOCY_ACQUIRE_HOST_LIST") {
            self.acquire_host_list = flag(acquire);
        }
        if let Some(secs) =
            var("VELOCY_ACQUIRE_HOST_LIST_INTERVAL_SECS").and_then(|v| v.parse().ok())
        {
            self.acquire_host_list_interval_secs = secs;
        }
        if let Some(n) = var("VELOCY_MAX_REDIRECTS").and_then(|v| v.parse().ok()) {
            self.max_redirects = n;
        }

        if let Some(enabled) = var("VELOCY_TLS_ENABLED") {
            self.tls.enabled = flag(enabled);
        }
        if let Some(path) = var("VELOCY_TLS_CA") {
            self.tls.ca_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("VELOCY_TLS_CERT") {
            self.tls.client_cert_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("VELOCY_TLS_KEY") {
            self.tls.client_key_path = Some(PathBuf::from(path));
        }
        if let Some(insecure) = var("VELOCY_TLS_INSECURE") {
            self.tls.insecure = flag(insecure);
        }
        if let Some(name) = var("VELOCY_TLS_SERVER_NAME") {
            self.tls.server_name = Some(name);
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one host is required".to_string(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "chunk_size must be between 1 and {}",
                MAX_CHUNK_SIZE
            )));
        }
        if self.database.is_empty() {
            return Err(ConfigError::ValidationError(
                "database must not be empty".to_string(),
            ));
        }
        if self.tls.client_cert_path.is_some() != self.tls.client_key_path.is_some() {
            return Err(ConfigError::ValidationError(
                "TLS client_cert_path and client_key_path must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Option<Credentials> {
        if let Some(ref token) = self.jwt {
            return Some(Credentials::Jwt(token.clone()));
        }
        self.user.as_ref().map(|user| Credentials::Basic {
            user: user.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
            .unwrap_or_else(|| self.protocol.default_max_connections())
            .max(1)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn acquire_host_list_interval(&self) -> Duration {
        Duration::from_secs(self.acquire_host_list_interval_secs)
    }

    /// Settings for the connections this configuration describes.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: self.connect_timeout(),
            request_timeout: self.request_timeout(),
            chunk_size: self.chunk_size,
            credentials: self.credentials(),
            tls: self.tls.enabled.then(|| self.tls.clone()),
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError(_, e) => Some(e),
            _ => None,
        }
    }
}
