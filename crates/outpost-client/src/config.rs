//! Agent configuration file

use outpost_proto::{AclError, SpecError, TunnelSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::manager::{AgentIdentity, ManagerConfig};
use crate::reconnect::BackoffConfig;
use crate::tunnel_allowed::TunnelAllowList;

const PROXY_SCHEMES: &[&str] = &["http", "socks", "socks5", "socks5h"];

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("server address is required")]
    MissingServer,

    #[error("invalid server address '{0}': {1}")]
    InvalidServer(String, String),

    #[error("invalid proxy URL '{0}'")]
    InvalidProxy(String),

    #[error("unsupported proxy scheme: {0}")]
    UnsupportedProxy(String),

    #[error("failed to decode remote {0:?}: {1}")]
    InvalidRemote(String, SpecError),

    #[error("invalid ACL for tunnel {0:?}: {1}")]
    InvalidAcl(String, AclError),

    #[error("invalid tunnel_allowed entry: {0}")]
    InvalidTunnelAllowed(AclError),

    #[error("invalid header {0:?}: expected 'Name: value'")]
    InvalidHeader(String),
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client: ClientSection,
    pub connection: ConnectionSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Primary server, e.g. `wss://outpost.example.com`
    pub server: String,
    pub fallback_servers: Vec<String>,
    #[serde(with = "duration_secs")]
    pub switchback_interval: Duration,
    pub id: String,
    pub name: String,
    pub tags: Vec<String>,
    /// Credentials as `user:password`
    pub auth: Option<String>,
    pub proxy: Option<String>,
    /// Expected prefix of the server fingerprint
    pub fingerprint: Option<String>,
    /// Remotes requested at admission, in `[lhost:lport:]rhost:rport[/udp]` form
    pub remotes: Vec<String>,
    pub local_tunnels: Vec<LocalTunnelConfig>,
    /// Restricts which local targets the server may open channels to
    pub tunnel_allowed: Vec<String>,
    /// Directory for `state.json`; no state file when unset
    pub data_dir: Option<PathBuf>,
    pub root_cert: Option<PathBuf>,
    pub insecure: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: String::new(),
            fallback_servers: Vec::new(),
            switchback_interval: Duration::from_secs(2 * 60),
            id: String::new(),
            name: String::new(),
            tags: Vec::new(),
            auth: None,
            proxy: None,
            fingerprint: None,
            remotes: Vec::new(),
            local_tunnels: Vec::new(),
            tunnel_allowed: Vec::new(),
            data_dir: None,
            root_cert: None,
            insecure: false,
        }
    }
}

/// A listening tunnel hosted by the agent itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTunnelConfig {
    /// Same shorthand as `remotes`
    pub tunnel: String,
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default)]
    pub idle_timeout_minutes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Keepalive interval; 0 disables the probe
    #[serde(with = "duration_secs")]
    pub keep_alive: Duration,
    #[serde(with = "duration_secs")]
    pub keep_alive_timeout: Duration,
    /// Maximum failed attempts before giving up (unset = retry forever)
    pub max_retry_count: Option<u32>,
    #[serde(with = "duration_secs")]
    pub initial_retry_interval: Duration,
    #[serde(with = "duration_secs")]
    pub max_retry_interval: Duration,
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub admission_timeout: Duration,
    /// Extra upgrade headers as `Name: value`
    pub headers: Vec<String>,
    /// Override for the `Host` header
    pub hostname: Option<String>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(3 * 60),
            keep_alive_timeout: Duration::from_secs(30),
            max_retry_count: None,
            initial_retry_interval: Duration::from_secs(1),
            max_retry_interval: Duration::from_secs(5 * 60),
            handshake_timeout: Duration::from_secs(30),
            admission_timeout: Duration::from_secs(10),
            headers: Vec::new(),
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl ClientConfig {
    /// Load a YAML configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Normalise server URLs and check every parsed field
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.client.server = normalize_server_url(&self.client.server)?;
        for server in &mut self.client.fallback_servers {
            *server = normalize_server_url(server)?;
        }

        if let Some(proxy) = &self.client.proxy {
            let url = Url::parse(proxy).map_err(|_| ConfigError::InvalidProxy(proxy.clone()))?;
            if !PROXY_SCHEMES.contains(&url.scheme()) {
                return Err(ConfigError::UnsupportedProxy(url.scheme().to_string()));
            }
        }

        if self.connection.max_retry_interval < Duration::from_secs(1) {
            self.connection.max_retry_interval = Duration::from_secs(5 * 60);
        }

        if self.client.id.is_empty() {
            self.client.id = uuid::Uuid::new_v4().to_string();
        }

        self.remotes()?;
        self.local_tunnels()?;
        self.tunnel_allow_list()?;
        self.headers()?;

        Ok(())
    }

    /// Primary server first, then fallbacks in order
    pub fn candidate_servers(&self) -> Vec<String> {
        std::iter::once(self.client.server.clone())
            .chain(self.client.fallback_servers.iter().cloned())
            .collect()
    }

    pub fn remotes(&self) -> Result<Vec<TunnelSpec>, ConfigError> {
        self.client
            .remotes
            .iter()
            .map(|s| {
                s.parse::<TunnelSpec>()
                    .map_err(|e| ConfigError::InvalidRemote(s.clone(), e))
            })
            .collect()
    }

    pub fn local_tunnels(&self) -> Result<Vec<TunnelSpec>, ConfigError> {
        self.client
            .local_tunnels
            .iter()
            .map(|local| {
                let mut spec = local
                    .tunnel
                    .parse::<TunnelSpec>()
                    .map_err(|e| ConfigError::InvalidRemote(local.tunnel.clone(), e))?;
                spec.acl = local.acl.clone().filter(|acl| !acl.trim().is_empty());
                spec.idle_timeout_minutes = local.idle_timeout_minutes;
                spec.parsed_acl()
                    .map_err(|e| ConfigError::InvalidAcl(local.tunnel.clone(), e))?;
                Ok(spec)
            })
            .collect()
    }

    pub fn tunnel_allow_list(&self) -> Result<Option<TunnelAllowList>, ConfigError> {
        TunnelAllowList::parse(&self.client.tunnel_allowed).map_err(ConfigError::InvalidTunnelAllowed)
    }

    /// Parsed `Name: value` headers
    pub fn headers(&self) -> Result<Vec<(String, String)>, ConfigError> {
        self.connection
            .headers
            .iter()
            .map(|raw| {
                let (name, value) = raw
                    .split_once(':')
                    .ok_or_else(|| ConfigError::InvalidHeader(raw.clone()))?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ConfigError::InvalidHeader(raw.clone()));
                }
                Ok((name.to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// Build the connection manager settings from a validated config
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        let connection = &self.connection;
        Ok(ManagerConfig {
            servers: self.candidate_servers(),
            switchback_interval: self.client.switchback_interval,
            backoff: BackoffConfig {
                initial_delay: connection.initial_retry_interval,
                max_delay: connection.max_retry_interval,
                multiplier: 2.0,
                max_attempts: connection.max_retry_count,
            },
            handshake_timeout: connection.handshake_timeout,
            admission_timeout: connection.admission_timeout,
            keep_alive: (!connection.keep_alive.is_zero()).then_some(connection.keep_alive),
            keep_alive_timeout: connection.keep_alive_timeout,
            identity: AgentIdentity {
                id: self.client.id.clone(),
                name: self.client.name.clone(),
                tags: self.client.tags.clone(),
            },
            remotes: self.remotes()?,
            local_tunnels: self.local_tunnels()?,
            tunnel_allowed: self.tunnel_allow_list()?,
            data_dir: self.client.data_dir.clone(),
        })
    }
}

/// Apply the default scheme and port to a server address
///
/// `host` becomes `ws://host:80`; `http`/`https` map to `ws`/`wss`.
pub fn normalize_server_url(raw: &str) -> Result<String, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ConfigError::MissingServer);
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{}", raw)
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| ConfigError::InvalidServer(raw.to_string(), e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ConfigError::InvalidServer(
                raw.to_string(),
                format!("unsupported scheme '{}'", other),
            ))
        }
    };
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::InvalidServer(raw.to_string(), "missing host".to_string()))?;
    let port = url
        .port()
        .unwrap_or(if scheme == "wss" { 443 } else { 80 });
    let path = match url.path() {
        "/" => "",
        path => path,
    };

    Ok(format!("{}://{}:{}{}", scheme, host, port, path))
}
