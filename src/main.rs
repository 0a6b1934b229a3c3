//! Outpost agent
//!
//! Dials out to a rendezvous server and exposes this machine's network
//! services through the session, reconnecting and failing over as needed.

use anyhow::{Context, Result};
use clap::Parser;
use outpost_client::{ClientConfig, ConnectionManager};
use outpost_transport_websocket::{WebSocketConfig, WebSocketConnector};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// Outpost - reverse-tunnel remote-access agent
#[derive(Parser, Debug)]
#[command(name = "outpost")]
#[command(version = VERSION)]
#[command(long_about = r#"
Outpost dials out to a rendezvous server over WebSocket, keeps the session
alive across failures and lets the server reach services on this machine.

EXAMPLES:
  # Connect with a config file
  outpost --config /etc/outpost/agent.yaml

  # Connect with a fallback and a requested remote
  outpost --server wss://outpost.example.com \
    --fallback-server wss://backup.example.com \
    --auth agent:secret \
    --remote 127.0.0.1:22

ENVIRONMENT VARIABLES:
  OUTPOST_CONFIG       Path to the YAML config file
  OUTPOST_SERVER       Primary server URL
  OUTPOST_AUTH         Credentials as user:password
  OUTPOST_PROXY        HTTP CONNECT or SOCKS5 proxy URL
  OUTPOST_DATA_DIR     Directory for state.json
"#)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "OUTPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Primary server URL (e.g., wss://outpost.example.com)
    #[arg(long, env = "OUTPOST_SERVER")]
    server: Option<String>,

    /// Fallback server URL, tried in order after the primary
    #[arg(long = "fallback-server")]
    fallback_servers: Vec<String>,

    /// Agent ID (auto-generated if not specified)
    #[arg(long, env = "OUTPOST_ID")]
    id: Option<String>,

    /// Agent display name
    #[arg(long, env = "OUTPOST_NAME")]
    name: Option<String>,

    /// Credentials as user:password
    #[arg(long, env = "OUTPOST_AUTH")]
    auth: Option<String>,

    /// Proxy URL (http://, socks://, socks5://, socks5h://)
    #[arg(long, env = "OUTPOST_PROXY")]
    proxy: Option<String>,

    /// Expected prefix of the server fingerprint
    #[arg(long, env = "OUTPOST_FINGERPRINT")]
    fingerprint: Option<String>,

    /// Remote to request at admission, e.g. 0.0.0.0:2222:127.0.0.1:22
    #[arg(long = "remote")]
    remotes: Vec<String>,

    /// Allowed target for server-opened tunnels, e.g. 127.0.0.1:22 or 10.0.0.0/8
    #[arg(long = "tunnel-allowed")]
    tunnel_allowed: Vec<String>,

    /// Directory for the watchdog state file
    #[arg(long, env = "OUTPOST_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Maximum failed connection attempts before giving up
    #[arg(long, env = "OUTPOST_MAX_RETRY_COUNT")]
    max_retry_count: Option<u32>,

    /// Skip certificate verification (insecure, for development only)
    #[arg(long)]
    insecure: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "OUTPOST_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Load the config file, if any, and apply command-line overrides
    fn into_config(self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ClientConfig::default(),
        };

        let client = &mut config.client;
        if let Some(server) = self.server {
            client.server = server;
        }
        if !self.fallback_servers.is_empty() {
            client.fallback_servers = self.fallback_servers;
        }
        if let Some(id) = self.id {
            client.id = id;
        }
        if let Some(name) = self.name {
            client.name = name;
        }
        if self.auth.is_some() {
            client.auth = self.auth;
        }
        if self.proxy.is_some() {
            client.proxy = self.proxy;
        }
        if self.fingerprint.is_some() {
            client.fingerprint = self.fingerprint;
        }
        if !self.remotes.is_empty() {
            client.remotes = self.remotes;
        }
        if !self.tunnel_allowed.is_empty() {
            client.tunnel_allowed = self.tunnel_allowed;
        }
        if self.data_dir.is_some() {
            client.data_dir = self.data_dir;
        }
        client.insecure |= self.insecure;

        if self.max_retry_count.is_some() {
            config.connection.max_retry_count = self.max_retry_count;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Setup logging; `RUST_LOG` takes precedence over the configured level
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn websocket_config(config: &ClientConfig) -> Result<WebSocketConfig> {
    let client = &config.client;
    let mut ws = WebSocketConfig::client_default()
        .with_handshake_timeout(config.connection.handshake_timeout);

    ws.auth = client.auth.clone();
    ws.headers = config.headers()?;
    ws.host_header = config.connection.hostname.clone();
    ws.fingerprint = client.fingerprint.clone();
    ws.root_cert = client.root_cert.clone();
    ws.insecure = client.insecure;
    if let Some(proxy) = &client.proxy {
        ws = ws.with_proxy(proxy)?;
    }

    Ok(ws)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.into_config()?;

    setup_logging(&config.logging.level);
    info!("Outpost {} starting...", VERSION);
    info!("Agent ID: {}", config.client.id);
    info!("Server: {}", config.client.server);
    for fallback in &config.client.fallback_servers {
        info!("Fallback server: {}", fallback);
    }
    if config.client.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
    }

    let connector = WebSocketConnector::new(std::sync::Arc::new(websocket_config(&config)?))
        .context("Failed to create WebSocket connector")?;
    let manager = ConnectionManager::new(connector, config.manager_config()?)
        .context("Failed to create connection manager")?;

    manager.start();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            manager.close().await;
            manager.wait().await?;
        }
        result = manager.wait() => {
            if let Err(e) = result {
                error!("Agent stopped: {:#}", e);
                return Err(e.into());
            }
        }
    }

    info!("Outpost stopped");
    Ok(())
}
