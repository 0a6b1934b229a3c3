//! Connection state file and service-manager watchdog notifications

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

const STATE_FILE: &str = "state.json";
const SD_NOTIFY_WATCHDOG: &[u8] = b"WATCHDOG=1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchdogState {
    Initialized,
    Reconnecting,
    Connected,
}

impl fmt::Display for WatchdogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WatchdogState::Initialized => "initialized",
            WatchdogState::Reconnecting => "reconnecting",
            WatchdogState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// Contents of `state.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    pub last_update: DateTime<Utc>,
    /// Unix timestamp of `last_update`, for scripts
    pub last_update_ts: i64,
    pub last_state: WatchdogState,
    pub last_message: String,
}

/// Records connection state transitions in `<data_dir>/state.json`
#[derive(Debug)]
pub struct Watchdog {
    state_file: PathBuf,
    notify_socket: Option<PathBuf>,
}

impl Watchdog {
    /// Create the watchdog and record the `initialized` state
    pub fn new(data_dir: &Path) -> std::io::Result<Self> {
        let notify_socket = std::env::var_os("NOTIFY_SOCKET")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty());

        let watchdog = Self {
            state_file: data_dir.join(STATE_FILE),
            notify_socket,
        };
        debug!(path = %watchdog.state_file.display(), "Watchdog state file");

        watchdog.write(WatchdogState::Initialized, "")?;
        Ok(watchdog)
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Record a transition; failures are logged, never returned
    pub fn update(&self, state: WatchdogState, message: &str) {
        self.notify();
        if let Err(e) = self.write(state, message) {
            error!(
                "Failed to write watchdog state file {}: {}",
                self.state_file.display(),
                e
            );
        }
    }

    fn write(&self, state: WatchdogState, message: &str) -> std::io::Result<()> {
        let now = Utc::now();
        let record = StateRecord {
            last_update: now,
            last_update_ts: now.timestamp(),
            last_state: state,
            last_message: message.to_string(),
        };
        let json = serde_json::to_vec_pretty(&record)?;
        std::fs::write(&self.state_file, json)
    }

    #[cfg(unix)]
    fn notify(&self) {
        use std::os::unix::net::UnixDatagram;

        let Some(socket_path) = &self.notify_socket else {
            return;
        };
        let sent = UnixDatagram::unbound()
            .and_then(|socket| socket.send_to(SD_NOTIFY_WATCHDOG, socket_path));
        if let Err(e) = sent {
            error!("Failed to send sd_notify to socket: {}", e);
        }
    }

    #[cfg(not(unix))]
    fn notify(&self) {
        let _ = (&self.notify_socket, SD_NOTIFY_WATCHDOG);
    }
}
