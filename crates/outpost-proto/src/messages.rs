//! Control request kinds and payloads exchanged on the session side-channel

use crate::remote::TunnelSpec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Administrative requests the server may send to an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    CheckPort,
    RunCmd,
    RefreshUpdatesStatus,
    PutCapabilities,
    Upload,
    CheckTunnelAllowed,
    Ping,
}

impl RequestKind {
    pub const ALL: [RequestKind; 7] = [
        RequestKind::CheckPort,
        RequestKind::RunCmd,
        RequestKind::RefreshUpdatesStatus,
        RequestKind::PutCapabilities,
        RequestKind::Upload,
        RequestKind::CheckTunnelAllowed,
        RequestKind::Ping,
    ];

    /// Wire name of the request
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::CheckPort => "check_port",
            RequestKind::RunCmd => "run_cmd",
            RequestKind::RefreshUpdatesStatus => "refresh_updates_status",
            RequestKind::PutCapabilities => "put_capabilities",
            RequestKind::Upload => "upload",
            RequestKind::CheckTunnelAllowed => "check_tunnel_allowed",
            RequestKind::Ping => "ping",
        }
    }

    /// Look up a request kind by wire name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPortRequest {
    pub host_port: String,
    /// Connect timeout in seconds
    #[serde(default = "default_check_port_timeout")]
    pub timeout: u64,
}

fn default_check_port_timeout() -> u64 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckPortResponse {
    pub open: bool,
    #[serde(default)]
    pub errmsg: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTunnelAllowedRequest {
    pub remote: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckTunnelAllowedResponse {
    pub is_allowed: bool,
}

/// Feature set advertised by the server through `put_capabilities`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub monitoring_version: u32,
    #[serde(default)]
    pub ipv6_tunnels: bool,
}

/// Host facts reported during admission
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub os_arch: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub ipv6: Vec<String>,
}

/// Sent by the agent right after the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRequest {
    pub version: String,
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub remotes: Vec<TunnelSpec>,
    #[serde(flatten)]
    pub host: HostInfo,
}

/// Structured admission rejection codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    AlreadyConnected,
    Unauthorized,
    InvalidRequest,
    Other,
}

/// Marker servers without rejection codes put in the message
pub const ALREADY_CONNECTED_MARKER: &str = "client is already connected";

/// Negative reply to an admission request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionRejection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<RejectionCode>,
    pub message: String,
}

impl AdmissionRejection {
    /// Decode a rejection body; plain text bodies become a code-less rejection
    pub fn from_payload(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_else(|_| Self {
            code: None,
            message: String::from_utf8_lossy(payload).trim().to_string(),
        })
    }

    /// Whether the agent should back off and try again
    pub fn is_retryable(&self) -> bool {
        match self.code {
            Some(code) => code == RejectionCode::AlreadyConnected,
            None => self.message.contains(ALREADY_CONNECTED_MARKER),
        }
    }
}

impl fmt::Display for AdmissionRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kind_names() {
        for kind in RequestKind::ALL {
            assert_eq!(RequestKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(RequestKind::parse("reboot"), None);
    }

    #[test]
    fn test_rejection_retry_boundary() {
        let legacy = AdmissionRejection::from_payload(b"client is already connected: c1");
        assert!(legacy.is_retryable());

        let coded: AdmissionRejection = serde_json::from_str(
            r#"{"code":"already_connected","message":"duplicate session"}"#,
        )
        .unwrap();
        assert!(coded.is_retryable());

        let fatal = AdmissionRejection::from_payload(b"invalid client credentials");
        assert!(!fatal.is_retryable());

        // A code takes precedence over the message text
        let coded_fatal = AdmissionRejection {
            code: Some(RejectionCode::Unauthorized),
            message: "client is already connected".into(),
        };
        assert!(!coded_fatal.is_retryable());
    }

    #[test]
    fn test_admission_request_flattens_host_info() {
        let request = AdmissionRequest {
            version: "0.1.0".into(),
            id: "c1".into(),
            name: "edge".into(),
            tags: vec!["lab".into()],
            remotes: vec!["2222:127.0.0.1:22".parse().unwrap()],
            host: HostInfo {
                hostname: "edge-01".into(),
                os: "linux".into(),
                os_arch: "x86_64".into(),
                ipv4: vec!["192.0.2.5".into()],
                ipv6: vec![],
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["hostname"], "edge-01");
        assert_eq!(json["remotes"][0]["rport"], 22);

        let back: AdmissionRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, request);
    }
}
