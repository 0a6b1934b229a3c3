//! Tunnel specifications and channel targets
//!
//! Shorthand accepted by [`TunnelSpec::from_str`]:
//!
//! | input                           | local             | remote            |
//! |---------------------------------|-------------------|-------------------|
//! | `3000`                          | unspecified       | `127.0.0.1:3000`  |
//! | `example.com:3000`              | unspecified       | `example.com:3000`|
//! | `3000:example.com:80`           | `0.0.0.0:3000`    | `example.com:80`  |
//! | `192.168.0.1:3000:example.com:80` | `192.168.0.1:3000` | `example.com:80` |
//!
//! A trailing `/udp` or `/tcp` selects the protocol (TCP by default).

use crate::acl::{AclError, TunnelAcl};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const ZERO_HOST: &str = "0.0.0.0";
pub const LOCAL_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("invalid tunnel '{0}'")]
    Invalid(String),

    #[error("missing port in '{0}'")]
    MissingPort(String),

    #[error("invalid port '{port}' in '{input}'")]
    InvalidPort { input: String, port: String },

    #[error("invalid protocol '{0}'")]
    InvalidProtocol(String),

    #[error("invalid ACL: {0}")]
    Acl(#[from] AclError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    #[default]
    Tcp,
    Udp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Tcp => "tcp",
            TunnelProtocol::Udp => "udp",
        }
    }
}

impl FromStr for TunnelProtocol {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(TunnelProtocol::Tcp),
            "udp" => Ok(TunnelProtocol::Udp),
            other => Err(SpecError::InvalidProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A forwarding rule binding a local endpoint to a remote one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: TunnelProtocol,
    #[serde(rename = "lhost", default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    #[serde(rename = "lport", default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(rename = "rhost")]
    pub remote_host: String,
    #[serde(rename = "rport")]
    pub remote_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_minutes: Option<u32>,
}

impl TunnelSpec {
    pub fn new(remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            name: None,
            protocol: TunnelProtocol::Tcp,
            local_host: None,
            local_port: None,
            remote_host: remote_host.into(),
            remote_port,
            acl: None,
            idle_timeout_minutes: None,
        }
    }

    pub fn with_protocol(mut self, protocol: TunnelProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_local(mut self, host: impl Into<String>, port: u16) -> Self {
        self.local_host = Some(host.into());
        self.local_port = Some(port);
        self
    }

    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = Some(acl.into());
        self
    }

    pub fn with_idle_timeout(mut self, minutes: u32) -> Self {
        self.idle_timeout_minutes = Some(minutes);
        self
    }

    /// Local bind address; falls back to `0.0.0.0` and an ephemeral port
    pub fn local(&self) -> String {
        join_host_port(
            self.local_host.as_deref().unwrap_or(ZERO_HOST),
            self.local_port.unwrap_or(0),
        )
    }

    pub fn remote(&self) -> String {
        join_host_port(&self.remote_host, self.remote_port)
    }

    pub fn is_local_specified(&self) -> bool {
        self.local_port.is_some()
    }

    /// Target string carried by the channel-open for this tunnel
    pub fn channel_target(&self) -> ChannelTarget {
        ChannelTarget {
            host: self.remote_host.clone(),
            port: self.remote_port,
            protocol: self.protocol,
        }
    }

    /// Parse the attached ACL, if any
    pub fn parsed_acl(&self) -> Result<Option<TunnelAcl>, AclError> {
        match &self.acl {
            Some(acl) => TunnelAcl::parse(acl),
            None => Ok(None),
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_minutes
            .filter(|m| *m > 0)
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }
}

impl FromStr for TunnelSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        let (body, protocol) = split_protocol(input)?;

        let parts = split_host_parts(body);
        if parts.is_empty() || parts.len() > 4 || parts.iter().any(|p| p.is_empty()) {
            return Err(SpecError::Invalid(input.to_string()));
        }

        let mut remote_port = None;
        let mut local_port = None;
        let mut remote_host = None;
        let mut local_host = None;

        // Read right to left: ports fill remote then local, hosts likewise
        for part in parts.iter().rev() {
            if part.bytes().all(|b| b.is_ascii_digit()) {
                let port = parse_port(input, part)?;
                if remote_port.is_none() {
                    remote_port = Some(port);
                } else if local_port.is_none() {
                    local_port = Some(port);
                } else {
                    return Err(SpecError::Invalid(input.to_string()));
                }
                continue;
            }

            if remote_port.is_none() && local_port.is_none() {
                return Err(SpecError::MissingPort(input.to_string()));
            }
            if !is_host(part) {
                return Err(SpecError::Invalid(input.to_string()));
            }
            if remote_host.is_none() {
                remote_host = Some(part.to_string());
            } else if local_host.is_none() {
                local_host = Some(part.to_string());
            } else {
                return Err(SpecError::Invalid(input.to_string()));
            }
        }

        let remote_port = remote_port.ok_or_else(|| SpecError::MissingPort(input.to_string()))?;
        if local_host.is_some() && local_port.is_none() {
            return Err(SpecError::Invalid(input.to_string()));
        }
        if local_host.is_none() && local_port.is_some() {
            local_host = Some(ZERO_HOST.to_string());
        }

        Ok(Self {
            name: None,
            protocol,
            local_host,
            local_port,
            remote_host: remote_host.unwrap_or_else(|| LOCAL_HOST.to_string()),
            remote_port,
            acl: None,
            idle_timeout_minutes: None,
        })
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local_specified() {
            write!(f, "{}:", self.local())?;
        }
        write!(f, "{}", self.remote())?;
        if self.protocol != TunnelProtocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        if let Some(acl) = &self.acl {
            write!(f, "(acl:{})", acl)?;
        }
        Ok(())
    }
}

/// Target of a server-initiated channel: `host:port[/tcp|/udp]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    pub host: String,
    pub port: u16,
    pub protocol: TunnelProtocol,
}

impl ChannelTarget {
    pub fn parse(s: &str) -> Result<Self, SpecError> {
        s.parse()
    }

    /// `host:port` without the protocol suffix
    pub fn address(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

impl FromStr for ChannelTarget {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (body, protocol) = split_protocol(s.trim())?;
        let (host, port) = body
            .rsplit_once(':')
            .ok_or_else(|| SpecError::MissingPort(s.to_string()))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(SpecError::Invalid(s.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port: parse_port(s, port)?,
            protocol,
        })
    }
}

impl fmt::Display for ChannelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address())?;
        if self.protocol == TunnelProtocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

fn split_protocol(s: &str) -> Result<(&str, TunnelProtocol), SpecError> {
    match s.rsplit_once('/') {
        Some((body, proto)) if proto == "tcp" || proto == "udp" => Ok((body, proto.parse()?)),
        Some((_, proto)) if proto.chars().all(|c| c.is_ascii_alphabetic() || c == '+') => {
            Err(SpecError::InvalidProtocol(proto.to_string()))
        }
        _ => Ok((s, TunnelProtocol::Tcp)),
    }
}

/// Split on ':' while keeping bracketed IPv6 literals intact
fn split_host_parts(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_brackets = false;
    for (i, c) in s.char_indices() {
        match c {
            '[' => in_brackets = true,
            ']' => in_brackets = false,
            ':' if !in_brackets => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
        .into_iter()
        .map(|p| {
            p.strip_prefix('[')
                .and_then(|inner| inner.strip_suffix(']'))
                .unwrap_or(p)
        })
        .collect()
}

fn is_host(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':'))
}

fn parse_port(input: &str, port: &str) -> Result<u16, SpecError> {
    port.parse::<u16>()
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| SpecError::InvalidPort {
            input: input.to_string(),
            port: port.to_string(),
        })
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_only() {
        let spec: TunnelSpec = "3000".parse().unwrap();
        assert_eq!(spec.remote(), "127.0.0.1:3000");
        assert!(!spec.is_local_specified());
        assert_eq!(spec.protocol, TunnelProtocol::Tcp);
    }

    #[test]
    fn test_host_and_port() {
        let spec: TunnelSpec = "example.com:3000".parse().unwrap();
        assert_eq!(spec.remote(), "example.com:3000");
        assert_eq!(spec.local_host, None);
    }

    #[test]
    fn test_local_port_defaults_to_zero_host() {
        let spec: TunnelSpec = "3000:example.com:80/udp".parse().unwrap();
        assert_eq!(spec.local(), "0.0.0.0:3000");
        assert_eq!(spec.remote(), "example.com:80");
        assert_eq!(spec.protocol, TunnelProtocol::Udp);
        assert_eq!(spec.channel_target().to_string(), "example.com:80/udp");
    }

    #[test]
    fn test_full_form_and_display() {
        let spec: TunnelSpec = "192.168.0.1:3000:example.com:80".parse().unwrap();
        assert_eq!(spec.local(), "192.168.0.1:3000");
        assert_eq!(spec.to_string(), "192.168.0.1:3000:example.com:80");
    }

    #[test]
    fn test_ipv6_remote() {
        let spec: TunnelSpec = "5353:[::1]:53/udp".parse().unwrap();
        assert_eq!(spec.remote_host, "::1");
        assert_eq!(spec.remote(), "[::1]:53");
    }

    #[test]
    fn test_invalid_specs() {
        assert!(matches!(
            "example.com".parse::<TunnelSpec>(),
            Err(SpecError::MissingPort(_))
        ));
        assert!(matches!(
            "3000/quic".parse::<TunnelSpec>(),
            Err(SpecError::InvalidProtocol(_))
        ));
        assert!(matches!(
            "70000".parse::<TunnelSpec>(),
            Err(SpecError::InvalidPort { .. })
        ));
        assert!("a:1:b:2:3".parse::<TunnelSpec>().is_err());
        assert!("host name:22".parse::<TunnelSpec>().is_err());
    }

    #[test]
    fn test_channel_target() {
        let tcp = ChannelTarget::parse("10.0.0.5:22").unwrap();
        assert_eq!(tcp.protocol, TunnelProtocol::Tcp);
        assert_eq!(tcp.address(), "10.0.0.5:22");

        let udp = ChannelTarget::parse("[fe80::1]:53/udp").unwrap();
        assert_eq!(udp.host, "fe80::1");
        assert_eq!(udp.protocol, TunnelProtocol::Udp);
        assert_eq!(udp.to_string(), "[fe80::1]:53/udp");

        assert!(ChannelTarget::parse("nohost").is_err());
        assert!(ChannelTarget::parse(":22").is_err());
    }

    #[test]
    fn test_idle_timeout() {
        let spec = TunnelSpec::new("127.0.0.1", 53).with_idle_timeout(2);
        assert_eq!(spec.idle_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(TunnelSpec::new("127.0.0.1", 53).with_idle_timeout(0).idle_timeout(), None);
    }
}
