//! Tunnel access control lists
//!
//! An ACL is a comma separated list of `[ip-or-cidr][:port]` entries. Within
//! an entry the network and the port must both match; across entries a
//! single match is enough. An absent ACL allows everything.

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// ACL parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AclError {
    #[error("empty value not allowed")]
    Empty,

    #[error("invalid ip range: {0}")]
    InvalidRange(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// One `[ip-or-cidr][:port]` rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    /// Network the peer must belong to (None = any address)
    pub network: Option<IpNetwork>,
    /// Port the peer must target (None = any port)
    pub port: Option<u16>,
}

impl AclEntry {
    fn matches(&self, ip: IpAddr, port: Option<u16>) -> bool {
        let ip_ok = self.network.map_or(true, |net| net.contains(ip));
        let port_ok = match (self.port, port) {
            (Some(wanted), Some(actual)) => wanted == actual,
            _ => true,
        };
        ip_ok && port_ok
    }
}

impl FromStr for AclEntry {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if token.is_empty() {
            return Err(AclError::Empty);
        }

        // A lone number is a port
        if token.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(Self {
                network: None,
                port: Some(parse_port(token, token)?),
            });
        }

        if let Some(network) = parse_network(token) {
            return Ok(Self {
                network: Some(network),
                port: None,
            });
        }

        let (host, port) = token
            .rsplit_once(':')
            .ok_or_else(|| AclError::InvalidRange(token.to_string()))?;

        let network = if host.is_empty() {
            None
        } else {
            Some(parse_network(host).ok_or_else(|| AclError::InvalidRange(token.to_string()))?)
        };

        Ok(Self {
            network,
            port: Some(parse_port(port, token)?),
        })
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.network, self.port) {
            (Some(IpNetwork::V6(net)), Some(port)) => write!(f, "[{}]:{}", net, port),
            (Some(net), Some(port)) => write!(f, "{}:{}", net, port),
            (Some(net), None) => write!(f, "{}", net),
            (None, Some(port)) => write!(f, "{}", port),
            (None, None) => Ok(()),
        }
    }
}

fn parse_network(s: &str) -> Option<IpNetwork> {
    let s = s
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s);

    if s.contains('/') {
        return IpNetwork::from_str(s).ok();
    }

    let ip = IpAddr::from_str(s).ok()?;
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    IpNetwork::new(ip, prefix).ok()
}

fn parse_port(port: &str, token: &str) -> Result<u16, AclError> {
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(AclError::InvalidPort(token.to_string())),
    }
}

/// Parsed, immutable tunnel ACL
///
/// To change the rules of a running tunnel build a new instance and swap the
/// tunnel's reference; never mutate one that readers may be evaluating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAcl {
    entries: Vec<AclEntry>,
}

impl TunnelAcl {
    /// Parse a comma separated ACL string
    ///
    /// Returns `Ok(None)` for an empty string, which callers treat as allow-all.
    pub fn parse(s: &str) -> Result<Option<Self>, AclError> {
        if s.trim().is_empty() {
            return Ok(None);
        }
        Self::from_entries(s.split(',')).map(Some)
    }

    /// Build an ACL from individual entry strings
    pub fn from_entries<I, S>(entries: I) -> Result<Self, AclError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let entries = entries
            .into_iter()
            .map(|entry| entry.as_ref().parse())
            .collect::<Result<Vec<AclEntry>, _>>()?;

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[AclEntry] {
        &self.entries
    }

    /// Check a peer address, ignoring port rules
    pub fn check_access(&self, ip: IpAddr) -> bool {
        self.allows(ip, None)
    }

    /// Check a peer address together with the port it targets
    pub fn check_access_port(&self, ip: IpAddr, port: u16) -> bool {
        self.allows(ip, Some(port))
    }

    fn allows(&self, ip: IpAddr, port: Option<u16>) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let ip = ip.to_canonical();
        self.entries.iter().any(|entry| entry.matches(ip, port))
    }
}

impl fmt::Display for TunnelAcl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self.entries.iter().map(ToString::to_string).collect();
        write!(f, "{}", entries.join(","))
    }
}

impl FromStr for TunnelAcl {
    type Err = AclError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)?.ok_or(AclError::Empty)
    }
}

/// Evaluate an optional ACL; a missing ACL allows every address
pub fn check_access(acl: Option<&TunnelAcl>, ip: IpAddr) -> bool {
    acl.map_or(true, |acl| acl.check_access(ip))
}
