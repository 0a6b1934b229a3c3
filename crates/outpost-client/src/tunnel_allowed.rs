//! Agent-side restriction on which local targets the server may reach

use outpost_proto::{AclError, TunnelAcl};
use tokio::net::lookup_host;

use crate::error::TunnelError;

/// Allow-list of `[ip-or-cidr][:port]` entries checked against resolved targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelAllowList {
    acl: TunnelAcl,
}

impl TunnelAllowList {
    /// Parse the configured entries; no entries means no restriction
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Option<Self>, AclError> {
        if entries.is_empty() {
            return Ok(None);
        }
        let acl = TunnelAcl::from_entries(entries.iter().map(AsRef::as_ref))?;
        Ok(Some(Self { acl }))
    }

    /// Resolve `host:port` and require every address to match an entry
    pub async fn is_allowed(&self, remote: &str) -> Result<bool, TunnelError> {
        let (_, port) = remote
            .rsplit_once(':')
            .ok_or_else(|| TunnelError::NotAllowed(remote.to_string()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::NotAllowed(remote.to_string()))?;

        let mut resolved = false;
        for addr in lookup_host(remote).await? {
            resolved = true;
            if !self.acl.check_access_port(addr.ip(), port) {
                return Ok(false);
            }
        }
        Ok(resolved)
    }
}

/// Evaluate an optional allow-list; none allows everything
pub async fn tunnel_is_allowed(
    allow_list: Option<&TunnelAllowList>,
    remote: &str,
) -> Result<bool, TunnelError> {
    match allow_list {
        Some(list) => list.is_allowed(remote).await,
        None => Ok(true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_list_is_none() {
        let entries: [&str; 0] = [];
        assert!(TunnelAllowList::parse(&entries).unwrap().is_none());
        assert!(TunnelAllowList::parse(&["10.0.0.0/33"]).is_err());
    }

    #[tokio::test]
    async fn test_ip_and_port_rules() {
        let list = TunnelAllowList::parse(&["127.0.0.0/8:22", "192.168.1.10"])
            .unwrap()
            .unwrap();

        assert!(list.is_allowed("127.0.0.1:22").await.unwrap());
        assert!(!list.is_allowed("127.0.0.1:80").await.unwrap());
        assert!(list.is_allowed("192.168.1.10:3389").await.unwrap());
        assert!(!list.is_allowed("10.1.1.1:22").await.unwrap());
    }

    #[tokio::test]
    async fn test_port_only_rule() {
        let list = TunnelAllowList::parse(&["3389"]).unwrap().unwrap();
        assert!(list.is_allowed("10.1.1.1:3389").await.unwrap());
        assert!(!list.is_allowed("10.1.1.1:22").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_list_allows_everything() {
        assert!(tunnel_is_allowed(None, "10.1.1.1:1").await.unwrap());
    }
}
