//! Host facts reported during admission

use outpost_proto::HostInfo;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::debug;

/// Collect hostname, platform and primary addresses of this machine
pub async fn collect() -> HostInfo {
    let mut info = HostInfo {
        hostname: hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string()),
        os: std::env::consts::OS.to_string(),
        os_arch: std::env::consts::ARCH.to_string(),
        ipv4: Vec::new(),
        ipv6: Vec::new(),
    };

    if let Some(ip) = outbound_ip("0.0.0.0:0", "192.0.2.1:9").await {
        info.ipv4.push(ip.to_string());
    }
    if let Some(ip) = outbound_ip("[::]:0", "[2001:db8::1]:9").await {
        info.ipv6.push(ip.to_string());
    }

    info
}

/// Source address the kernel would pick to reach `probe`; no packet is sent
async fn outbound_ip(bind: &str, probe: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).await.ok()?;
    let probe: SocketAddr = probe.parse().ok()?;
    if let Err(e) = socket.connect(probe).await {
        debug!("No route for {}: {}", probe, e);
        return None;
    }
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_reports_platform() {
        let info = collect().await;
        assert_eq!(info.os, std::env::consts::OS);
        assert_eq!(info.os_arch, std::env::consts::ARCH);
        assert!(!info.hostname.is_empty());
        for ip in &info.ipv4 {
            assert!(ip.parse::<std::net::Ipv4Addr>().is_ok());
        }
    }
}
