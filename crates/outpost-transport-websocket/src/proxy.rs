//! Dialing through HTTP CONNECT and SOCKS5 proxies (RFC 1928, RFC 1929)

use base64::Engine;
use outpost_transport::{TransportError, TransportResult};
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const AUTH_METHOD_PASSWORD: u8 = 0x02;
const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const AUTH_PASSWORD_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Upper bound on the proxy's CONNECT response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Open a TCP stream to `host:port` through `proxy`
pub(crate) async fn connect(proxy: &Url, host: &str, port: u16) -> TransportResult<TcpStream> {
    let proxy_host = proxy
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .ok_or_else(|| TransportError::UnsupportedProxy(format!("no host in {}", proxy)))?;
    let default_port = match proxy.scheme() {
        "http" => 8080,
        _ => 1080,
    };
    let proxy_port = proxy.port().unwrap_or(default_port);

    debug!(proxy = %proxy_host, proxy_port, host, port, "Dialing through proxy");

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|e| TransportError::Proxy(format!("connect to proxy failed: {}", e)))?;

    let credentials = (!proxy.username().is_empty()).then(|| {
        (
            percent_decode(proxy.username()),
            percent_decode(proxy.password().unwrap_or("")),
        )
    });

    match proxy.scheme() {
        "http" => http_connect(&mut stream, host, port, credentials).await?,
        "socks" | "socks5" | "socks5h" => {
            socks5_connect(&mut stream, host, port, credentials).await?
        }
        other => return Err(TransportError::UnsupportedProxy(other.to_string())),
    }

    Ok(stream)
}

async fn http_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    credentials: Option<(String, String)>,
) -> TransportResult<()> {
    let authority = if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    };

    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n",
        authority = authority
    );
    if let Some((user, password)) = credentials {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", user, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| TransportError::Proxy(e.to_string()))?;

    // Read byte-wise so nothing past the response head is consumed
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::Proxy("oversized CONNECT response".to_string()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| TransportError::Proxy(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::Proxy(
                "proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    let status = status_line.split_whitespace().nth(1).unwrap_or_default();
    if status != "200" {
        return Err(TransportError::Proxy(format!(
            "CONNECT rejected: {}",
            status_line
        )));
    }

    Ok(())
}

async fn socks5_connect(
    stream: &mut TcpStream,
    host: &str,
    port: u16,
    credentials: Option<(String, String)>,
) -> TransportResult<()> {
    let proxy_err = |e: std::io::Error| TransportError::Proxy(e.to_string());

    let method = if credentials.is_some() {
        AUTH_METHOD_PASSWORD
    } else {
        AUTH_METHOD_NONE
    };
    stream
        .write_all(&[SOCKS5_VERSION, 1, method])
        .await
        .map_err(proxy_err)?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(proxy_err)?;
    if choice[0] != SOCKS5_VERSION {
        return Err(TransportError::Proxy(format!(
            "unexpected SOCKS version {}",
            choice[0]
        )));
    }
    if choice[1] == AUTH_METHOD_NO_ACCEPTABLE || choice[1] != method {
        return Err(TransportError::Proxy(
            "no acceptable SOCKS5 auth method".to_string(),
        ));
    }

    if let Some((user, password)) = credentials {
        if user.len() > 255 || password.len() > 255 {
            return Err(TransportError::Proxy(
                "SOCKS5 credentials too long".to_string(),
            ));
        }
        let mut auth = vec![AUTH_PASSWORD_VERSION, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(password.len() as u8);
        auth.extend_from_slice(password.as_bytes());
        stream.write_all(&auth).await.map_err(proxy_err)?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.map_err(proxy_err)?;
        if status[1] != 0 {
            return Err(TransportError::Proxy(
                "SOCKS5 authentication failed".to_string(),
            ));
        }
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(TransportError::Proxy(format!("host name too long: {}", host)));
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(proxy_err)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(proxy_err)?;
    if reply[1] != REPLY_SUCCEEDED {
        return Err(TransportError::Proxy(format!(
            "SOCKS5 connect failed: {}",
            reply_message(reply[1])
        )));
    }

    // Skip the bound address
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(proxy_err)?;
            len[0] as usize
        }
        other => {
            return Err(TransportError::Proxy(format!(
                "unknown SOCKS5 address type {}",
                other
            )))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await.map_err(proxy_err)?;

    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("p%40ss"), "p@ss");
        assert_eq!(percent_decode("plain"), "plain");
        assert_eq!(percent_decode("trailing%4"), "trailing%4");
    }

    #[tokio::test]
    async fn test_http_connect_success_and_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for response in [
                "HTTP/1.1 200 Connection established\r\n\r\n",
                "HTTP/1.1 407 Proxy Authentication Required\r\n\r\n",
            ] {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = vec![0u8; 1024];
                let n = socket.read(&mut buf).await.unwrap();
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                assert!(request.starts_with("CONNECT server.example:443 HTTP/1.1\r\n"));
                assert!(request.contains("Proxy-Authorization: Basic dTpw\r\n"));
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });

        let proxy = Url::parse(&format!("http://u:p@{}", addr)).unwrap();
        assert!(connect(&proxy, "server.example", 443).await.is_ok());

        let err = connect(&proxy, "server.example", 443).await.unwrap_err();
        assert!(matches!(err, TransportError::Proxy(msg) if msg.contains("407")));
    }

    #[tokio::test]
    async fn test_socks5_domain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            socket.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [SOCKS5_VERSION, 1, AUTH_METHOD_NONE]);
            socket.write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE]).await.unwrap();

            let mut head = [0u8; 5];
            socket.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[SOCKS5_VERSION, CMD_CONNECT, 0, ATYP_DOMAIN]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            socket.read_exact(&mut rest).await.unwrap();
            assert_eq!(&rest[..head[4] as usize], b"server.example");
            assert_eq!(&rest[head[4] as usize..], &443u16.to_be_bytes());

            socket
                .write_all(&[SOCKS5_VERSION, REPLY_SUCCEEDED, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            socket.write_all(b"tunnel").await.unwrap();
        });

        let proxy = Url::parse(&format!("socks5h://{}", addr)).unwrap();
        let mut stream = connect(&proxy, "server.example", 443).await.unwrap();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tunnel");
    }
}
