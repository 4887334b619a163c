use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::SessionError;
use crate::model::{ProxyKind, ProxySettings};

const MAX_HTTP_HEADER: usize = 16 * 1024;

fn proxy_err(msg: impl Into<String>) -> anyhow::Error {
    SessionError::Proxy(msg.into()).into()
}

/// Connects to the proxy and asks it for a tunnel to `host:port`.
pub async fn connect_via(
    proxy: &ProxySettings,
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream> {
    let proxy_addr = format!("{}:{}", proxy.host.trim(), proxy.port);
    info!(proxy = %proxy_addr, kind = ?proxy.kind, dest = %format!("{host}:{port}"), "Connecting through proxy");

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(&proxy_addr))
        .await
        .map_err(|_| SessionError::ConnectTimeout {
            addr: proxy_addr.clone(),
            secs: timeout.as_secs(),
        })?
        .with_context(|| format!("Failed to connect to proxy {proxy_addr}"))?;
    let _ = stream.set_nodelay(true);

    let handshake = async {
        match proxy.kind {
            ProxyKind::Socks5 => socks5_handshake(&mut stream, host, port, proxy).await,
            ProxyKind::Socks4 => socks4_handshake(&mut stream, host, port, proxy).await,
            ProxyKind::Http => http_connect(&mut stream, host, port, proxy).await,
            ProxyKind::None => Err(proxy_err("no proxy configured")),
        }
    };
    tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| proxy_err(format!("handshake with {proxy_addr} timed out")))??;

    debug!("Proxy tunnel established");
    Ok(stream)
}

pub async fn socks5_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    proxy: &ProxySettings,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let with_auth = !proxy.username.is_empty();
    let greeting: &[u8] = if with_auth {
        &[0x05, 0x02, 0x00, 0x02]
    } else {
        &[0x05, 0x01, 0x00]
    };
    stream
        .write_all(greeting)
        .await
        .context("Failed to send SOCKS5 greeting")?;

    let mut choice = [0u8; 2];
    stream
        .read_exact(&mut choice)
        .await
        .context("Failed to read SOCKS5 greeting response")?;
    if choice[0] != 0x05 {
        return Err(proxy_err("invalid SOCKS5 response version"));
    }
    match choice[1] {
        0x00 => {}
        0x02 if with_auth => {
            let user = proxy.username.as_bytes();
            let pass = proxy.password.as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(proxy_err("SOCKS5 credentials too long"));
            }
            let mut req = Vec::with_capacity(3 + user.len() + pass.len());
            req.push(0x01);
            req.push(user.len() as u8);
            req.extend_from_slice(user);
            req.push(pass.len() as u8);
            req.extend_from_slice(pass);
            stream
                .write_all(&req)
                .await
                .context("Failed to send SOCKS5 auth")?;
            let mut status = [0u8; 2];
            stream
                .read_exact(&mut status)
                .await
                .context("Failed to read SOCKS5 auth response")?;
            if status[1] != 0x00 {
                return Err(proxy_err("SOCKS5 authentication failed"));
            }
        }
        other => {
            return Err(proxy_err(format!(
                "SOCKS5 server requires unsupported auth method {other:#04x}"
            )));
        }
    }

    let mut req = vec![0x05, 0x01, 0x00];
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        req.push(0x01);
        req.extend_from_slice(&ip.octets());
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        req.push(0x04);
        req.extend_from_slice(&ip.octets());
    } else {
        if host.len() > 255 {
            return Err(proxy_err("target host name too long"));
        }
        req.push(0x03);
        req.push(host.len() as u8);
        req.extend_from_slice(host.as_bytes());
    }
    req.extend_from_slice(&port.to_be_bytes());
    stream
        .write_all(&req)
        .await
        .context("Failed to send SOCKS5 connect request")?;

    let mut head = [0u8; 4];
    stream
        .read_exact(&mut head)
        .await
        .context("Failed to read SOCKS5 connect response")?;
    if head[1] != 0x00 {
        let reason = match head[1] {
            0x01 => "general SOCKS server failure",
            0x02 => "connection not allowed by ruleset",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown SOCKS5 error",
        };
        return Err(proxy_err(format!("SOCKS5 connect failed: {reason}")));
    }

    // Bound address: skip it, its length depends on the address type.
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0])
        }
        other => return Err(proxy_err(format!("bad SOCKS5 address type {other}"))),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut rest)
        .await
        .context("Failed to read SOCKS5 bound address")?;
    Ok(())
}

/// SOCKS4, falling back to the 4a extension for host names.
pub async fn socks4_handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    proxy: &ProxySettings,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&port.to_be_bytes());
    let ip = host.parse::<Ipv4Addr>().ok();
    match ip {
        Some(ip) => req.extend_from_slice(&ip.octets()),
        None => req.extend_from_slice(&[0, 0, 0, 1]),
    }
    req.extend_from_slice(proxy.username.as_bytes());
    req.push(0x00);
    if ip.is_none() {
        req.extend_from_slice(host.as_bytes());
        req.push(0x00);
    }
    stream
        .write_all(&req)
        .await
        .context("Failed to send SOCKS4 request")?;

    let mut reply = [0u8; 8];
    stream
        .read_exact(&mut reply)
        .await
        .context("Failed to read SOCKS4 response")?;
    if reply[1] != 0x5a {
        let reason = match reply[1] {
            0x5b => "request rejected or failed",
            0x5c => "identd unreachable",
            0x5d => "identd user mismatch",
            _ => "unknown SOCKS4 error",
        };
        return Err(proxy_err(format!("SOCKS4 connect failed: {reason}")));
    }
    Ok(())
}

pub async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    proxy: &ProxySettings,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut req = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if !proxy.username.is_empty() {
        let creds = format!("{}:{}", proxy.username, proxy.password);
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        req.push_str(&format!("Proxy-Authorization: Basic {encoded}\r\n"));
    }
    req.push_str("\r\n");
    stream
        .write_all(req.as_bytes())
        .await
        .context("Failed to send HTTP CONNECT")?;

    // Read byte by byte so nothing past the header is consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream
            .read(&mut byte)
            .await
            .context("Failed to read HTTP proxy response")?;
        if n == 0 {
            return Err(proxy_err("proxy closed the connection during CONNECT"));
        }
        head.push(byte[0]);
        if head.len() > MAX_HTTP_HEADER {
            return Err(proxy_err("HTTP proxy response header too large"));
        }
    }

    let text = String::from_utf8_lossy(&head);
    let status_line = text.lines().next().unwrap_or_default();
    let code = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|c| c.parse::<u16>().ok())
        .ok_or_else(|| proxy_err(format!("invalid HTTP proxy response: {status_line}")))?;
    if !(200..300).contains(&code) {
        return Err(proxy_err(format!("HTTP proxy returned status {code}")));
    }
    Ok(())
}
