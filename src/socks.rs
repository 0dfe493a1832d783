//! SOCKS5 server (RFC 1928 + 1929), CONNECT only.
//!
//! Method negotiation accepts NO_AUTH when no user list is configured and
//! USER/PASS otherwise. Granted connections bridge either directly (NoProxy
//! match) or through an authenticated upstream CONNECT.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::GateContext;
use crate::forward::{connect_host, open_upstream_tunnel};
use crate::tunnel::bridge;

const SOCKS_VERSION: u8 = 5;
const AUTH_NONE: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NOT_ALLOWED: u8 = 0x02;

/// Length-safe constant-time byte comparison for the password check.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

async fn reply(stream: &mut TcpStream, code: u8) -> std::io::Result<()> {
    // Reply with a dummy IPv4 bind address, as the original does.
    let msg = [SOCKS_VERSION, code, 0, ATYP_IPV4, 0, 0, 0, 0, 0, 0];
    stream.write_all(&msg).await?;
    stream.flush().await
}

/// Read the greeting and settle on an auth method. `None` means the client
/// was turned away.
async fn negotiate_method(stream: &mut TcpStream, open: bool) -> std::io::Result<Option<u8>> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Ok(None);
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let mut chosen = None;
    if open && methods.contains(&AUTH_NONE) {
        chosen = Some(AUTH_NONE);
    }
    if chosen.is_none() && methods.contains(&AUTH_USER_PASS) {
        chosen = Some(AUTH_USER_PASS);
    }

    match chosen {
        Some(method) => {
            stream.write_all(&[SOCKS_VERSION, method]).await?;
            Ok(Some(method))
        }
        None => {
            let _ = stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await;
            Ok(None)
        }
    }
}

/// RFC 1929 user/password subnegotiation against the configured map.
async fn check_credentials(stream: &mut TcpStream, ctx: &GateContext) -> std::io::Result<bool> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut user = vec![0u8; head[1] as usize];
    stream.read_exact(&mut user).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut pass = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut pass).await?;

    let granted = match std::str::from_utf8(&user) {
        Ok(user) => ctx
            .socks_users
            .get(user)
            .map(|expected| constant_time_eq(expected.as_bytes(), &pass))
            .unwrap_or(false),
        Err(_) => false,
    };

    let status = if granted { 0x00 } else { 0xFF };
    stream.write_all(&[0x01, status]).await?;
    stream.flush().await?;
    Ok(granted)
}

/// Read the CONNECT request and return the target `(host, port)`.
async fn read_connect_target(stream: &mut TcpStream) -> std::io::Result<Option<(String, u16)>> {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION || head[1] != CMD_CONNECT {
        let _ = reply(stream, REPLY_NOT_ALLOWED).await;
        return Ok(None);
    }

    let host = match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            format!("{}.{}.{}.{}", addr[0], addr[1], addr[2], addr[3])
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            match String::from_utf8(name) {
                Ok(name) => name,
                Err(_) => {
                    let _ = reply(stream, REPLY_NOT_ALLOWED).await;
                    return Ok(None);
                }
            }
        }
        _ => {
            // IPv6 is not offered upstream; turn it away like any other
            // unsupported address type.
            let _ = reply(stream, REPLY_NOT_ALLOWED).await;
            return Ok(None);
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some((host, u16::from_be_bytes(port))))
}

/// The per-connection worker for SOCKS5 listeners.
pub async fn socks_worker(ctx: Arc<GateContext>, mut stream: TcpStream, peer: SocketAddr) {
    let open = ctx.socks_users.is_empty();

    let method = match negotiate_method(&mut stream, open).await {
        Ok(Some(method)) => method,
        Ok(None) => {
            debug!("{peer}: SOCKS5 negotiation turned client away");
            return;
        }
        Err(e) => {
            debug!("{peer}: SOCKS5 negotiation failed: {e}");
            return;
        }
    };

    if method == AUTH_USER_PASS {
        match check_credentials(&mut stream, &ctx).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("{peer}: SOCKS5 authentication failed");
                return;
            }
            Err(e) => {
                debug!("{peer}: SOCKS5 auth exchange failed: {e}");
                return;
            }
        }
    }

    let (host, port) = match read_connect_target(&mut stream).await {
        Ok(Some(target)) => target,
        Ok(None) => return,
        Err(e) => {
            debug!("{peer}: SOCKS5 request read failed: {e}");
            return;
        }
    };

    let result = if ctx.noproxy.matches(&host) {
        connect_host(&host, port).await.map(|s| (s, Vec::new()))
    } else {
        open_upstream_tunnel(&ctx, &format!("{host}:{port}")).await
    };

    let (server, leftover) = match result {
        Ok(parts) => parts,
        Err(e) => {
            warn!("{peer}: SOCKS5 connect to {host}:{port} failed: {e}");
            let _ = reply(&mut stream, REPLY_GENERAL_FAILURE).await;
            return;
        }
    };

    if let Err(e) = reply(&mut stream, REPLY_SUCCESS).await {
        debug!("{peer}: SOCKS5 success reply failed: {e}");
        return;
    }
    debug!("{peer}: SOCKS5 tunnel to {host}:{port} established");
    bridge(stream, Vec::new(), server, leftover).await;
}
