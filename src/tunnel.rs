//! Bidirectional byte relay and the fixed-tunnel worker.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::GateContext;
use crate::forward::{connect_host, open_upstream_tunnel};
use crate::http::split_host_port;

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Full-duplex relay between two sockets until either side closes or
/// errors. Any bytes read past the preambles are flushed to the opposite
/// side first. Returns (client→server, server→client) byte counts.
pub async fn bridge(
    client: TcpStream,
    client_leftover: Vec<u8>,
    server: TcpStream,
    server_leftover: Vec<u8>,
) -> (u64, u64) {
    let mut client = client;
    let mut server = server;

    if !client_leftover.is_empty() {
        if server.write_all(&client_leftover).await.is_err() {
            return (0, 0);
        }
    }
    if !server_leftover.is_empty() {
        if client.write_all(&server_leftover).await.is_err() {
            return (client_leftover.len() as u64, 0);
        }
    }

    let mut from_client = client_leftover.len() as u64;
    let mut from_server = server_leftover.len() as u64;
    let mut client_buf = vec![0u8; RELAY_BUF_SIZE];
    let mut server_buf = vec![0u8; RELAY_BUF_SIZE];

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = server.write_all(&client_buf[..n]).await {
                            debug!("tunnel server write error: {e}");
                            break;
                        }
                        from_client += n as u64;
                    }
                    Err(e) => {
                        debug!("tunnel client read error: {e}");
                        break;
                    }
                }
            }
            res = server.read(&mut server_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client.write_all(&server_buf[..n]).await {
                            debug!("tunnel client write error: {e}");
                            break;
                        }
                        from_server += n as u64;
                    }
                    Err(e) => {
                        debug!("tunnel server read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    let _ = server.shutdown().await;
    let _ = client.shutdown().await;
    debug!("tunnel closed: {from_client}\u{2191} {from_server}\u{2193} bytes");
    (from_client, from_server)
}

/// Worker for a fixed tunnel listener: behaves like a SOCKS handler that
/// skipped negotiation, with the target baked into the listener.
pub async fn tunnel_worker(
    ctx: Arc<GateContext>,
    client: TcpStream,
    peer: SocketAddr,
    target: String,
) {
    let (host, port) = split_host_port(&target, 0);

    let result = if ctx.noproxy.matches(&host) {
        connect_host(&host, port).await.map(|s| (s, Vec::new()))
    } else {
        open_upstream_tunnel(&ctx, &target).await
    };

    match result {
        Ok((server, leftover)) => {
            debug!("{peer}: tunnel to {target} established");
            bridge(client, Vec::new(), server, leftover).await;
        }
        Err(e) => {
            warn!("{peer}: tunnel to {target} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_bridge_relays_both_ways_and_closes() {
        let (a_near, mut a_far) = socket_pair().await;
        let (b_near, mut b_far) = socket_pair().await;

        let relay = tokio::spawn(bridge(a_near, Vec::new(), b_near, Vec::new()));

        a_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b_far.write_all(b"pong").await.unwrap();
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side ends the relay and closes the other.
        drop(b_far);
        let (from_client, from_server) = relay.await.unwrap();
        assert_eq!(from_client, 4);
        assert_eq!(from_server, 4);
        let n = a_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_bridge_flushes_leftovers_first() {
        let (a_near, mut a_far) = socket_pair().await;
        let (b_near, mut b_far) = socket_pair().await;

        let relay = tokio::spawn(bridge(
            a_near,
            b"early-from-client".to_vec(),
            b_near,
            b"early-from-server".to_vec(),
        ));

        let mut buf = vec![0u8; 17];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-from-client");
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early-from-server");

        drop(a_far);
        drop(b_far);
        let _ = relay.await.unwrap();
    }
}
