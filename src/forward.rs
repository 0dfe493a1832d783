//! The per-request forwarding engine.
//!
//! Each proxy worker loops over client requests, deciding direct vs
//! via-parent per request, performing the NTLM handshake on the first use of
//! an upstream connection, and relaying preambles and bodies. The handshake
//! always completes on one TCP connection; the parent will not revert to an
//! unauthenticated state mid-connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::Rng;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::config::GateContext;
use crate::error::{GateError, GateResult};
use crate::http::{
    drain_body, relay_body, simple_response, slurp_body, BodyFraming, HeaderMap, HttpStream,
    RequestRecord, ResponseRecord,
};
use crate::noproxy::wildcard_match;
use crate::ntlm;
use crate::parent::{parse_pac_verdict, ParentKind, ParentProxy};
use crate::pool::{ConnState, PooledConnection};
use crate::tunnel::bridge;

/// What the forwarder tells its caller to do next.
pub enum ForwardOutcome {
    /// Retry this request; the leased connection turned out to be stale.
    Continue(RequestRecord),
    /// Exchange complete, the client connection may serve another request.
    Done,
    /// Close the client connection.
    Abort,
    /// PAC only: recompute the parent list before the next request.
    Rebuild,
    /// CONNECT succeeded; switch to a bidirectional tunnel.
    Tunnel { upstream: TcpStream, leftover: Vec<u8> },
}

/// 100ns ticks since the Unix epoch, for the NTLMv2 blob.
fn ntlm_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64 / 100)
        .unwrap_or(0)
}

/// Resolve and connect, trying addresses in resolver order.
pub async fn connect_host(host: &str, port: u16) -> GateResult<TcpStream> {
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|_| GateError::Resolve(target.clone()))?
        .collect();
    if addrs.is_empty() {
        return Err(GateError::Resolve(target));
    }
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(GateError::Connect(
        target,
        last.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no address")),
    ))
}

async fn connect_parent(parent: &ParentProxy) -> GateResult<TcpStream> {
    let addrs = parent.addresses().await?;
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last = Some(e),
        }
    }
    Err(GateError::Connect(
        parent.label(),
        last.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "no address")),
    ))
}

/// NTLM-to-basic bridging: derive per-request credentials from the client's
/// `Proxy-Authorization: Basic` header. Accepts `domain\user` and
/// `user@domain` forms.
fn basic_bridge_creds(ctx: &GateContext, req: &RequestRecord) -> Option<Credentials> {
    let value = req.headers.get("Proxy-Authorization")?;
    let b64 = value
        .strip_prefix("Basic ")
        .or_else(|| value.strip_prefix("basic "))?;
    let decoded = BASE64.decode(b64.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user_spec, password) = decoded.split_once(':')?;

    let (user, domain) = if let Some((d, u)) = user_spec.split_once('\\') {
        (u.to_string(), d.to_string())
    } else if let Some((u, d)) = user_spec.split_once('@') {
        (u.to_string(), d.to_string())
    } else {
        (user_spec.to_string(), ctx.creds.domain.clone())
    };

    Credentials::from_password(password, &user, &domain, &ctx.creds.workstation, ctx.scheme).ok()
}

fn basic_challenge() -> Vec<u8> {
    let body = "Proxy authentication required";
    format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"ntlmgate\"\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nProxy-Connection: keep-alive\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

/// Evaluate the PAC verdict for one request on a blocking thread: the
/// interpreter and its helper functions (dnsResolve, isInNet, ...) do
/// synchronous DNS lookups and must not stall the async workers. `None`
/// when no PAC engine is configured.
async fn pac_verdict(ctx: &Arc<GateContext>, uri: &str, host: &str) -> Option<GateResult<String>> {
    ctx.pac.as_ref()?;
    let ctx = Arc::clone(ctx);
    let uri = uri.to_string();
    let host = host.to_string();
    let joined = tokio::task::spawn_blocking(move || match &ctx.pac {
        Some(pac) => pac.find_proxy(&uri, &host),
        None => Err(GateError::Config("PAC engine not configured".into())),
    })
    .await;
    Some(match joined {
        Ok(result) => result,
        Err(e) => Err(GateError::Config(format!("PAC evaluation task failed: {e}"))),
    })
}

/// The per-connection worker for proxy listeners: reads requests, routes
/// them, loops on keep-alive.
pub async fn proxy_worker(ctx: Arc<GateContext>, stream: TcpStream, peer: SocketAddr) {
    let mut client = HttpStream::client(stream);
    let mut pac_list: Option<Vec<ParentProxy>> = None;

    'requests: loop {
        let req = match client.read_request().await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                debug!("{peer}: {e}");
                if let Some((status, reason)) = e.client_status() {
                    let _ = client
                        .write_all(&simple_response(status, reason, &e.to_string()))
                        .await;
                }
                break;
            }
        };

        if ctx.request_log >= 1 {
            info!("{peer} {} {}", req.method, req.uri);
        }
        let keep_alive = req.headers.has_token("Proxy-Connection", "keep-alive");

        // PAC verdicts are computed per request.
        if let Some(verdict) = pac_verdict(&ctx, &req.uri, &req.host).await {
            match verdict {
                Ok(verdict) => pac_list = Some(parse_pac_verdict(&verdict)),
                Err(e) => {
                    warn!("{peer}: PAC evaluation failed: {e}");
                    pac_list = None;
                }
            }
        }

        let mut pending = Some(req);
        while let Some(req) = pending.take() {
            match serve_request(&ctx, &mut client, req, pac_list.as_deref()).await {
                Ok(ForwardOutcome::Continue(retry)) => pending = Some(retry),
                Ok(ForwardOutcome::Done) => {}
                Ok(ForwardOutcome::Rebuild) => pac_list = None,
                Ok(ForwardOutcome::Abort) => break 'requests,
                Ok(ForwardOutcome::Tunnel { upstream, leftover }) => {
                    let (client_stream, client_leftover) = client.into_parts();
                    bridge(client_stream, client_leftover, upstream, leftover).await;
                    return;
                }
                Err(e) => {
                    match &e {
                        GateError::ClientIo(err) => debug!("{peer}: client gone: {err}"),
                        _ => warn!("{peer}: {e}"),
                    }
                    if let Some((status, reason)) = e.client_status() {
                        let _ = client
                            .write_all(&simple_response(status, reason, &e.to_string()))
                            .await;
                    }
                    break 'requests;
                }
            }
        }

        if !keep_alive {
            break;
        }
    }
}

/// Route one request: NoProxy beats everything, then the PAC list if
/// enabled, then the static parent rotation.
pub async fn serve_request(
    ctx: &GateContext,
    client: &mut HttpStream<TcpStream>,
    req: RequestRecord,
    pac_list: Option<&[ParentProxy]>,
) -> GateResult<ForwardOutcome> {
    if req.host.is_empty() {
        return Err(GateError::Protocol(format!(
            "cannot determine target host for {} {}",
            req.method, req.uri
        )));
    }

    if ctx.noproxy.matches(&req.host) {
        debug!("{} matches NoProxy, serving directly", req.host);
        return direct_request(ctx, client, req).await;
    }

    // Per-request credentials in NTLM-to-basic mode; a missing header
    // elicits a local Basic challenge.
    let bridge_creds = if ctx.ntlm_to_basic {
        match basic_bridge_creds(ctx, &req) {
            Some(creds) => Some(creds),
            None => {
                client.write_all(&basic_challenge()).await?;
                drain_body(client, req.body).await?;
                return Ok(ForwardOutcome::Done);
            }
        }
    } else {
        None
    };
    let creds = bridge_creds.as_ref().unwrap_or(&ctx.creds);

    if let Some(list) = pac_list {
        let mut last_err = None;
        for parent in list {
            if parent.kind == ParentKind::Direct {
                return direct_request(ctx, client, req).await;
            }
            match forward_via_parent(ctx, client, req.clone(), parent, None, creds).await {
                Ok(outcome) => return Ok(outcome),
                Err(e @ (GateError::Resolve(_) | GateError::Connect(_, _))) => {
                    warn!("parent {} unusable: {e}", parent.label());
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        return Err(last_err.unwrap_or_else(|| {
            GateError::Protocol("PAC verdict contained no usable proxy".into())
        }));
    }

    let mut last_err = None;
    for index in ctx.selector.try_order() {
        let parent = ctx.selector.get(index);
        // NTLM-to-basic connections are bound to per-request credentials
        // and must never enter the shared pool.
        let pool_key = if ctx.ntlm_to_basic { None } else { Some(index) };
        match forward_via_parent(ctx, client, req.clone(), parent, pool_key, creds).await {
            Ok(outcome) => {
                if !matches!(outcome, ForwardOutcome::Continue(_)) {
                    ctx.selector.mark_good(index);
                }
                return Ok(outcome);
            }
            Err(e @ (GateError::Resolve(_) | GateError::Connect(_, _))) => {
                warn!("parent {} unusable: {e}", parent.label());
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| GateError::Config("no parent proxies configured".into())))
}

/// Serve a request by connecting straight to the origin.
async fn direct_request(
    ctx: &GateContext,
    client: &mut HttpStream<TcpStream>,
    req: RequestRecord,
) -> GateResult<ForwardOutcome> {
    let stream = connect_host(&req.host, req.port).await?;
    let mut upstream = HttpStream::upstream(stream);

    if req.is_connect() {
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        client.flush().await?;
        let (upstream, leftover) = upstream.into_parts();
        return Ok(ForwardOutcome::Tunnel { upstream, leftover });
    }

    let keep_alive = req.headers.has_token("Proxy-Connection", "keep-alive");
    let mut out = req.clone();
    out.headers.sanitize(&ctx.header_subs);
    out.headers
        .set("Connection", if keep_alive { "keep-alive" } else { "close" });

    upstream.write_all(&out.serialize(&req.origin_uri())).await?;
    upstream.flush().await?;
    relay_body(client, &mut upstream, req.body).await?;
    upstream.flush().await?;

    let mut resp = upstream.read_response(&req.method).await?;
    let body = resp.body;
    let reusable = keep_alive && !resp.wants_close();
    resp.headers.sanitize(&[]);
    resp.headers
        .set("Proxy-Connection", if reusable { "keep-alive" } else { "close" });
    client.write_all(&resp.serialize()).await?;
    relay_body(&mut upstream, client, body).await?;
    client.flush().await?;

    if reusable {
        Ok(ForwardOutcome::Done)
    } else {
        Ok(ForwardOutcome::Abort)
    }
}

/// Scanner workaround trigger: User-Agent matches a configured wildcard and
/// the response is small enough to prefetch whole.
fn scanner_applies(ctx: &GateContext, req: &RequestRecord, resp: &ResponseRecord) -> bool {
    if ctx.scanner_agents.is_empty() || ctx.scanner_max_bytes == 0 {
        return false;
    }
    let agent = match req.headers.get("User-Agent") {
        Some(agent) => agent,
        None => return false,
    };
    if !ctx.scanner_agents.iter().any(|p| wildcard_match(p, agent)) {
        return false;
    }
    matches!(resp.body, BodyFraming::Length(n) if n <= ctx.scanner_max_bytes)
}

/// One attempt against one parent. `pool_key` enables connection reuse for
/// statically configured parents.
async fn forward_via_parent(
    ctx: &GateContext,
    client: &mut HttpStream<TcpStream>,
    req: RequestRecord,
    parent: &ParentProxy,
    pool_key: Option<usize>,
    creds: &Credentials,
) -> GateResult<ForwardOutcome> {
    let (stream, reused) = match pool_key.and_then(|k| ctx.pool.lease(k)) {
        Some(conn) => (conn.stream, true),
        None => (connect_parent(parent).await?, false),
    };
    let mut upstream = HttpStream::upstream(stream);

    // Outgoing request: hop-by-hop stripped, substitutions applied, and the
    // parent asked to keep the connection so the pool stays warm.
    let mut out = req.clone();
    out.headers.sanitize(&ctx.header_subs);
    out.headers.set("Proxy-Connection", "Keep-Alive");
    let target_uri = if req.is_connect() {
        req.authority()
    } else {
        req.uri.clone()
    };

    let resp = if reused {
        // Already authenticated; send the request as-is. An I/O error here
        // means the parent idled the connection out - retry with a fresh
        // one.
        match send_and_read(Some(&mut *client), &mut upstream, &out, &target_uri, &req).await {
            Ok(resp) => resp,
            Err(GateError::UpstreamIo(e)) => {
                // Bodied requests cannot be retried: their bytes were
                // already drained off the client stream.
                if req.body != BodyFraming::None {
                    return Err(GateError::UpstreamIo(e));
                }
                debug!("pooled connection to {} was stale: {e}", parent.label());
                return Ok(ForwardOutcome::Continue(req));
            }
            Err(e) => return Err(e),
        }
    } else {
        match handshake_and_send(Some(&mut *client), &mut upstream, &out, &target_uri, &req, creds)
            .await?
        {
            HandshakeResult::Response(resp) => resp,
            HandshakeResult::AuthFailed(resp) => {
                warn!(
                    "parent {} rejected credentials for user '{}'",
                    parent.label(),
                    creds.user
                );
                let body = resp.body;
                let mut resp = resp;
                resp.headers.sanitize(&[]);
                resp.headers.set("Proxy-Connection", "close");
                client.write_all(&resp.serialize()).await?;
                relay_body(&mut upstream, client, body).await?;
                let _ = client.flush().await;
                return Ok(ForwardOutcome::Abort);
            }
        }
    };

    relay_response(ctx, client, upstream, req, resp, parent, pool_key).await
}

/// Send the (already sanitized) request with its body and read the response
/// preamble. `client` supplies the body bytes and may be absent for
/// bodyless synthetic requests.
async fn send_and_read(
    client: Option<&mut HttpStream<TcpStream>>,
    upstream: &mut HttpStream<TcpStream>,
    out: &RequestRecord,
    target_uri: &str,
    req: &RequestRecord,
) -> GateResult<ResponseRecord> {
    upstream.write_all(&out.serialize(target_uri)).await?;
    upstream.flush().await?;
    if !req.is_connect() && req.body != BodyFraming::None {
        if let Some(client) = client {
            relay_body(client, upstream, req.body).await?;
            upstream.flush().await?;
        }
    }
    upstream.read_response(&req.method).await
}

enum HandshakeResult {
    Response(ResponseRecord),
    /// The parent still said 407 after our Type-3.
    AuthFailed(ResponseRecord),
}

/// The NTLM dance on a fresh connection: probe with Type-1, parse the
/// Type-2 challenge out of the 407, repeat the request with Type-3 on the
/// same connection, read the final response.
async fn handshake_and_send(
    mut client: Option<&mut HttpStream<TcpStream>>,
    upstream: &mut HttpStream<TcpStream>,
    out: &RequestRecord,
    target_uri: &str,
    req: &RequestRecord,
    creds: &Credentials,
) -> GateResult<HandshakeResult> {
    let flags = creds.negotiate_flags();
    let type1 = ntlm::negotiate_message(flags, &creds.domain, &creds.workstation);

    // The probe suppresses the body; it is transmitted exactly once, with
    // the Type-3 round.
    let mut probe = out.clone();
    probe.headers.set(
        "Proxy-Authorization",
        &format!("NTLM {}", BASE64.encode(&type1)),
    );
    let has_body = !req.is_connect() && req.body != BodyFraming::None;
    if has_body {
        probe.headers.set("Content-Length", "0");
        probe.body = BodyFraming::None;
    }
    upstream.write_all(&probe.serialize(target_uri)).await?;
    upstream.flush().await?;

    let probe_resp = upstream.read_response(&req.method).await?;
    if probe_resp.status != 407 {
        // The parent answered without demanding auth. For bodied requests
        // the body was never forwarded; drain it to keep the client
        // connection in sync.
        if has_body {
            if let Some(client) = client.as_deref_mut() {
                drain_body(client, req.body).await?;
            }
        }
        return Ok(HandshakeResult::Response(probe_resp));
    }

    let challenge_b64 = probe_resp
        .headers
        .get("Proxy-Authenticate")
        .and_then(|v| v.trim().strip_prefix("NTLM "))
        .map(str::trim)
        .ok_or(GateError::AuthFailed(407))?;
    let raw = BASE64
        .decode(challenge_b64)
        .map_err(|_| GateError::Protocol("NTLM challenge is not valid base64".into()))?;
    let challenge = ntlm::parse_challenge(&raw)?;

    // The whole 407 must be consumed (CONNECT included) before the retry
    // goes out on this connection.
    drain_body(upstream, probe_resp.body).await?;
    if probe_resp.wants_close() {
        return Err(GateError::Connect(
            target_uri.to_string(),
            std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "parent closed the connection mid-handshake",
            ),
        ));
    }

    let nonce: [u8; 8] = rand::thread_rng().gen();
    let type3 = ntlm::authenticate_message(creds, &challenge, ntlm_timestamp(), nonce)?;
    let mut answer = out.clone();
    answer.headers.set(
        "Proxy-Authorization",
        &format!("NTLM {}", BASE64.encode(&type3)),
    );
    let resp = send_and_read(client, upstream, &answer, target_uri, req).await?;
    if resp.status == 407 {
        return Ok(HandshakeResult::AuthFailed(resp));
    }
    Ok(HandshakeResult::Response(resp))
}

/// Relay the final response (or switch to a tunnel) and settle the pooled
/// connection's fate.
async fn relay_response(
    ctx: &GateContext,
    client: &mut HttpStream<TcpStream>,
    mut upstream: HttpStream<TcpStream>,
    req: RequestRecord,
    mut resp: ResponseRecord,
    parent: &ParentProxy,
    pool_key: Option<usize>,
) -> GateResult<ForwardOutcome> {
    if req.is_connect() && (200..300).contains(&resp.status) {
        client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
        client.flush().await?;
        let (upstream, leftover) = upstream.into_parts();
        return Ok(ForwardOutcome::Tunnel { upstream, leftover });
    }

    let keep_alive = req.headers.has_token("Proxy-Connection", "keep-alive");
    let body = resp.body;
    let upstream_reusable = body != BodyFraming::UntilClose && !resp.wants_close();
    let client_reusable = keep_alive && body != BodyFraming::UntilClose;

    // Origin 401/407 and everything else pass through untouched apart from
    // hop-by-hop discipline.
    resp.headers.sanitize(&[]);
    resp.headers.set(
        "Proxy-Connection",
        if client_reusable { "keep-alive" } else { "close" },
    );

    if scanner_applies(ctx, &req, &resp) {
        // Prefetch the whole body so the upstream scanner cannot stall the
        // client mid-headers.
        debug!("scanner prefetch for {} ({:?})", req.uri, body);
        let data = match slurp_body(&mut upstream, body).await {
            Ok(data) => data,
            Err(e) => {
                settle_upstream(ctx, upstream, parent, pool_key, false);
                return Err(e);
            }
        };
        resp.headers.set("Content-Length", &data.len().to_string());
        client.write_all(&resp.serialize()).await?;
        client.write_all(&data).await?;
        client.flush().await?;
        settle_upstream(ctx, upstream, parent, pool_key, upstream_reusable);
        return Ok(if client_reusable {
            ForwardOutcome::Done
        } else {
            ForwardOutcome::Abort
        });
    }

    client.write_all(&resp.serialize()).await?;
    match relay_body(&mut upstream, client, body).await {
        Ok(()) => {}
        Err(e @ GateError::UpstreamIo(_)) | Err(e @ GateError::Protocol(_)) => {
            // Mid-response failure: the pooled connection is poisoned and
            // the client stream is desynchronized; headers already went
            // out, so dropping the connection is all that is left.
            settle_upstream(ctx, upstream, parent, pool_key, false);
            debug!("upstream failed mid-response: {e}");
            return Ok(ForwardOutcome::Abort);
        }
        Err(e) => {
            settle_upstream(ctx, upstream, parent, pool_key, false);
            return Err(e);
        }
    }
    client.flush().await?;

    settle_upstream(ctx, upstream, parent, pool_key, upstream_reusable);
    Ok(if client_reusable {
        ForwardOutcome::Done
    } else {
        ForwardOutcome::Abort
    })
}

/// Return the upstream connection to the pool or drop it.
fn settle_upstream(
    ctx: &GateContext,
    upstream: HttpStream<TcpStream>,
    parent: &ParentProxy,
    pool_key: Option<usize>,
    reusable: bool,
) {
    let Some(key) = pool_key else { return };
    let (stream, leftover) = upstream.into_parts();
    let state = if reusable && leftover.is_empty() {
        ConnState::Authenticated
    } else {
        ConnState::Dirty
    };
    debug!("releasing connection to {} as {:?}", parent.label(), state);
    ctx.pool.release(PooledConnection {
        stream,
        parent: key,
        state,
    });
}

/// Synthetic CONNECT request used by the SOCKS5 handler and fixed tunnels.
fn connect_record(target: &str) -> RequestRecord {
    let (host, port) = crate::http::split_host_port(target, 443);
    let mut headers = HeaderMap::new();
    headers.push("Host", target.to_string());
    RequestRecord {
        method: "CONNECT".to_string(),
        uri: target.to_string(),
        version: "HTTP/1.1".to_string(),
        host,
        port,
        headers,
        body: BodyFraming::None,
    }
}

/// Establish an authenticated CONNECT tunnel through the parent rotation,
/// for the SOCKS5 handler and fixed tunnel workers. Returns the tunnel
/// stream plus any bytes the parent already sent past the 200.
pub async fn open_upstream_tunnel(
    ctx: &GateContext,
    target: &str,
) -> GateResult<(TcpStream, Vec<u8>)> {
    let req = connect_record(target);
    let mut out = req.clone();
    out.headers.sanitize(&ctx.header_subs);
    out.headers.set("Proxy-Connection", "Keep-Alive");

    let mut last_err = None;
    for index in ctx.selector.try_order() {
        let parent = ctx.selector.get(index);

        // Pooled connection first; a stale one falls through to a fresh
        // handshake instead of failing the attempt.
        if let Some(conn) = ctx.pool.lease(index) {
            let mut upstream = HttpStream::upstream(conn.stream);
            match send_and_read(None, &mut upstream, &out, target, &req).await {
                Ok(resp) if (200..300).contains(&resp.status) => {
                    ctx.selector.mark_good(index);
                    return Ok(upstream.into_parts());
                }
                Ok(resp) => {
                    debug!("parent {} refused CONNECT: {}", parent.label(), resp.status);
                    last_err = Some(GateError::AuthFailed(resp.status));
                }
                Err(GateError::UpstreamIo(e)) => {
                    debug!("pooled connection to {} was stale: {e}", parent.label());
                }
                Err(e) => return Err(e),
            }
        }

        let stream = match connect_parent(parent).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("parent {} unusable: {e}", parent.label());
                last_err = Some(e);
                continue;
            }
        };
        let mut upstream = HttpStream::upstream(stream);
        match handshake_and_send(None, &mut upstream, &out, target, &req, &ctx.creds).await {
            Ok(HandshakeResult::Response(resp)) if (200..300).contains(&resp.status) => {
                ctx.selector.mark_good(index);
                return Ok(upstream.into_parts());
            }
            Ok(HandshakeResult::Response(resp)) => {
                debug!("parent {} refused CONNECT: {}", parent.label(), resp.status);
                last_err = Some(GateError::AuthFailed(resp.status));
            }
            Ok(HandshakeResult::AuthFailed(resp)) => {
                warn!(
                    "parent {} rejected credentials for user '{}'",
                    parent.label(),
                    ctx.creds.user
                );
                return Err(GateError::AuthFailed(resp.status));
            }
            Err(e @ (GateError::Resolve(_) | GateError::Connect(_, _))) => {
                warn!("parent {} unusable: {e}", parent.label());
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| GateError::Config("no parent proxies configured".into())))
}
