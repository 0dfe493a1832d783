//! Raw HTTP/1.x preamble I/O and body relay.
//!
//! The gateway never reinterprets traffic: preambles are parsed into ordered,
//! case-preserving header maps and written back verbatim apart from
//! hop-by-hop stripping and operator substitutions, and bodies are relayed
//! preserving their framing byte-for-byte (chunk sizes and CRLFs included).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{GateError, GateResult};

const IO_CHUNK_SIZE: usize = 8 * 1024;
const MAX_PREAMBLE_BYTES: usize = 64 * 1024;
const MAX_CHUNK_LINE_BYTES: usize = 8 * 1024;

/// Headers stripped before forwarding; the forwarder regenerates the ones it
/// needs.
pub const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Proxy-Connection",
    "Keep-Alive",
    "Proxy-Authorization",
    "Proxy-Authenticate",
    "TE",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// How the message body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Ordered header map. Lookup folds case, display form and insertion order
/// are preserved, duplicate names are allowed.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// First value for a name, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every entry with the given name.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Replace-or-add under the caller's display name.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.push(name, value);
    }

    /// True when the named header carries `token` in its comma-separated
    /// value list (e.g. `Connection: keep-alive`).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Strip hop-by-hop headers, then apply operator substitutions.
    pub fn sanitize(&mut self, substitutions: &[(String, String)]) {
        for name in HOP_BY_HOP {
            self.remove(name);
        }
        for (name, value) in substitutions {
            self.set(name, value);
        }
    }

    fn write_into(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// A client request preamble.
#[derive(Debug, Clone)]
pub struct RequestRecord {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub headers: HeaderMap,
    pub body: BodyFraming,
}

impl RequestRecord {
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// `host:port` form used for CONNECT lines and NoProxy matching.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Origin-form URI for direct requests: absolute URIs are reduced to
    /// their path, everything else passes through.
    pub fn origin_uri(&self) -> String {
        let rest = self
            .uri
            .strip_prefix("http://")
            .or_else(|| self.uri.strip_prefix("https://"));
        match rest {
            Some(rest) => match rest.find('/') {
                Some(idx) => rest[idx..].to_string(),
                None => "/".to_string(),
            },
            None => self.uri.clone(),
        }
    }

    /// Serialize with the given request-target, headers as they currently
    /// stand, re-emitting `Transfer-Encoding` from the framing descriptor.
    pub fn serialize(&self, uri: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_bytes());
        out.push(b' ');
        out.extend_from_slice(uri.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.version.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.headers.write_into(&mut out);
        if self.body == BodyFraming::Chunked && !self.headers.contains("Transfer-Encoding") {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// An upstream response preamble.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body: BodyFraming,
}

impl ResponseRecord {
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.status.to_string().as_bytes());
        if !self.reason.is_empty() {
            out.push(b' ');
            out.extend_from_slice(self.reason.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        self.headers.write_into(&mut out);
        if self.body == BodyFraming::Chunked && !self.headers.contains("Transfer-Encoding") {
            out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// The upstream asked us not to reuse this exchange's connection.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("Connection", "close")
            || self.headers.has_token("Proxy-Connection", "close")
            || (self.version == "HTTP/1.0"
                && !self.headers.has_token("Connection", "keep-alive")
                && !self.headers.has_token("Proxy-Connection", "keep-alive"))
            || self.body == BodyFraming::UntilClose
    }
}

/// Buffered stream wrapper. Keeps read-ahead bytes visible so a tunnel can
/// take over mid-stream without losing data.
pub struct HttpStream<S> {
    stream: S,
    rbuf: Vec<u8>,
    client_side: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> HttpStream<S> {
    pub fn client(stream: S) -> Self {
        Self {
            stream,
            rbuf: Vec::new(),
            client_side: true,
        }
    }

    pub fn upstream(stream: S) -> Self {
        Self {
            stream,
            rbuf: Vec::new(),
            client_side: false,
        }
    }

    /// The raw stream plus any bytes already read past the last preamble.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.rbuf)
    }

    fn map_io(&self, e: std::io::Error) -> GateError {
        if self.client_side {
            GateError::ClientIo(e)
        } else {
            GateError::UpstreamIo(e)
        }
    }

    async fn fill(&mut self) -> GateResult<usize> {
        let mut chunk = [0u8; IO_CHUNK_SIZE];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|e| self.map_io(e))?;
        self.rbuf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Serve buffered bytes first, then the socket.
    async fn read_some(&mut self, buf: &mut [u8]) -> GateResult<usize> {
        if !self.rbuf.is_empty() {
            let n = self.rbuf.len().min(buf.len());
            buf[..n].copy_from_slice(&self.rbuf[..n]);
            self.rbuf.drain(..n);
            return Ok(n);
        }
        self.stream.read(buf).await.map_err(|e| self.map_io(e))
    }

    pub async fn write_all(&mut self, data: &[u8]) -> GateResult<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| self.map_io(e))
    }

    pub async fn flush(&mut self) -> GateResult<()> {
        self.stream.flush().await.map_err(|e| self.map_io(e))
    }

    /// Read up to and including the blank line; `None` on clean EOF before
    /// the first byte.
    async fn read_preamble(&mut self) -> GateResult<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = find_subsequence(&self.rbuf, b"\r\n\r\n") {
                let end = pos + 4;
                let bytes = self.rbuf.drain(..end).collect();
                return Ok(Some(bytes));
            }
            if self.rbuf.len() > MAX_PREAMBLE_BYTES {
                return Err(GateError::Protocol("preamble exceeds 64 KB".into()));
            }
            let n = self.fill().await?;
            if n == 0 {
                if self.rbuf.is_empty() {
                    return Ok(None);
                }
                return Err(GateError::Protocol(
                    "connection closed mid-preamble".into(),
                ));
            }
        }
    }

    /// One raw line including its terminator, for chunk-size and trailer
    /// lines that must round-trip byte-exact.
    async fn read_raw_line(&mut self) -> GateResult<Vec<u8>> {
        loop {
            if let Some(pos) = self.rbuf.iter().position(|&b| b == b'\n') {
                return Ok(self.rbuf.drain(..=pos).collect());
            }
            if self.rbuf.len() > MAX_CHUNK_LINE_BYTES {
                return Err(GateError::Protocol("chunk line exceeds 8 KB".into()));
            }
            let n = self.fill().await?;
            if n == 0 {
                return Err(GateError::Protocol("connection closed mid-chunk".into()));
            }
        }
    }

    /// Parse the next request; `None` means the client closed between
    /// requests (normal keep-alive end).
    pub async fn read_request(&mut self) -> GateResult<Option<RequestRecord>> {
        let raw = match self.read_preamble().await? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        parse_request(&raw).map(Some)
    }

    /// Parse the next response; the request method decides bodyless
    /// statuses.
    pub async fn read_response(&mut self, request_method: &str) -> GateResult<ResponseRecord> {
        let raw = self.read_preamble().await?.ok_or_else(|| {
            self.map_io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before response",
            ))
        })?;
        parse_response(&raw, request_method)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn preamble_lines(raw: &[u8]) -> GateResult<(String, HeaderMap)> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| GateError::Protocol("preamble is not valid UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| GateError::Protocol("missing start line".into()))?
        .to_string();

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation line: folded into the previous value.
            match headers.entries.last_mut() {
                Some((_, value)) => {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                None => {
                    return Err(GateError::Protocol(
                        "continuation line before first header".into(),
                    ))
                }
            }
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| GateError::Protocol(format!("malformed header line: {line}")))?;
        headers.push(name.trim().to_string(), value.trim().to_string());
    }
    Ok((start_line, headers))
}

fn parse_request(raw: &[u8]) -> GateResult<RequestRecord> {
    let (start, headers) = preamble_lines(raw)?;
    let mut parts = start.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| GateError::Protocol("missing request method".into()))?
        .to_string();
    let uri = parts
        .next()
        .ok_or_else(|| GateError::Protocol("missing request target".into()))?
        .to_string();
    let version = parts.next().unwrap_or("HTTP/1.0").to_string();

    let (host, port) = request_host_port(&method, &uri, &headers);
    let body = request_framing(&headers);

    Ok(RequestRecord {
        method,
        uri,
        version,
        host,
        port,
        headers,
        body,
    })
}

fn parse_response(raw: &[u8], request_method: &str) -> GateResult<ResponseRecord> {
    let (start, headers) = preamble_lines(raw)?;
    let mut parts = start.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| GateError::Protocol("missing response version".into()))?
        .to_string();
    if !version.starts_with("HTTP/") {
        return Err(GateError::Protocol(format!(
            "malformed status line: {start}"
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| GateError::Protocol(format!("invalid status code in: {start}")))?;
    let reason = parts.next().unwrap_or("").to_string();
    let body = response_framing(status, request_method, &headers);

    Ok(ResponseRecord {
        version,
        status,
        reason,
        headers,
        body,
    })
}

fn request_host_port(method: &str, uri: &str, headers: &HeaderMap) -> (String, u16) {
    if method.eq_ignore_ascii_case("CONNECT") {
        return split_host_port(uri, 443);
    }
    let rest = uri
        .strip_prefix("http://")
        .or_else(|| uri.strip_prefix("https://"));
    if let Some(rest) = rest {
        let authority = rest.split('/').next().unwrap_or(rest);
        return split_host_port(authority, 80);
    }
    match headers.get("Host") {
        Some(host) => split_host_port(host, 80),
        None => (String::new(), 80),
    }
}

/// Split `host[:port]`, tolerating bracketed IPv6 literals.
pub fn split_host_port(spec: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = spec.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
    }
    match spec.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (spec.to_string(), default_port),
        },
        _ => (spec.to_string(), default_port),
    }
}

fn request_framing(headers: &HeaderMap) -> BodyFraming {
    if headers.has_token("Transfer-Encoding", "chunked") {
        return BodyFraming::Chunked;
    }
    if let Some(len) = headers.get("Content-Length").and_then(|v| v.trim().parse().ok()) {
        return if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::Length(len)
        };
    }
    BodyFraming::None
}

fn response_framing(status: u16, request_method: &str, headers: &HeaderMap) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
        || (request_method.eq_ignore_ascii_case("CONNECT") && (200..300).contains(&status))
    {
        return BodyFraming::None;
    }
    if headers.has_token("Transfer-Encoding", "chunked") {
        return BodyFraming::Chunked;
    }
    if let Some(len) = headers.get("Content-Length").and_then(|v| v.trim().parse().ok()) {
        return if len == 0 {
            BodyFraming::None
        } else {
            BodyFraming::Length(len)
        };
    }
    BodyFraming::UntilClose
}

enum BodySink<'a, W> {
    Stream(&'a mut W),
    Buffer(&'a mut Vec<u8>),
    Discard,
}

impl<W: AsyncRead + AsyncWrite + Unpin> BodySink<'_, HttpStream<W>> {
    async fn write(&mut self, data: &[u8]) -> GateResult<()> {
        match self {
            BodySink::Stream(dst) => dst.write_all(data).await,
            BodySink::Buffer(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
            BodySink::Discard => Ok(()),
        }
    }
}

async fn copy_body<R, W>(
    src: &mut HttpStream<R>,
    mut dst: BodySink<'_, HttpStream<W>>,
    framing: BodyFraming,
) -> GateResult<()>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Length(mut remaining) => {
            let mut chunk = [0u8; IO_CHUNK_SIZE];
            while remaining > 0 {
                let want = (remaining as usize).min(chunk.len());
                let n = src.read_some(&mut chunk[..want]).await?;
                if n == 0 {
                    return Err(GateError::Protocol("body truncated".into()));
                }
                dst.write(&chunk[..n]).await?;
                remaining -= n as u64;
            }
            Ok(())
        }
        BodyFraming::UntilClose => {
            let mut chunk = [0u8; IO_CHUNK_SIZE];
            loop {
                let n = src.read_some(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                dst.write(&chunk[..n]).await?;
            }
        }
        BodyFraming::Chunked => {
            loop {
                let line = src.read_raw_line().await?;
                dst.write(&line).await?;
                let size = parse_chunk_size(&line)?;
                if size == 0 {
                    // Trailers, verbatim until the blank line.
                    loop {
                        let trailer = src.read_raw_line().await?;
                        dst.write(&trailer).await?;
                        if trailer == b"\r\n" || trailer == b"\n" {
                            return Ok(());
                        }
                    }
                }
                // Chunk data plus its terminating CRLF, byte-for-byte.
                let mut remaining = size + 2;
                let mut chunk = [0u8; IO_CHUNK_SIZE];
                while remaining > 0 {
                    let want = remaining.min(chunk.len());
                    let n = src.read_some(&mut chunk[..want]).await?;
                    if n == 0 {
                        return Err(GateError::Protocol("chunk truncated".into()));
                    }
                    dst.write(&chunk[..n]).await?;
                    remaining -= n;
                }
            }
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> GateResult<usize> {
    let text = std::str::from_utf8(line)
        .map_err(|_| GateError::Protocol("chunk size line is not UTF-8".into()))?;
    let size_part = text.trim_end().split(';').next().unwrap_or("");
    usize::from_str_radix(size_part.trim(), 16)
        .map_err(|_| GateError::Protocol(format!("invalid chunk size: {size_part}")))
}

/// Relay a body from `src` to `dst` preserving framing byte-for-byte.
pub async fn relay_body<R, W>(
    src: &mut HttpStream<R>,
    dst: &mut HttpStream<W>,
    framing: BodyFraming,
) -> GateResult<()>
where
    R: AsyncRead + AsyncWrite + Unpin,
    W: AsyncRead + AsyncWrite + Unpin,
{
    copy_body(src, BodySink::Stream(dst), framing).await
}

/// Read a body to completion, discarding it. Used to consume 407 bodies
/// before retrying on the same connection.
pub async fn drain_body<R>(src: &mut HttpStream<R>, framing: BodyFraming) -> GateResult<()>
where
    R: AsyncRead + AsyncWrite + Unpin,
{
    copy_body::<R, R>(src, BodySink::Discard, framing).await
}

/// Read a body to completion into memory (the scanner prefetch path).
pub async fn slurp_body<R>(src: &mut HttpStream<R>, framing: BodyFraming) -> GateResult<Vec<u8>>
where
    R: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    copy_body::<R, R>(src, BodySink::Buffer(&mut buf), framing).await?;
    Ok(buf)
}

/// Canned error response toward the client (headers not yet relayed).
pub fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
    .into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn client_stream(input: &[u8]) -> HttpStream<tokio::io::DuplexStream> {
        let (a, mut b) = tokio::io::duplex(64 * 1024);
        b.write_all(input).await.unwrap();
        drop(b);
        HttpStream::client(a)
    }

    #[tokio::test]
    async fn test_parse_simple_request() {
        let mut s = client_stream(
            b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
        )
        .await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 80);
        assert_eq!(req.body, BodyFraming::None);
        assert_eq!(req.origin_uri(), "/index.html");
        assert_eq!(req.headers.get("accept"), Some("*/*"));
    }

    #[tokio::test]
    async fn test_parse_connect_request() {
        let mut s = client_stream(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n").await;
        let req = s.read_request().await.unwrap().unwrap();
        assert!(req.is_connect());
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 443);
        assert_eq!(req.authority(), "example.com:443");
    }

    #[tokio::test]
    async fn test_clean_eof_yields_none() {
        let mut s = client_stream(b"").await;
        assert!(s.read_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_preamble_is_protocol_error() {
        let mut s = client_stream(b"GET / HTTP/1.1\r\nHost: x\r\n").await;
        assert!(matches!(
            s.read_request().await,
            Err(GateError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_continuation_lines_fold() {
        let mut s = client_stream(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Long: first\r\n second\r\n\tthird\r\n\r\n",
        )
        .await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.headers.get("X-Long"), Some("first second third"));
    }

    #[tokio::test]
    async fn test_duplicate_headers_preserved_in_order() {
        let mut s = client_stream(
            b"GET / HTTP/1.1\r\nHost: x\r\nSet-Thing: one\r\nVia: a\r\nSet-Thing: two\r\n\r\n",
        )
        .await;
        let req = s.read_request().await.unwrap().unwrap();
        let names: Vec<&str> = req.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "Set-Thing", "Via", "Set-Thing"]);
        assert_eq!(req.headers.get("set-thing"), Some("one"));
    }

    #[tokio::test]
    async fn test_header_roundtrip_bytes() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nUser-Agent: curl/8\r\nCookie: a=1\r\nCookie: b=2\r\n\r\n";
        let mut s = client_stream(raw).await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.serialize(&req.uri), raw.to_vec());
    }

    #[tokio::test]
    async fn test_body_framing_precedence() {
        let mut s = client_stream(
            b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await;
        let req = s.read_request().await.unwrap().unwrap();
        assert_eq!(req.body, BodyFraming::Chunked);
    }

    #[tokio::test]
    async fn test_response_framing_rules() {
        let mut s = client_stream(b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let resp = s.read_response("GET").await.unwrap();
        assert_eq!(resp.body, BodyFraming::None);

        let mut s = client_stream(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nabc").await;
        let resp = s.read_response("HEAD").await.unwrap();
        assert_eq!(resp.body, BodyFraming::None);

        let mut s = client_stream(b"HTTP/1.1 200 Connection established\r\n\r\n").await;
        let resp = s.read_response("CONNECT").await.unwrap();
        assert_eq!(resp.body, BodyFraming::None);

        let mut s = client_stream(b"HTTP/1.1 200 OK\r\nServer: x\r\n\r\n").await;
        let resp = s.read_response("GET").await.unwrap();
        assert_eq!(resp.body, BodyFraming::UntilClose);
        assert!(resp.wants_close());
    }

    #[tokio::test]
    async fn test_sanitize_strips_hop_by_hop_and_substitutes() {
        let mut s = client_stream(
            b"GET / HTTP/1.1\r\nHost: x\r\nProxy-Connection: keep-alive\r\nProxy-Authorization: Basic xyz\r\nUser-Agent: curl\r\n\r\n",
        )
        .await;
        let mut req = s.read_request().await.unwrap().unwrap();
        let subs = vec![("User-Agent".to_string(), "Mozilla/5.0".to_string())];
        req.headers.sanitize(&subs);
        assert!(!req.headers.contains("Proxy-Connection"));
        assert!(!req.headers.contains("Proxy-Authorization"));
        assert_eq!(req.headers.get("User-Agent"), Some("Mozilla/5.0"));
        assert_eq!(req.headers.get("Host"), Some("x"));
    }

    #[tokio::test]
    async fn test_chunked_relay_preserves_framing() {
        let body = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\n";
        let mut input = Vec::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
        input.extend_from_slice(body);
        let mut src = client_stream(&input).await;
        let resp = src.read_response("GET").await.unwrap();
        assert_eq!(resp.body, BodyFraming::Chunked);

        let (dst_a, mut dst_b) = tokio::io::duplex(64 * 1024);
        let mut dst = HttpStream::client(dst_a);
        relay_body(&mut src, &mut dst, BodyFraming::Chunked)
            .await
            .unwrap();
        drop(dst);
        let mut out = Vec::new();
        dst_b.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, body.to_vec());
    }

    #[tokio::test]
    async fn test_length_body_slurp_and_drain() {
        let mut s = client_stream(b"hello worldEXTRA").await;
        let body = slurp_body(&mut s, BodyFraming::Length(11)).await.unwrap();
        assert_eq!(body, b"hello world");

        let mut s = client_stream(b"hello").await;
        assert!(drain_body(&mut s, BodyFraming::Length(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_leftover_bytes_survive_into_parts() {
        let mut s =
            client_stream(b"CONNECT h:443 HTTP/1.1\r\n\r\nTUNNELBYTES").await;
        let _req = s.read_request().await.unwrap().unwrap();
        let (_stream, leftover) = s.into_parts();
        assert_eq!(leftover, b"TUNNELBYTES");
    }

    #[test]
    fn test_split_host_port_forms() {
        assert_eq!(split_host_port("example.com:8080", 80), ("example.com".into(), 8080));
        assert_eq!(split_host_port("example.com", 80), ("example.com".into(), 80));
        assert_eq!(split_host_port("[::1]:443", 80), ("::1".into(), 443));
        assert_eq!(split_host_port("[::1]", 80), ("::1".into(), 80));
    }

    #[test]
    fn test_simple_response_shape() {
        let bytes = simple_response(502, "Bad Gateway", "upstream failed");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.ends_with("upstream failed"));
        assert!(text.contains("Content-Length: 15\r\n"));
    }
}
