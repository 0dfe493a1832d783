//! Parent proxy list, sticky round-robin selection, and PAC verdict
//! parsing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{GateError, GateResult};

/// A PAC `DIRECT` verdict is carried as a parent entry so a per-request list
/// can interleave direct attempts with proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    Proxy,
    Direct,
}

/// One upstream proxy. Addresses are resolved lazily, once, and reused for
/// the process lifetime.
#[derive(Debug)]
pub struct ParentProxy {
    pub kind: ParentKind,
    pub hostname: String,
    pub port: u16,
    resolved: Mutex<Option<Vec<SocketAddr>>>,
}

impl Clone for ParentProxy {
    fn clone(&self) -> Self {
        ParentProxy {
            kind: self.kind,
            hostname: self.hostname.clone(),
            port: self.port,
            resolved: Mutex::new(self.resolved.lock().map(|g| g.clone()).unwrap_or(None)),
        }
    }
}

impl ParentProxy {
    pub fn direct() -> Self {
        ParentProxy {
            kind: ParentKind::Direct,
            hostname: String::new(),
            port: 0,
            resolved: Mutex::new(None),
        }
    }

    pub fn new(hostname: &str, port: u16) -> Self {
        ParentProxy {
            kind: ParentKind::Proxy,
            hostname: hostname.to_string(),
            port,
            resolved: Mutex::new(None),
        }
    }

    /// Parse a `host:port` specification; bracketed IPv6 literals allowed.
    pub fn parse(spec: &str) -> GateResult<Self> {
        let spec = spec.trim();
        let (host, port) = crate::http::split_host_port(spec, 0);
        if host.is_empty() || port == 0 {
            return Err(GateError::Config(format!(
                "invalid parent proxy specification: {spec}"
            )));
        }
        Ok(Self::new(&host, port))
    }

    /// Resolved address list, in resolver order. Cached after the first
    /// successful lookup.
    pub async fn addresses(&self) -> GateResult<Vec<SocketAddr>> {
        if let Some(cached) = self.resolved.lock().expect("parent lock").clone() {
            return Ok(cached);
        }
        let target = format!("{}:{}", self.hostname, self.port);
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
            .await
            .map_err(|_| GateError::Resolve(target.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(GateError::Resolve(target));
        }
        *self.resolved.lock().expect("parent lock") = Some(addrs.clone());
        Ok(addrs)
    }

    pub fn label(&self) -> String {
        match self.kind {
            ParentKind::Direct => "DIRECT".to_string(),
            ParentKind::Proxy => format!("{}:{}", self.hostname, self.port),
        }
    }
}

/// Sticky round-robin over the static parent list: the most recently
/// succeeding index is tried first, failures advance through the rest.
#[derive(Debug)]
pub struct ParentSelector {
    parents: Vec<ParentProxy>,
    current: AtomicUsize,
}

impl ParentSelector {
    pub fn new(parents: Vec<ParentProxy>) -> Self {
        Self {
            parents,
            current: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn get(&self, index: usize) -> &ParentProxy {
        &self.parents[index]
    }

    /// Indices in try order for one request: sticky index first, then
    /// round-robin through the remainder.
    pub fn try_order(&self) -> Vec<usize> {
        let n = self.parents.len();
        let start = self.current.load(Ordering::Relaxed) % n.max(1);
        (0..n).map(|i| (start + i) % n).collect()
    }

    /// Remember the index that just worked so the next request starts there.
    pub fn mark_good(&self, index: usize) {
        self.current.store(index, Ordering::Relaxed);
    }
}

/// Parse a PAC verdict string (`"PROXY host:port; DIRECT"`) into an ordered
/// per-request parent list. `PROXY` and `DIRECT` tokens are honored; other
/// token types (`SOCKS`, `HTTPS`, ...) are ignored.
pub fn parse_pac_verdict(verdict: &str) -> Vec<ParentProxy> {
    let mut out = Vec::new();
    for entry in verdict.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let mut parts = entry.split_whitespace();
        let kind = parts.next().unwrap_or("");
        if kind.eq_ignore_ascii_case("DIRECT") {
            out.push(ParentProxy::direct());
            continue;
        }
        if kind.eq_ignore_ascii_case("PROXY") {
            if let Some(endpoint) = parts.next() {
                if let Ok(parent) = ParentProxy::parse(endpoint) {
                    out.push(parent);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_parent_spec() {
        let parent = ParentProxy::parse("proxy.corp.example:3128").unwrap();
        assert_eq!(parent.hostname, "proxy.corp.example");
        assert_eq!(parent.port, 3128);
        assert_eq!(parent.kind, ParentKind::Proxy);

        let parent = ParentProxy::parse("[2001:db8::1]:8080").unwrap();
        assert_eq!(parent.hostname, "2001:db8::1");

        assert!(ParentProxy::parse("no-port").is_err());
        assert!(ParentProxy::parse(":3128").is_err());
        assert!(ParentProxy::parse("host:0").is_err());
    }

    #[test]
    fn test_selector_sticky_rotation() {
        let selector = ParentSelector::new(vec![
            ParentProxy::new("a", 1),
            ParentProxy::new("b", 2),
            ParentProxy::new("c", 3),
        ]);
        assert_eq!(selector.try_order(), vec![0, 1, 2]);

        selector.mark_good(2);
        assert_eq!(selector.try_order(), vec![2, 0, 1]);
    }

    #[test]
    fn test_pac_verdict_parsing() {
        let list = parse_pac_verdict("PROXY p1.example:8080; PROXY p2.example:3128; DIRECT");
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].label(), "p1.example:8080");
        assert_eq!(list[1].label(), "p2.example:3128");
        assert_eq!(list[2].kind, ParentKind::Direct);
    }

    #[test]
    fn test_pac_verdict_ignores_unsupported_tokens() {
        let list = parse_pac_verdict("SOCKS s.example:1080; HTTPS h.example:443; DIRECT");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].kind, ParentKind::Direct);

        assert!(parse_pac_verdict("").is_empty());
        assert!(parse_pac_verdict("PROXY").is_empty());
        assert!(parse_pac_verdict("PROXY garbage").is_empty());
    }

    #[tokio::test]
    async fn test_addresses_resolve_and_cache() {
        let parent = ParentProxy::new("127.0.0.1", 3128);
        let addrs = parent.addresses().await.unwrap();
        assert_eq!(addrs[0], "127.0.0.1:3128".parse().unwrap());
        // Second call served from cache.
        let again = parent.addresses().await.unwrap();
        assert_eq!(addrs, again);
    }
}
