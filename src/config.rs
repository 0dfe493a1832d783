//! Operator surface: CLI flags, the line-oriented config file, and the
//! frozen runtime context built from both (CLI wins on conflicts).

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use clap::Parser;

use crate::auth::{AuthScheme, Credentials};
use crate::error::{GateError, GateResult};
use crate::noproxy::NoProxyList;
use crate::pac::PacEngine;
use crate::parent::{ParentProxy, ParentSelector};
use crate::pool::ConnectionPool;

const DEFAULT_CONFIG_PATH: &str = "/etc/ntlmgate.conf";

/// Command line interface configuration
#[derive(Parser, Debug, Default)]
#[command(
    author, version,
    about = "NTLM authenticating proxy gateway",
    long_about = "ntlmgate sits between local clients and a corporate proxy that demands\n\
NTLM authentication. Clients use it as a plain HTTP proxy; it performs the\n\
challenge/response handshake upstream, pools authenticated connections, and\n\
relays traffic. It also speaks SOCKS5 and serves fixed CONNECT tunnels.\n\n\
Positional arguments name parent proxies as host:port."
)]
pub struct Cli {
    /// Authentication dialect: ntlm, nt, lm, ntlmv2, ntlm2sr or gss
    #[arg(short = 'a', long = "auth", value_enum)]
    pub auth: Option<AuthScheme>,

    /// Domain/workgroup (can also be given as user@domain)
    #[arg(short = 'd', long)]
    pub domain: Option<String>,

    /// Account name; the user@domain form sets the domain as well
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// NetBIOS workstation name (some proxies check it)
    #[arg(short = 'w', long)]
    pub workstation: Option<String>,

    /// Account password; prefer the config file or -I over this
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// Prompt for the password interactively
    #[arg(short = 'I', long = "interactive")]
    pub interactive: bool,

    /// Pre-computed NT hash (32 hex digits)
    #[arg(long = "pass-nt", value_name = "HEX")]
    pub pass_nt: Option<String>,

    /// Pre-computed LM hash (32 hex digits)
    #[arg(long = "pass-lm", value_name = "HEX")]
    pub pass_lm: Option<String>,

    /// Pre-computed NTLMv2 hash (32 hex digits, bound to user and domain)
    #[arg(long = "pass-ntlm2", value_name = "HEX")]
    pub pass_ntlm2: Option<String>,

    /// Raw NTLM negotiate flags override, e.g. 0xa208b205
    #[arg(short = 'F', long = "flags", value_name = "FLAGS")]
    pub flags: Option<String>,

    /// Proxy listener as [addr:]port (repeatable)
    #[arg(short = 'l', long = "listen", value_name = "[ADDR:]PORT")]
    pub listen: Vec<String>,

    /// SOCKS5 listener as [addr:]port (repeatable)
    #[arg(short = 'O', long = "socks5-listen", value_name = "[ADDR:]PORT")]
    pub socks5_listen: Vec<String>,

    /// Fixed tunnel as [laddr:]lport:rhost:rport (repeatable)
    #[arg(short = 'L', long = "tunnel", value_name = "SPEC")]
    pub tunnel: Vec<String>,

    /// Hostname wildcards served by direct connection, comma-separated
    #[arg(short = 'N', long = "no-proxy", value_name = "PATTERNS")]
    pub no_proxy: Vec<String>,

    /// SOCKS5 user as user:pass (repeatable; absent list disables auth)
    #[arg(short = 'R', long = "socks5-user", value_name = "USER:PASS")]
    pub socks5_user: Vec<String>,

    /// Header substitution "Name: value" added/replaced in client requests
    #[arg(short = 'r', long = "header", value_name = "HEADER")]
    pub header: Vec<String>,

    /// Write a PID file after a successful start
    #[arg(short = 'P', long = "pidfile", value_name = "FILE")]
    pub pidfile: Option<String>,

    /// Request logging: 0 none (default), 1 log method and URL
    #[arg(short = 'q', long = "request-log", value_parser = clap::value_parser!(u8).range(0..=1))]
    pub request_log: Option<u8>,

    /// Redirect debug output to a trace file (implies -v)
    #[arg(short = 'T', long = "trace-file", value_name = "FILE")]
    pub trace_file: Option<String>,

    /// Debug logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Try all NTLM dialects against this URL and report which authenticate
    #[arg(short = 'M', long = "magic-detect", value_name = "URL")]
    pub magic_detect: Option<String>,

    /// Print password hashes for config-file use and exit
    #[arg(short = 'H', long = "print-hashes")]
    pub print_hashes: bool,

    /// PAC file with FindProxyForURL
    #[arg(short = 'x', long = "pac-file", value_name = "FILE")]
    pub pac_file: Option<String>,

    /// Gateway mode: listen on all interfaces, not only loopback
    #[arg(short = 'g', long)]
    pub gateway: bool,

    /// NTLM-to-basic: take credentials from each client's Basic header
    #[arg(short = 'B', long = "ntlm-to-basic")]
    pub ntlm_to_basic: bool,

    /// User-Agent wildcard for the ISA scanner workaround (repeatable)
    #[arg(short = 'G', long = "scanner-agent", value_name = "PATTERN")]
    pub scanner_agent: Vec<String>,

    /// ISA scanner workaround for bodies below this many KB
    #[arg(short = 'S', long = "scanner-size", value_name = "KB")]
    pub scanner_size: Option<u64>,

    /// Serialize all work on one task - for debugging only
    #[arg(short = 's', long)]
    pub serialize: bool,

    /// Configuration file (key value lines; CLI overrides it)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<String>,

    /// Parent proxies as host:port
    #[arg(value_name = "PARENT")]
    pub parents: Vec<String>,
}

/// Parsed config file: ordered `key value` pairs, consumed by `pop` calls so
/// leftovers can be reported as unknown.
#[derive(Debug, Default)]
pub struct ConfigFile {
    options: Vec<(String, String)>,
}

impl ConfigFile {
    pub fn load(path: &str) -> GateResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("cannot access config file {path}: {e}")))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut options = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.split_once(char::is_whitespace) {
                Some((key, value)) => (key, value.trim()),
                None => (line, ""),
            };
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            options.push((key.to_string(), value.to_string()));
        }
        ConfigFile { options }
    }

    /// Remove and return every value for `key` (case-insensitive).
    pub fn pop_all(&mut self, key: &str) -> Vec<String> {
        let mut values = Vec::new();
        self.options.retain(|(k, v)| {
            if k.eq_ignore_ascii_case(key) {
                values.push(v.clone());
                false
            } else {
                true
            }
        });
        values
    }

    /// Remove and return the first value for `key`.
    pub fn pop(&mut self, key: &str) -> Option<String> {
        self.pop_all(key).into_iter().next()
    }

    /// `yes` check for boolean keys.
    pub fn pop_yes(&mut self, key: &str) -> bool {
        self.pop(key)
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false)
    }

    /// Keys never consumed; the caller logs them.
    pub fn leftover_keys(&self) -> Vec<&str> {
        self.options.iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// What kind of service a bound listener provides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerKind {
    Proxy,
    Socks5,
    /// Fixed tunnel with its `host:port` target.
    Tunnel(String),
}

#[derive(Debug, Clone)]
pub struct ListenerSpec {
    pub addr: SocketAddr,
    pub kind: ListenerKind,
}

/// Read-only state shared by every worker, frozen after startup.
pub struct GateContext {
    pub creds: Credentials,
    pub scheme: AuthScheme,
    pub selector: ParentSelector,
    pub pool: ConnectionPool,
    pub noproxy: NoProxyList,
    pub header_subs: Vec<(String, String)>,
    pub socks_users: HashMap<String, String>,
    pub scanner_agents: Vec<String>,
    pub scanner_max_bytes: u64,
    pub ntlm_to_basic: bool,
    pub request_log: u8,
    pub pac: Option<PacEngine>,
}

/// Everything `main` needs to run the dispatcher.
pub struct GateConfig {
    pub listeners: Vec<ListenerSpec>,
    pub pidfile: Option<String>,
    pub serialize: bool,
    pub magic_detect: Option<String>,
    pub print_hashes: bool,
    pub context: GateContext,
}

fn bind_ip(gateway: bool) -> IpAddr {
    if gateway {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }
}

fn resolve_bind(host: &str, port: u16) -> GateResult<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| GateError::Config(format!("cannot resolve listen address {host}:{port}")))
}

/// Parse a `[addr:]port` listener specification.
pub fn parse_listen_spec(spec: &str, gateway: bool) -> GateResult<SocketAddr> {
    let spec = spec.trim();
    if let Ok(port) = spec.parse::<u16>() {
        if port == 0 {
            return Err(GateError::Config(format!("invalid listen port: {spec}")));
        }
        return Ok(SocketAddr::new(bind_ip(gateway), port));
    }
    let (host, port) = crate::http::split_host_port(spec, 0);
    if port == 0 || host.is_empty() {
        return Err(GateError::Config(format!("invalid listen address: {spec}")));
    }
    resolve_bind(&host, port)
}

/// Parse a `[laddr:]lport:rhost:rport` tunnel specification.
pub fn parse_tunnel_spec(spec: &str, gateway: bool) -> GateResult<(SocketAddr, String)> {
    let fields: Vec<&str> = spec.trim().split(':').collect();
    let (local, rhost, rport) = match fields.len() {
        3 => (
            SocketAddr::new(
                bind_ip(gateway),
                fields[0]
                    .parse::<u16>()
                    .map_err(|_| GateError::Config(format!("invalid tunnel local port: {spec}")))?,
            ),
            fields[1],
            fields[2],
        ),
        4 => {
            let port = fields[1]
                .parse::<u16>()
                .map_err(|_| GateError::Config(format!("invalid tunnel local port: {spec}")))?;
            (resolve_bind(fields[0], port)?, fields[2], fields[3])
        }
        _ => {
            return Err(GateError::Config(format!(
                "tunnel specification incorrect ([laddr:]lport:rhost:rport): {spec}"
            )))
        }
    };
    if rhost.is_empty() || rport.parse::<u16>().is_err() {
        return Err(GateError::Config(format!("invalid tunnel target: {spec}")));
    }
    Ok((local, format!("{rhost}:{rport}")))
}

/// Parse a `"Name: value"` header substitution.
pub fn parse_header_spec(spec: &str) -> GateResult<(String, String)> {
    match spec.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(GateError::Config(format!("invalid header format: {spec}"))),
    }
}

fn parse_user_pass(spec: &str) -> GateResult<(String, String)> {
    match spec.split_once(':') {
        Some((user, pass)) if !user.is_empty() && !pass.is_empty() => {
            Ok((user.to_string(), pass.to_string()))
        }
        _ => Err(GateError::Config(format!(
            "invalid username:password format: {spec}"
        ))),
    }
}

/// strtoul-style parse with base detection (`0x` hex, leading `0` octal,
/// decimal otherwise).
fn parse_flags(s: &str) -> GateResult<u32> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| GateError::Config(format!("invalid NTLM flags value: {s}")))
}

fn workstation_default() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "ntlmgate".to_string())
}

fn prompt_password() -> GateResult<String> {
    use std::io::{BufRead, Write};
    eprint!("Password: ");
    std::io::stderr()
        .flush()
        .map_err(|e| GateError::Config(format!("cannot prompt for password: {e}")))?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| GateError::Config(format!("cannot read password: {e}")))?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

impl GateConfig {
    /// Merge CLI and config file into the frozen runtime configuration.
    pub fn build(cli: Cli) -> GateResult<Self> {
        let mut cf = match &cli.config {
            Some(path) => ConfigFile::load(path)?,
            None => match ConfigFile::load(DEFAULT_CONFIG_PATH) {
                Ok(cf) => {
                    tracing::debug!("loaded default config file {DEFAULT_CONFIG_PATH}");
                    cf
                }
                Err(_) => ConfigFile::default(),
            },
        };

        let gateway = cli.gateway || cf.pop_yes("Gateway");
        let ntlm_to_basic = cli.ntlm_to_basic || cf.pop_yes("NTLMToBasic");

        // Listeners: CLI first, then the config file's remainder.
        let mut listeners = Vec::new();
        for spec in cli.listen.iter().chain(cf.pop_all("Listen").iter()) {
            listeners.push(ListenerSpec {
                addr: parse_listen_spec(spec, gateway)?,
                kind: ListenerKind::Proxy,
            });
        }
        for spec in cli.socks5_listen.iter().chain(cf.pop_all("SOCKS5Proxy").iter()) {
            listeners.push(ListenerSpec {
                addr: parse_listen_spec(spec, gateway)?,
                kind: ListenerKind::Socks5,
            });
        }
        for spec in cli.tunnel.iter().chain(cf.pop_all("Tunnel").iter()) {
            let (addr, target) = parse_tunnel_spec(spec, gateway)?;
            listeners.push(ListenerSpec {
                addr,
                kind: ListenerKind::Tunnel(target),
            });
        }

        // Parent proxies: positional arguments first, config file after.
        let mut parents = Vec::new();
        for spec in cli.parents.iter().chain(cf.pop_all("Proxy").iter()) {
            parents.push(ParentProxy::parse(spec)?);
        }

        let mut noproxy = NoProxyList::default();
        for spec in cli.no_proxy.iter().chain(cf.pop_all("NoProxy").iter()) {
            noproxy.add_spec(spec);
        }

        let mut header_subs: Vec<(String, String)> = Vec::new();
        for spec in cli.header.iter().chain(cf.pop_all("Header").iter()) {
            match parse_header_spec(spec) {
                Ok(sub) => {
                    // CLI comes first, so on duplicate names it wins.
                    if !header_subs.iter().any(|(n, _)| n.eq_ignore_ascii_case(&sub.0)) {
                        header_subs.push(sub);
                    }
                }
                Err(e) => tracing::error!("{e}"),
            }
        }

        let mut socks_users = HashMap::new();
        for spec in cli.socks5_user.iter().chain(cf.pop_all("SOCKS5Users").iter()) {
            let (user, pass) = parse_user_pass(spec)?;
            socks_users.insert(user, pass);
        }

        let mut scanner_agents: Vec<String> = cli
            .scanner_agent
            .iter()
            .chain(cf.pop_all("ISAScannerAgent").iter())
            .filter(|p| !p.is_empty())
            .map(|p| format!("*{p}*"))
            .collect();
        let mut scanner_max_kb = cli.scanner_size.unwrap_or(0);
        if scanner_max_kb == 0 {
            if let Some(v) = cf.pop("ISAScannerSize") {
                scanner_max_kb = v.parse().unwrap_or(0);
            }
        }
        if !scanner_agents.is_empty() && scanner_max_kb == 0 {
            scanner_max_kb = 1;
        }
        if scanner_max_kb > 0 && scanner_agents.is_empty() {
            // A size alone enables the workaround for every agent.
            scanner_agents.push("*".to_string());
        }

        // Credential material.
        let scheme = cli
            .auth
            .or_else(|| cf.pop("Auth").and_then(|v| AuthScheme::parse(&v)))
            .unwrap_or(AuthScheme::Ntlm);

        let (user, mut domain) = match cli.user.clone().or_else(|| cf.pop("Username")) {
            Some(user) => match user.split_once('@') {
                Some((u, d)) => (u.to_string(), Some(d.to_string())),
                None => (user, None),
            },
            None => (String::new(), None),
        };
        if domain.is_none() {
            domain = cli.domain.clone().or_else(|| cf.pop("Domain"));
        }
        let domain = domain.unwrap_or_default();
        let workstation = cli
            .workstation
            .clone()
            .or_else(|| cf.pop("Workstation"))
            .unwrap_or_else(workstation_default);

        let all_schemes = cli.magic_detect.is_some() || cli.print_hashes;
        let mut password = cli.password.clone().or_else(|| cf.pop("Password"));
        if password.is_none() && (cli.interactive || all_schemes) && !ntlm_to_basic {
            password = Some(prompt_password()?);
        }

        let mut creds = match password {
            Some(password) => {
                let creds = if all_schemes {
                    Credentials::from_password_all(&password, &user, &domain, &workstation, scheme)?
                } else {
                    Credentials::from_password(&password, &user, &domain, &workstation, scheme)?
                };
                // Zero the plaintext before dropping it.
                let mut bytes = password.into_bytes();
                bytes.iter_mut().for_each(|b| *b = 0);
                creds
            }
            None => Credentials::from_hashes(
                cli.pass_nt.clone().or_else(|| cf.pop("PassNT")).as_deref(),
                cli.pass_lm.clone().or_else(|| cf.pop("PassLM")).as_deref(),
                cli.pass_ntlm2
                    .clone()
                    .or_else(|| cf.pop("PassNTLMv2"))
                    .as_deref(),
                &user,
                &domain,
                &workstation,
                scheme,
            )?,
        };

        if let Some(flags) = cli.flags.clone().or_else(|| cf.pop("Flags")) {
            creds.flags_override = Some(parse_flags(&flags)?);
        }

        // PAC engine.
        let pac_requested = cli.pac_file.is_some() || cf.pop_yes("Pac");
        let pac_file = cli.pac_file.clone().or_else(|| cf.pop("PacFile"));
        let pac = match (pac_requested, pac_file) {
            (true, Some(path)) => Some(PacEngine::load(&path)?),
            (true, None) => {
                return Err(GateError::Config(
                    "PAC requested but no PAC file given".into(),
                ))
            }
            _ => None,
        };

        let request_log = cli.request_log.unwrap_or_else(|| {
            cf.pop("RequestLog")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        });
        let pidfile = cli.pidfile.clone().or_else(|| cf.pop("PidFile"));

        for key in cf.leftover_keys() {
            tracing::info!("Ignoring config file option: {key}");
        }

        // Startup validation.
        let utility_mode = cli.print_hashes;
        if parents.is_empty() && pac.is_none() && !utility_mode {
            return Err(GateError::Config("Parent proxy address missing".into()));
        }
        if listeners.is_empty() && !utility_mode && cli.magic_detect.is_none() {
            return Err(GateError::Config(
                "No proxy service ports were configured".into(),
            ));
        }
        if !ntlm_to_basic && !utility_mode && !creds.complete() {
            return Err(GateError::Config(
                "Parent proxy account password (or required hashes) missing".into(),
            ));
        }

        Ok(GateConfig {
            listeners,
            pidfile,
            serialize: cli.serialize,
            magic_detect: cli.magic_detect.clone(),
            print_hashes: cli.print_hashes,
            context: GateContext {
                creds,
                scheme,
                selector: ParentSelector::new(parents),
                pool: ConnectionPool::new(),
                noproxy,
                header_subs,
                socks_users,
                scanner_agents,
                scanner_max_bytes: scanner_max_kb * 1024,
                ntlm_to_basic,
                request_log,
                pac,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_parsing() {
        let mut cf = ConfigFile::parse(
            "# comment\n\
             Username  corpuser\n\
             Proxy     p1.example:3128\n\
             Proxy     p2.example:3128\n\
             Header    \"User-Agent: Mozilla/5.0\"\n\
             Gateway   yes\n\
             Mystery   what\n",
        );
        assert_eq!(cf.pop("Username").as_deref(), Some("corpuser"));
        assert_eq!(
            cf.pop_all("Proxy"),
            vec!["p1.example:3128", "p2.example:3128"]
        );
        assert_eq!(cf.pop("Header").as_deref(), Some("User-Agent: Mozilla/5.0"));
        assert!(cf.pop_yes("Gateway"));
        assert_eq!(cf.leftover_keys(), vec!["Mystery"]);
    }

    #[test]
    fn test_listen_spec_forms() {
        let addr = parse_listen_spec("3128", false).unwrap();
        assert_eq!(addr, "127.0.0.1:3128".parse().unwrap());

        let addr = parse_listen_spec("3128", true).unwrap();
        assert_eq!(addr, "0.0.0.0:3128".parse().unwrap());

        let addr = parse_listen_spec("10.0.0.5:8080", false).unwrap();
        assert_eq!(addr, "10.0.0.5:8080".parse().unwrap());

        assert!(parse_listen_spec("0", false).is_err());
        assert!(parse_listen_spec("nonsense", false).is_err());
    }

    #[test]
    fn test_tunnel_spec_forms() {
        let (addr, target) = parse_tunnel_spec("2222:ssh.example:22", false).unwrap();
        assert_eq!(addr, "127.0.0.1:2222".parse().unwrap());
        assert_eq!(target, "ssh.example:22");

        let (addr, target) = parse_tunnel_spec("0.0.0.0:2222:ssh.example:22", false).unwrap();
        assert_eq!(addr, "0.0.0.0:2222".parse().unwrap());
        assert_eq!(target, "ssh.example:22");

        assert!(parse_tunnel_spec("2222:ssh.example", false).is_err());
        assert!(parse_tunnel_spec("2222:ssh.example:notaport", false).is_err());
    }

    #[test]
    fn test_header_spec() {
        let (name, value) = parse_header_spec("User-Agent: Mozilla/5.0").unwrap();
        assert_eq!(name, "User-Agent");
        assert_eq!(value, "Mozilla/5.0");
        assert!(parse_header_spec("no colon here").is_err());
    }

    #[test]
    fn test_flags_parse_bases() {
        assert_eq!(parse_flags("0xa208b205").unwrap(), 0xa208b205);
        assert_eq!(parse_flags("17").unwrap(), 17);
        assert_eq!(parse_flags("010").unwrap(), 8);
        assert!(parse_flags("0xzz").is_err());
    }

    #[test]
    fn test_build_user_at_domain_and_validation() {
        let cli = Cli {
            user: Some("alice@CORP".to_string()),
            password: Some("secret".to_string()),
            listen: vec!["3128".to_string()],
            parents: vec!["proxy.example:3128".to_string()],
            ..Default::default()
        };
        let config = GateConfig::build(cli).unwrap();
        assert_eq!(config.context.creds.user, "alice");
        assert_eq!(config.context.creds.domain, "CORP");
        assert!(config.context.creds.complete());
        assert_eq!(config.listeners.len(), 1);
    }

    #[test]
    fn test_build_requires_parent_and_credentials() {
        let cli = Cli {
            listen: vec!["3128".to_string()],
            password: Some("pw".to_string()),
            ..Default::default()
        };
        assert!(matches!(GateConfig::build(cli), Err(GateError::Config(_))));

        let cli = Cli {
            listen: vec!["3128".to_string()],
            parents: vec!["proxy.example:3128".to_string()],
            ..Default::default()
        };
        assert!(matches!(GateConfig::build(cli), Err(GateError::Config(_))));
    }

    #[test]
    fn test_build_ntlm_to_basic_needs_no_password() {
        let cli = Cli {
            ntlm_to_basic: true,
            listen: vec!["3128".to_string()],
            parents: vec!["proxy.example:3128".to_string()],
            ..Default::default()
        };
        let config = GateConfig::build(cli).unwrap();
        assert!(config.context.ntlm_to_basic);
        assert!(!config.context.creds.complete());
    }

    #[test]
    fn test_scanner_settings_coupling() {
        let cli = Cli {
            scanner_agent: vec!["Wget".to_string()],
            password: Some("pw".to_string()),
            listen: vec!["3128".to_string()],
            parents: vec!["proxy.example:3128".to_string()],
            ..Default::default()
        };
        let config = GateConfig::build(cli).unwrap();
        assert_eq!(config.context.scanner_agents, vec!["*Wget*"]);
        assert_eq!(config.context.scanner_max_bytes, 1024);
    }
}
