//! Proxy Auto-Configuration support.
//!
//! The PAC script is evaluated with `boa_engine`. A fresh JS context is built
//! per evaluation (the interpreter is not re-entrant), and evaluations are
//! serialized behind a mutex; that mutex is a correctness requirement, not an
//! optimization artifact.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::sync::Mutex;

use boa_engine::{js_string, Context, JsArgs, JsResult, JsString, JsValue, NativeFunction, Source};

use crate::error::{GateError, GateResult};
use crate::noproxy::wildcard_match;

pub struct PacEngine {
    script: String,
    lock: Mutex<()>,
}

impl PacEngine {
    /// Load the PAC script from a local file.
    pub fn load(path: &str) -> GateResult<Self> {
        let script = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("cannot read PAC file {path}: {e}")))?;
        Ok(PacEngine {
            script,
            lock: Mutex::new(()),
        })
    }

    #[cfg(test)]
    pub fn from_script(script: &str) -> Self {
        PacEngine {
            script: script.to_string(),
            lock: Mutex::new(()),
        }
    }

    /// Evaluate `FindProxyForURL(url, host)` and return the raw verdict
    /// string (e.g. `"PROXY p:8080; DIRECT"`).
    ///
    /// Blocking: runs the interpreter and may perform synchronous DNS
    /// lookups through the PAC helpers. Async callers go through
    /// `tokio::task::spawn_blocking`.
    pub fn find_proxy(&self, url: &str, host: &str) -> GateResult<String> {
        let _guard = self.lock.lock().expect("pac lock");

        let mut context = Context::default();
        register_helpers(&mut context)
            .map_err(|e| GateError::Config(format!("PAC helper registration failed: {e}")))?;

        context
            .eval(Source::from_bytes(self.script.as_bytes()))
            .map_err(|e| GateError::Config(format!("PAC script error: {e}")))?;

        let call = format!(
            "FindProxyForURL(\"{}\", \"{}\")",
            escape_js(url),
            escape_js(host)
        );
        let verdict = context
            .eval(Source::from_bytes(call.as_bytes()))
            .map_err(|e| GateError::Protocol(format!("FindProxyForURL failed: {e}")))?;
        let verdict = verdict
            .to_string(&mut context)
            .map_err(|e| GateError::Protocol(format!("PAC verdict not a string: {e}")))?;
        Ok(verdict.to_std_string_escaped())
    }
}

fn escape_js(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn arg_string(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Some(v4);
        }
    }
    None
}

fn is_plain_host_name(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?;
    Ok(JsValue::from(!host.contains('.')))
}

fn dns_domain_is(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?.to_ascii_lowercase();
    let domain = arg_string(args, 1, ctx)?.to_ascii_lowercase();
    Ok(JsValue::from(host.ends_with(&domain)))
}

fn local_host_or_domain_is(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?.to_ascii_lowercase();
    let hostdom = arg_string(args, 1, ctx)?.to_ascii_lowercase();
    let matched = host == hostdom
        || (!host.contains('.') && hostdom.starts_with(&format!("{host}.")));
    Ok(JsValue::from(matched))
}

fn is_resolvable(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?;
    Ok(JsValue::from(resolve_ipv4(&host).is_some()))
}

fn dns_resolve(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?;
    match resolve_ipv4(&host) {
        Some(ip) => Ok(JsValue::from(JsString::from(ip.to_string()))),
        None => Ok(JsValue::null()),
    }
}

fn my_ip_address(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(js_string!("127.0.0.1")))
}

fn is_in_net(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?;
    let pattern = arg_string(args, 1, ctx)?;
    let mask = arg_string(args, 2, ctx)?;

    let host_ip = host
        .parse::<Ipv4Addr>()
        .ok()
        .or_else(|| resolve_ipv4(&host));
    let (Some(host_ip), Ok(pattern), Ok(mask)) = (
        host_ip,
        pattern.parse::<Ipv4Addr>(),
        mask.parse::<Ipv4Addr>(),
    ) else {
        return Ok(JsValue::from(false));
    };
    let host_bits = u32::from(host_ip);
    let pattern_bits = u32::from(pattern);
    let mask_bits = u32::from(mask);
    Ok(JsValue::from(host_bits & mask_bits == pattern_bits & mask_bits))
}

fn dns_domain_levels(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let host = arg_string(args, 0, ctx)?;
    Ok(JsValue::from(host.matches('.').count() as i32))
}

fn sh_exp_match(_: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let text = arg_string(args, 0, ctx)?;
    let pattern = arg_string(args, 1, ctx)?;
    Ok(JsValue::from(wildcard_match(&pattern, &text)))
}

fn range_stub(_: &JsValue, _: &[JsValue], _: &mut Context) -> JsResult<JsValue> {
    Ok(JsValue::from(false))
}

fn register_helpers(context: &mut Context) -> JsResult<()> {
    context.register_global_callable(
        js_string!("isPlainHostName"),
        1,
        NativeFunction::from_fn_ptr(is_plain_host_name),
    )?;
    context.register_global_callable(
        js_string!("dnsDomainIs"),
        2,
        NativeFunction::from_fn_ptr(dns_domain_is),
    )?;
    context.register_global_callable(
        js_string!("localHostOrDomainIs"),
        2,
        NativeFunction::from_fn_ptr(local_host_or_domain_is),
    )?;
    context.register_global_callable(
        js_string!("isResolvable"),
        1,
        NativeFunction::from_fn_ptr(is_resolvable),
    )?;
    context.register_global_callable(
        js_string!("dnsResolve"),
        1,
        NativeFunction::from_fn_ptr(dns_resolve),
    )?;
    context.register_global_callable(
        js_string!("myIpAddress"),
        0,
        NativeFunction::from_fn_ptr(my_ip_address),
    )?;
    context.register_global_callable(
        js_string!("isInNet"),
        3,
        NativeFunction::from_fn_ptr(is_in_net),
    )?;
    context.register_global_callable(
        js_string!("dnsDomainLevels"),
        1,
        NativeFunction::from_fn_ptr(dns_domain_levels),
    )?;
    context.register_global_callable(
        js_string!("shExpMatch"),
        2,
        NativeFunction::from_fn_ptr(sh_exp_match),
    )?;
    context.register_global_callable(
        js_string!("weekdayRange"),
        1,
        NativeFunction::from_fn_ptr(range_stub),
    )?;
    context.register_global_callable(
        js_string!("dateRange"),
        1,
        NativeFunction::from_fn_ptr(range_stub),
    )?;
    context.register_global_callable(
        js_string!("timeRange"),
        1,
        NativeFunction::from_fn_ptr(range_stub),
    )?;
    Ok(())
}
