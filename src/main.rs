use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ntlmgate::config::{Cli, GateConfig, GateContext, ListenerKind};
use ntlmgate::{detect, forward, ntlm, socks, tunnel};

/// Count of in-flight workers; the dispatcher's shutdown barrier waits for
/// it to drain.
static ACTIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// RAII accounting for one worker. Every spawned worker decrements the
/// barrier exactly once, on drop.
struct WorkerGuard;

impl WorkerGuard {
    fn new() -> Self {
        ACTIVE_WORKERS.fetch_add(1, Ordering::Relaxed);
        WorkerGuard
    }

    fn active() -> usize {
        ACTIVE_WORKERS.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        ACTIVE_WORKERS.fetch_sub(1, Ordering::Relaxed);
    }
}

fn init_tracing(cli: &Cli) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default = if cli.verbose || cli.trace_file.is_some() {
        "ntlmgate=debug"
    } else {
        "ntlmgate=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    if let Some(path) = &cli.trace_file {
        let path = std::path::Path::new(path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
        let appender = tracing_appender::rolling::never(
            dir.unwrap_or_else(|| std::path::Path::new(".")),
            path.file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("ntlmgate-trace.log")),
        );
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        None
    }
}

fn print_hashes(context: &GateContext) {
    let creds = &context.creds;
    if let Some(lm) = &creds.pass_lm {
        println!("PassLM          {}", ntlm::to_hex(&lm[0..16]));
    }
    if let Some(nt) = &creds.pass_nt {
        println!("PassNT          {}", ntlm::to_hex(&nt[0..16]));
    }
    if let Some(v2) = &creds.pass_ntlm2 {
        println!(
            "PassNTLMv2      {}    # Only for user '{}', domain '{}'",
            ntlm::to_hex(v2),
            creds.user,
            creds.domain
        );
    }
}

fn write_pidfile(path: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    Ok(())
}

/// One accept loop per bound listener; each accepted socket becomes a
/// worker of the listener's kind.
async fn accept_loop(
    ctx: Arc<GateContext>,
    listener: TcpListener,
    kind: ListenerKind,
    serialize: bool,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                let kind = kind.clone();
                let guard = WorkerGuard::new();
                let work = async move {
                    let _guard = guard;
                    match kind {
                        ListenerKind::Proxy => forward::proxy_worker(ctx, stream, peer).await,
                        ListenerKind::Socks5 => socks::socks_worker(ctx, stream, peer).await,
                        ListenerKind::Tunnel(target) => {
                            tunnel::tunnel_worker(ctx, stream, peer, target).await
                        }
                    }
                };
                if serialize {
                    work.await;
                } else {
                    tokio::spawn(work);
                }
            }
            Err(e) => {
                warn!("accept error: {e} (continuing)");
            }
        }
    }
}

struct ShutdownSignals {
    int: Signal,
    term: Signal,
    hup: Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(ShutdownSignals {
            int: signal(SignalKind::interrupt())?,
            term: signal(SignalKind::terminate())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) {
        tokio::select! {
            _ = self.int.recv() => {}
            _ = self.term.recv() => {}
            _ = self.hup.recv() => {}
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&cli);
    color_eyre::install()?;

    let config = match GateConfig::build(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };

    if config.print_hashes {
        print_hashes(&config.context);
        return Ok(());
    }

    let context = Arc::new(config.context);

    if let Some(url) = &config.magic_detect {
        detect::magic_auth_detect(&context, url).await?;
        return Ok(());
    }

    info!(
        "Using NTLM hashes: NTLMv2({}) NT({}) LM({})",
        context.creds.use_ntlm2,
        context.creds.use_nt,
        context.creds.use_lm
    );
    if let Some(flags) = context.creds.flags_override {
        info!("Using manual NTLM flags: 0x{flags:08x}");
    }
    let has_socks = config
        .listeners
        .iter()
        .any(|l| l.kind == ListenerKind::Socks5);
    if has_socks && context.socks_users.is_empty() {
        warn!("SOCKS5 proxy will NOT require any authentication");
    }

    // Bind everything before daemon duties; any failure is startup-fatal.
    let mut bound = Vec::new();
    for spec in &config.listeners {
        let listener = TcpListener::bind(spec.addr).await.map_err(|e| {
            error!("cannot bind {}: {e}", spec.addr);
            e
        })?;
        let label = match &spec.kind {
            ListenerKind::Proxy => "proxy".to_string(),
            ListenerKind::Socks5 => "SOCKS5".to_string(),
            ListenerKind::Tunnel(target) => format!("tunnel to {target}"),
        };
        info!("{label} listening on {}", spec.addr);
        bound.push((listener, spec.kind.clone()));
    }

    if let Some(path) = &config.pidfile {
        write_pidfile(path)?;
    }

    let mut accept_tasks = Vec::new();
    for (listener, kind) in bound {
        accept_tasks.push(tokio::spawn(accept_loop(
            Arc::clone(&context),
            listener,
            kind,
            config.serialize,
        )));
    }

    // First signal: stop accepting, wait for in-flight workers. Second
    // signal: leave immediately, the OS reclaims what remains.
    let mut signals = ShutdownSignals::install()?;
    signals.recv().await;
    info!("Signal received, issuing clean shutdown");
    for task in &accept_tasks {
        task.abort();
    }

    let mut waited = 0u64;
    while WorkerGuard::active() > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                waited += 1;
                if waited % 5 == 0 {
                    info!("Still waiting for {} workers...", WorkerGuard::active());
                }
            }
            _ = signals.recv() => {
                warn!(
                    "Signal received again, forcing shutdown with {} active workers",
                    WorkerGuard::active()
                );
                break;
            }
        }
    }

    if let Some(path) = &config.pidfile {
        let _ = std::fs::remove_file(path);
    }
    info!("Terminated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_guard_barrier_accounting() {
        ACTIVE_WORKERS.store(0, Ordering::Relaxed);

        {
            let _one = WorkerGuard::new();
            let _two = WorkerGuard::new();
            assert_eq!(WorkerGuard::active(), 2);
        }

        // Each worker decrements exactly once, on drop; the barrier drains
        // to zero so a graceful shutdown can complete.
        assert_eq!(WorkerGuard::active(), 0);
    }
}
