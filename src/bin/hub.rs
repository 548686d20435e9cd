// ABOUTME: The chat broker binary - opens one transport backend and runs the hub until signalled
// ABOUTME: Exits non-zero when the inbound endpoint or TLS credentials cannot be opened

use argh::FromArgs;
use chathub::config::{DEFAULT_PORT, EvictionConfig, HubConfig, PipeConfig};
use chathub::hub::{Backend, Hub};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

/// Multi-user chat broker hub
#[derive(FromArgs)]
struct CliArgs {
    /// whether or not to enable debug logging
    #[argh(switch, short = 'd')]
    debugging: bool,

    /// transport backend, "pipe" or "tls" (default: pipe)
    #[argh(option, short = 't')]
    transport: Option<String>,

    /// listening address for the tls transport (default: 0.0.0.0:8990)
    #[argh(option)]
    listen: Option<String>,

    /// server certificate chain in PEM format (tls transport)
    #[argh(option)]
    cert: Option<PathBuf>,

    /// server private key in PEM format (tls transport)
    #[argh(option)]
    key: Option<PathBuf>,

    /// inbound pipe path (default: /tmp/chat_server_fifo)
    #[argh(option)]
    fifo: Option<PathBuf>,

    /// directory for per-client reply pipes (default: /tmp)
    #[argh(option)]
    fifo_dir: Option<PathBuf>,

    /// maximum concurrent users (default: 50)
    #[argh(option)]
    capacity: Option<usize>,

    /// seconds of inactivity before a user is evicted (default: 30)
    #[argh(option)]
    idle_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: CliArgs = argh::from_env();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debugging {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let backend = match args.transport.as_deref().unwrap_or("pipe") {
        "pipe" => {
            let mut pipe = PipeConfig::default();
            if let Some(path) = args.fifo {
                pipe = pipe.with_server_path(path);
            }
            if let Some(dir) = args.fifo_dir {
                pipe = pipe.with_client_dir(dir);
            }
            Backend::Pipe(pipe)
        }
        "tls" => {
            let (Some(cert), Some(key)) = (args.cert, args.key) else {
                error!("tls transport requires --cert and --key");
                return ExitCode::FAILURE;
            };
            let listen = args
                .listen
                .unwrap_or_else(|| format!("0.0.0.0:{DEFAULT_PORT}"));
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!("invalid listen address {listen:?}: {err}");
                    return ExitCode::FAILURE;
                }
            };
            Backend::Tls { addr, cert, key }
        }
        other => {
            error!("unknown transport {other:?} (expected \"pipe\" or \"tls\")");
            return ExitCode::FAILURE;
        }
    };

    let mut eviction = EvictionConfig::default();
    if let Some(secs) = args.idle_timeout {
        eviction = eviction.with_idle_after(Duration::from_secs(secs));
    }
    let mut cfg = HubConfig::default().with_eviction(eviction);
    if let Some(capacity) = args.capacity {
        cfg = cfg.with_capacity(capacity);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("cannot install SIGTERM handler: {err}");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(true);
    });

    match Hub::run(backend, cfg, shutdown_rx).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}
