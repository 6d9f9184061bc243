use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use drop_detect_rs::config::{ProberConfig, TargetConfig};
use drop_detect_rs::dashboard::{Dashboard, LogDashboard};
use drop_detect_rs::error::{HandshakeError, SessionError};
use drop_detect_rs::ports::chunk_count;
use drop_detect_rs::prober::{self, ProberOutcome};
use drop_detect_rs::{report, target};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const EXIT_FAILURE: u8 = 1;
const EXIT_PRIVILEGE: u8 = 2;
const EXIT_REJECTED: u8 = 2;
const EXIT_DATA_PORT_TIMEOUT: u8 = 3;
const EXIT_NO_SESSION: u8 = 4;
const EXIT_PROTOCOL: u8 = 5;

/// drop-detect-rs: find out which TCP ports something between two hosts is interfering with.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "drop-detect-rs",
    version,
    about = "Tests whether a network drops, refuses or tampers with TCP connections, port by port.",
    long_about = "Run one side with --server (the target, which listens on every port under test) \
                  and the other without (the prober, which connects to each port). Ports are \
                  classified as accept, close (refused), drop (timed out) or srverr (bad reply)."
)]
struct Cli {
    /// Run as the target (listening) side.
    #[arg(short = 's', long)]
    server: bool,

    /// Target IP. On the target, the address to bind.
    #[arg(short = 'i', long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    ip: IpAddr,

    /// Data port used for the control channel. It must not be blocked.
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// First port to test (inclusive).
    #[arg(short = 'r', long, default_value_t = 1)]
    start: u32,

    /// End of the port range (exclusive).
    #[arg(short = 'e', long, default_value_t = 1025)]
    end: u32,

    /// Ports per worker.
    #[arg(short = 'c', long, default_value_t = 100)]
    chunk: u32,

    /// Seconds to wait after a refused connection before retrying.
    #[arg(short = 'd', long, default_value_t = 1.0)]
    delay: f64,

    /// Socket timeout in seconds.
    #[arg(short = 't', long, default_value_t = 3)]
    timeout: u64,

    /// Heartbeat period in seconds.
    #[arg(long, default_value_t = 1)]
    heartbeat: u64,

    /// Max concurrently running probe workers.
    #[arg(long = "max-workers", default_value_t = 256)]
    max_workers: usize,

    /// Write a text report to this path.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    json: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    print_config(&cli);

    if cli.server {
        run_server(&cli).await
    } else {
        run_client(&cli).await
    }
}

fn print_config(cli: &Cli) {
    println!("drop-detect-rs configuration:");
    println!("  role         : {}", if cli.server { "target" } else { "prober" });
    println!("  ip           : {}", cli.ip);
    println!("  data port    : {}", cli.port);
    if cli.server {
        return;
    }
    println!("  port range   : {}-{} (end exclusive)", cli.start, cli.end);
    println!("  chunk        : {}", cli.chunk);
    println!("  delay        : {}s", cli.delay);
    println!("  timeout      : {}s", cli.timeout);
    println!("  heartbeat    : {}s", cli.heartbeat);
    println!("  max workers  : {}", cli.max_workers);
    println!(
        "  output       : {}",
        cli.output
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
}

async fn run_server(cli: &Cli) -> ExitCode {
    let cfg = TargetConfig::new(cli.ip, cli.port);
    if !cfg.privileged {
        warn!("not running as root; sessions starting below port 1024 will be refused");
    }
    match target::run_target(&cfg).await {
        Ok(run) => {
            info!(chunks = run.chunks, answered = run.listen.answered, "Done!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            match e.downcast_ref::<HandshakeError>() {
                Some(HandshakeError::InsufficientPrivilege { .. }) => ExitCode::from(EXIT_PRIVILEGE),
                _ => ExitCode::from(EXIT_FAILURE),
            }
        }
    }
}

async fn run_client(cli: &Cli) -> ExitCode {
    if !cli.delay.is_finite() || cli.delay < 0.0 {
        error!("delay must be a non-negative number of seconds");
        return ExitCode::from(EXIT_FAILURE);
    }
    let cfg = ProberConfig {
        server: cli.ip,
        data_port: cli.port,
        port_start: cli.start,
        port_end: cli.end,
        chunk: cli.chunk,
        timeout_secs: cli.timeout,
        delay: Duration::from_secs_f64(cli.delay),
        heartbeat_secs: cli.heartbeat,
        max_workers: cli.max_workers,
    };
    let dashboard: Arc<dyn Dashboard> = Arc::new(LogDashboard::new(
        cfg.total_ports() as u64,
        chunk_count(cfg.port_start, cfg.port_end, cfg.chunk) as u64,
    ));

    // Ctrl-C stops the workers between ports; results so far are still reported.
    let interrupt = CancellationToken::new();
    let interrupt_ctrlc = interrupt.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        interrupt_ctrlc.cancel();
    });

    let run = match prober::run_prober(&cfg, dashboard.clone(), interrupt).await {
        Ok(ProberOutcome::Completed(run)) => run,
        Ok(ProberOutcome::Rejected(_)) => return ExitCode::from(EXIT_REJECTED),
        Ok(ProberOutcome::NoSession) => return ExitCode::from(EXIT_NO_SESSION),
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(prober_exit_code(&e));
        }
    };

    if let Some(path) = cli.output.as_deref() {
        match report::write_text(path, &run.info, &run.results) {
            Ok(()) => dashboard.notify(&format!("Saved output to {}", path.display())),
            Err(e) => error!("{e:#}"),
        }
    }
    if let Some(path) = cli.json.as_deref() {
        match report::write_json(path, &run.info, &run.results) {
            Ok(()) => dashboard.notify(&format!("Wrote JSON results to {}", path.display())),
            Err(e) => error!("{e:#}"),
        }
    }

    let end = run.heartbeat.finish().await;
    debug!(?end, "heartbeat stopped");
    ExitCode::SUCCESS
}

fn prober_exit_code(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<SessionError>() {
        Some(SessionError::Connect { .. }) => EXIT_FAILURE,
        Some(SessionError::ConnectTimeout { .. }) => EXIT_DATA_PORT_TIMEOUT,
        Some(_) => EXIT_PROTOCOL,
        None if e.downcast_ref::<HandshakeError>().is_some() => EXIT_PROTOCOL,
        None => EXIT_FAILURE,
    }
}
