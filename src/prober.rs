use crate::aggregate::{self, AggregateHandle};
use crate::config::ProberConfig;
use crate::dashboard::{self, Dashboard};
use crate::error::SessionError;
use crate::handshake::{initiate_handshake, HandshakeOutcome, ProberSession, SessionConfig};
use crate::heartbeat::{self, HeartbeatConfig, HeartbeatHandle};
use crate::ports::{chunk_count, decode_port_list};
use crate::report;
use crate::types::{AbortCause, Classification, RunInfo, ScanResults};
use crate::wire::{
    read_unit_within, write_unit, ContentType, Direction, SessionKey, Status, Unit, HEADER_LEN,
};
use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Connect attempts per port that refusals and resets may use up.
pub const ATTEMPTS: u32 = 3;
/// Per-port budget of "other" connect errors that retry without using an attempt.
pub const MAX_TRANSIENT_RETRIES: u32 = 8;
const PROGRESS_EVERY: Duration = Duration::from_secs(1);

/// Per-port probing knobs.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    /// Sleep after a refused or reset connect.
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectFailure {
    TimedOut,
    Refused,
    Transient,
}

fn connect_failure(e: &io::Error) -> ConnectFailure {
    match e.kind() {
        io::ErrorKind::TimedOut => ConnectFailure::TimedOut,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ConnectFailure::Refused,
        _ => ConnectFailure::Transient,
    }
}

/// Classify one port.
///
/// - A connect timeout is conclusive: `Dropped`, no retry.
/// - Refused/reset sleeps `delay` and uses one of [`ATTEMPTS`]; running out is `Closed`.
/// - Other connect errors retry for free, up to [`MAX_TRANSIENT_RETRIES`], then count like refusals.
/// - Once connected, a probe unit with a fresh id goes out and exactly 17 bytes
///   must come back with status OK and the same id for `Accepted`. Anything
///   else (EOF, reset, silence, wrong id) is `ServerError`.
pub async fn probe_port(addr: IpAddr, port: u16, settings: &ProbeSettings) -> Classification {
    probe_port_with(SocketAddr::new(addr, port), settings, |a| TcpStream::connect(a)).await
}

/// [`probe_port`] with the connect step supplied by the caller.
pub async fn probe_port_with<C, F, S>(target: SocketAddr, settings: &ProbeSettings, mut connect: C) -> Classification
where
    C: FnMut(SocketAddr) -> F,
    F: Future<Output = io::Result<S>>,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let port = target.port();
    let mut attempts = ATTEMPTS;
    let mut transient = 0u32;
    let mut stream = loop {
        let err = match time::timeout(settings.timeout, connect(target)).await {
            Ok(Ok(stream)) => break stream,
            Err(_) => return Classification::Dropped,
            Ok(Err(e)) => e,
        };
        match connect_failure(&err) {
            ConnectFailure::TimedOut => return Classification::Dropped,
            ConnectFailure::Transient if transient < MAX_TRANSIENT_RETRIES => {
                transient += 1;
                trace!(port, error = %err, "transient connect error, retrying");
                continue;
            }
            ConnectFailure::Refused | ConnectFailure::Transient => {
                attempts -= 1;
                trace!(port, error = %err, attempts, "connect failed");
                if attempts == 0 {
                    return Classification::Closed;
                }
                time::sleep(settings.delay).await;
            }
        }
    };
    exchange_probe(&mut stream, settings.timeout).await
}

async fn exchange_probe<S>(stream: &mut S, limit: Duration) -> Classification
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let id = SessionKey::random();
    let probe = Unit::new(Direction::FromProber, ContentType::Info, Status::Ok, id);
    if write_unit(stream, &probe).await.is_err() {
        return Classification::ServerError;
    }
    let mut buf = [0u8; HEADER_LEN];
    match time::timeout(limit, stream.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        // Closed without a reply usually means someone else owns the port.
        _ => return Classification::ServerError,
    }
    match Unit::decode_head(&buf) {
        Ok(reply) if reply.is_ok() && reply.key == id => Classification::Accepted,
        _ => Classification::ServerError,
    }
}

/// Probe `ports` in order, reporting each classification to `agg`.
///
/// The abort token is checked before every port; once it fires the remaining
/// ports are skipped. Returns how many ports were classified.
pub async fn run_probe_worker(
    addr: IpAddr,
    ports: Vec<u16>,
    settings: ProbeSettings,
    agg: AggregateHandle,
) -> usize {
    let mut done = 0usize;
    for &port in &ports {
        if agg.is_aborted() {
            debug!(port, skipped = ports.len() - done, "abort signalled, worker stopping");
            break;
        }
        let class = probe_port(addr, port, &settings).await;
        agg.record(port, class);
        done += 1;
    }
    agg.worker_finished();
    done
}

/// Ask the target for the next chunk. An empty list means the range is exhausted.
pub async fn request_chunk<S>(stream: &mut S, key: SessionKey, limit: Duration) -> Result<Vec<u16>, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = Unit::new(Direction::FromProber, ContentType::PortRequest, Status::Ok, key);
    write_unit(stream, &req).await?;
    let reply = read_unit_within(stream, limit).await?;
    if !reply.is_ok() || reply.content() != ContentType::PortResponse {
        let why = reply
            .message()
            .unwrap_or_else(|| format!("unexpected {:?} reply", reply.content()));
        return Err(SessionError::BadPortResponse(why));
    }
    let payload = reply
        .payload()
        .ok_or_else(|| SessionError::MalformedPortList("port response without payload".into()))?;
    decode_port_list(payload)
}

pub async fn connect_data_port(addr: SocketAddr, limit: Duration) -> Result<TcpStream, SessionError> {
    match time::timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => Err(SessionError::ConnectTimeout { addr }),
        Ok(Err(source)) => Err(SessionError::Connect { addr, source }),
        Err(_) => Err(SessionError::ConnectTimeout { addr }),
    }
}

/// A finished probe run. The heartbeat is still running and is stopped by the
/// caller once the results have been reported.
#[derive(Debug)]
pub struct ProbeRun {
    pub results: ScanResults,
    pub info: RunInfo,
    pub heartbeat: HeartbeatHandle,
}

#[derive(Debug)]
pub enum ProberOutcome {
    Completed(ProbeRun),
    /// Target refused the session with this reason.
    Rejected(String),
    NoSession,
}

/// Drive a whole prober session: handshake, chunk loop, workers, heartbeat.
///
/// - Worker concurrency is bounded by `max_workers`; a permit is taken before
///   each chunk is requested, so the target only opens listeners for chunks
///   that will be probed right away.
/// - Workers stop between ports on heartbeat loss or when `interrupt` fires
///   (Ctrl-C). The results record which of the two it was.
pub async fn run_prober(
    cfg: &ProberConfig,
    dashboard: Arc<dyn Dashboard>,
    interrupt: CancellationToken,
) -> Result<ProberOutcome> {
    cfg.validate()?;
    // Heartbeat loss cancels only this child, so `interrupt` tells the causes apart.
    let abort = interrupt.child_token();
    let started = report::now_rfc3339();
    let clock = Instant::now();

    dashboard.notify("Starting handshake...");
    let stream = connect_data_port(cfg.data_addr(), cfg.timeout()).await?;
    let outcome = initiate_handshake(stream, SessionConfig::from(cfg), SessionKey::random(), cfg.timeout()).await?;
    let ProberSession {
        mut stream,
        key,
        config,
    } = match outcome {
        HandshakeOutcome::Ready(session) => session,
        HandshakeOutcome::Rejected(reason) => {
            dashboard.notify(&format!("Target sent an error: {reason}"));
            return Ok(ProberOutcome::Rejected(reason));
        }
        HandshakeOutcome::NoSession => {
            dashboard.notify("Couldn't complete handshake!");
            return Ok(ProberOutcome::NoSession);
        }
    };

    let (aggregator, agg) = aggregate::channel(abort.clone());
    let collector = tokio::spawn(aggregator.run());
    let progress_done = CancellationToken::new();
    let progress = dashboard::spawn_progress(
        dashboard.clone(),
        agg.subscribe(),
        PROGRESS_EVERY,
        progress_done.clone(),
    );

    let settings = ProbeSettings {
        timeout: cfg.timeout(),
        delay: cfg.delay,
    };
    let sem = Arc::new(Semaphore::new(cfg.max_workers));
    let mut set = JoinSet::new();
    let mut chunks = 0u32;

    dashboard.notify("Starting main loop");
    loop {
        let permit = sem
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore in scope");
        let ports = request_chunk(&mut stream, key, cfg.timeout()).await?;
        if ports.is_empty() {
            break;
        }
        chunks += 1;
        debug!(chunk = chunks, first = ports[0], len = ports.len(), "chunk received");
        agg.worker_started();
        let agg = agg.clone();
        let addr = cfg.server;
        set.spawn(async move {
            let _permit = permit; // keep permit until the chunk is done
            run_probe_worker(addr, ports, settings, agg).await
        });
    }
    dashboard.notify("Done asking for ports!");

    let heartbeat = heartbeat::spawn_prober(
        stream,
        key,
        HeartbeatConfig::new(config.heartbeat_period()),
        abort.clone(),
    );

    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            warn!(error = %e, "probe worker failed");
        }
    }
    drop(agg);
    let mut results = collector.await.context("aggregator task failed")?;
    progress_done.cancel();
    let _ = progress.await;

    if results.aborted {
        let cause = if interrupt.is_cancelled() {
            AbortCause::Interrupted
        } else {
            AbortCause::HeartbeatLost
        };
        results.abort_cause = Some(cause);
        dashboard.notify(match cause {
            AbortCause::Interrupted => "Interrupted! Partial results:",
            AbortCause::HeartbeatLost => "Heartbeat died! Results will be unreliable:",
        });
    } else {
        dashboard.notify("Results:");
    }
    for line in report::summary_lines(&results) {
        dashboard.notify(&line);
    }

    let info = RunInfo {
        server: cfg.server.to_string(),
        data_port: cfg.data_port,
        port_start: cfg.port_start,
        port_end: cfg.port_end,
        chunk_size: cfg.chunk,
        chunks: chunk_count(cfg.port_start, cfg.port_end, cfg.chunk),
        delay_secs: cfg.delay.as_secs_f64(),
        started,
        finished: report::now_rfc3339(),
        elapsed_secs: clock.elapsed().as_secs(),
    };
    Ok(ProberOutcome::Completed(ProbeRun {
        results,
        info,
        heartbeat,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_map_to_retry_policy() {
        let kind = |k: io::ErrorKind| connect_failure(&io::Error::from(k));
        assert_eq!(kind(io::ErrorKind::TimedOut), ConnectFailure::TimedOut);
        assert_eq!(kind(io::ErrorKind::ConnectionRefused), ConnectFailure::Refused);
        assert_eq!(kind(io::ErrorKind::ConnectionReset), ConnectFailure::Refused);
        assert_eq!(kind(io::ErrorKind::ConnectionAborted), ConnectFailure::Transient);
        assert_eq!(kind(io::ErrorKind::AddrNotAvailable), ConnectFailure::Transient);
    }

    #[tokio::test]
    async fn request_chunk_decodes_response() {
        let key = SessionKey::random();
        let (mut prober, mut target) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let req = crate::wire::read_unit(&mut target).await.unwrap();
            assert_eq!(req.content(), ContentType::PortRequest);
            let reply = Unit::new(Direction::FromTarget, ContentType::PortResponse, Status::Ok, req.key)
                .with_payload(crate::ports::encode_port_list(&[7, 8, 9]));
            write_unit(&mut target, &reply).await.unwrap();
        });
        let ports = request_chunk(&mut prober, key, Duration::from_secs(1)).await.unwrap();
        assert_eq!(ports, vec![7, 8, 9]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn request_chunk_surfaces_target_complaint() {
        let key = SessionKey::random();
        let (mut prober, mut target) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let req = crate::wire::read_unit(&mut target).await.unwrap();
            let reply = Unit::info(Direction::FromTarget, Status::Bad, req.key, "bad port request");
            write_unit(&mut target, &reply).await.unwrap();
        });
        let err = request_chunk(&mut prober, key, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::BadPortResponse(m) if m == "bad port request"));
    }
}
