//! Target role: accept the data connection, negotiate, hand out chunks, and
//! briefly listen on every port of each chunk it hands out.
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, trace, warn};

use crate::config::TargetConfig;
use crate::error::SessionError;
use crate::handshake::{accept_handshake, SessionConfig, TargetSession, TARGET_READ_TIMEOUT};
use crate::heartbeat::{self, HeartbeatConfig, HeartbeatEnd};
use crate::ports::{encode_port_list, PortAllocator};
use crate::wire::{read_unit_within, write_unit, ContentType, Direction, Status, Unit, HEADER_LEN};

/// What happened on one listened port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortOutcome {
    /// Probe received and echoed back.
    Answered,
    /// Nobody connected within the timeout.
    TimedOut,
    /// Peer sent a unit with BAD status or an unreadable header; closed without reply.
    BadProbe,
    /// Accept, read or write failed after the bind succeeded.
    PeerError,
}

/// Per-worker tally, mostly for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenSummary {
    pub answered: usize,
    pub timed_out: usize,
    pub bad_probes: usize,
    pub peer_errors: usize,
    /// Ports another local process was already bound to.
    pub in_use: usize,
    /// Set when a bind error other than "address in use" ended the worker early.
    pub gave_up: bool,
}

/// Listen on one port for a single probe. Only bind/listen failures are errors.
pub async fn serve_port(bind: IpAddr, port: u16, limit: Duration) -> io::Result<PortOutcome> {
    let listener = TcpListener::bind(SocketAddr::new(bind, port)).await?;
    let (mut peer, from) = match time::timeout(limit, listener.accept()).await {
        Err(_) => return Ok(PortOutcome::TimedOut),
        Ok(Err(e)) => {
            debug!(port, error = %e, "accept failed");
            return Ok(PortOutcome::PeerError);
        }
        Ok(Ok(conn)) => conn,
    };
    trace!(port, %from, "probe connected");

    let mut buf = [0u8; HEADER_LEN];
    match time::timeout(limit, peer.read_exact(&mut buf)).await {
        Ok(Ok(_)) => {}
        _ => return Ok(PortOutcome::PeerError),
    }
    let mut unit = match Unit::decode_head(&buf) {
        Ok(u) if u.is_ok() => u,
        _ => return Ok(PortOutcome::BadProbe),
    };
    unit.header.direction = Direction::FromTarget;
    unit.header.status = Status::Ok;
    unit.set_payload(None);
    if write_unit(&mut peer, &unit).await.is_err() {
        return Ok(PortOutcome::PeerError);
    }
    Ok(PortOutcome::Answered)
}

/// Serve every port of a chunk in order.
///
/// "Address in use" is expected (something else owns the port) and stretches
/// the next port's timeout by one more multiple. Any other bind error ends this
/// worker only.
pub async fn run_listen_worker(bind: IpAddr, ports: Vec<u16>, timeout: Duration) -> ListenSummary {
    let mut summary = ListenSummary::default();
    let mut multiplier = 1u32;
    for &port in &ports {
        match serve_port(bind, port, timeout.saturating_mul(multiplier)).await {
            Ok(outcome) => {
                multiplier = 1;
                match outcome {
                    PortOutcome::Answered => summary.answered += 1,
                    PortOutcome::TimedOut => {
                        debug!(port, "no probe arrived before the timeout");
                        summary.timed_out += 1;
                    }
                    PortOutcome::BadProbe => summary.bad_probes += 1,
                    PortOutcome::PeerError => summary.peer_errors += 1,
                }
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                info!(port, "port already in use, extending timeout for the next port");
                summary.in_use += 1;
                multiplier += 1;
            }
            Err(e) => {
                warn!(port, error = %e, "cannot listen, giving up the rest of this chunk");
                summary.gave_up = true;
                break;
            }
        }
    }
    summary
}

/// Socket timeouts per port a prober worker may spend before its permit frees up.
const REQUEST_WAIT_PER_PORT: u32 = 4;

/// How long the target waits for the next PORT_REQUEST.
///
/// The prober only asks once one of its workers has finished a chunk, so the
/// gap can be a whole chunk's worth of probing.
pub fn request_wait(config: &SessionConfig) -> Duration {
    let per_chunk = config
        .timeout()
        .saturating_mul(config.port_chunk.saturating_mul(REQUEST_WAIT_PER_PORT));
    TARGET_READ_TIMEOUT.saturating_add(per_chunk)
}

/// Hand out chunks in allocator order, one per PORT_REQUEST, spawning a listen
/// worker for each non-empty one. Returns after the empty chunk has been sent,
/// or with a timeout error if no request arrives within `idle`.
pub async fn serve_chunks<S>(
    stream: &mut S,
    session: &TargetSession,
    bind: IpAddr,
    workers: &mut JoinSet<ListenSummary>,
    idle: Duration,
) -> Result<u32, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let SessionConfig {
        port_start,
        port_end,
        port_chunk,
        ..
    } = session.config;
    let timeout = session.config.timeout();
    let mut served = 0u32;
    for chunk in PortAllocator::new(port_start, port_end, port_chunk) {
        let req = read_unit_within(stream, idle).await?;
        if !req.is_ok() || req.content() != ContentType::PortRequest {
            warn!(content = ?req.content(), "non/bad port request from prober");
            let reply = Unit::info(Direction::FromTarget, Status::Bad, session.key, "bad port request");
            let _ = write_unit(stream, &reply).await;
            return Err(SessionError::BadPortRequest);
        }
        let reply = Unit::new(Direction::FromTarget, ContentType::PortResponse, Status::Ok, session.key)
            .with_payload(encode_port_list(&chunk));
        write_unit(stream, &reply).await?;
        if chunk.is_empty() {
            break;
        }
        served += 1;
        debug!(chunk = served, first = chunk[0], len = chunk.len(), "chunk sent");
        workers.spawn(run_listen_worker(bind, chunk, timeout));
    }
    Ok(served)
}

/// Summary of a target session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRun {
    pub session: TargetSession,
    pub chunks: u32,
    pub listen: ListenSummary,
    pub heartbeat: HeartbeatEnd,
}

/// Drive a whole target session on `cfg.data_addr()`.
pub async fn run_target(cfg: &TargetConfig) -> Result<TargetRun> {
    let listener = TcpListener::bind(cfg.data_addr())
        .await
        .with_context(|| format!("failed to bind data port {}", cfg.data_addr()))?;
    run_target_on(listener, cfg).await
}

/// Like [`run_target`] on an already bound data listener.
pub async fn run_target_on(listener: TcpListener, cfg: &TargetConfig) -> Result<TargetRun> {
    info!(addr = %listener.local_addr()?, "waiting for prober");
    let (mut stream, peer) = listener.accept().await.context("accept on data port failed")?;
    info!(%peer, "prober connected");
    drop(listener);

    let session = accept_handshake(&mut stream, cfg.privileged).await?;
    info!(
        start = session.config.port_start,
        end = session.config.port_end,
        chunk = session.config.port_chunk,
        "starting chunk loop"
    );

    let mut workers = JoinSet::new();
    let idle = request_wait(&session.config);
    let chunks = serve_chunks(&mut stream, &session, cfg.bind, &mut workers, idle).await?;

    info!("all chunks handed out, starting heartbeat");
    let heartbeat = heartbeat::spawn_target(
        stream,
        session.key,
        HeartbeatConfig::new(session.config.heartbeat_period()),
    );

    let mut listen = ListenSummary::default();
    while let Some(res) = workers.join_next().await {
        match res {
            Ok(s) => {
                listen.answered += s.answered;
                listen.timed_out += s.timed_out;
                listen.bad_probes += s.bad_probes;
                listen.peer_errors += s.peer_errors;
                listen.in_use += s.in_use;
                listen.gave_up |= s.gave_up;
            }
            Err(e) => warn!(error = %e, "listen worker failed"),
        }
    }
    info!(?listen, "listen workers done");

    let heartbeat = heartbeat.join().await;
    info!(?heartbeat, "heartbeat ended");
    Ok(TargetRun {
        session,
        chunks,
        listen,
        heartbeat,
    })
}
