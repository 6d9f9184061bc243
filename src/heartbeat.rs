//! Liveness exchange on the control connection once the chunk exchange is over.
//!
//! The prober sends an OK INFO unit every `period` and waits up to
//! `period + grace` for the target's OK. A missing reply cancels the prober's
//! abort token, which probe workers check between ports. Both sides can queue
//! free-form text that rides on the next beat instead of the default `OK`.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::wire::{read_unit_within, write_unit, ContentType, Direction, SessionKey, Status, Unit};

pub const BEAT_TEXT: &str = "OK";
/// Sent by the prober in a BAD unit when it ends the session normally.
pub const COMPLETE_TEXT: &str = "session complete";
pub const INCORRECT_TEXT: &str = "incorrect heartbeat";
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub period: Duration,
    /// Slack on top of `period` before a reply counts as missed.
    pub grace: Duration,
}

impl HeartbeatConfig {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        self.period.saturating_add(self.grace)
    }
}

/// Why a heartbeat loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEnd {
    /// Our side asked it to stop.
    Stopped,
    /// The peer answered BAD, ending the session from its side.
    PeerEnded(Option<String>),
    /// No reply in time, or the connection failed.
    PeerLost(String),
    /// The peer sent something other than INFO.
    ProtocolViolation(ContentType),
}

/// A running heartbeat task.
#[derive(Debug)]
pub struct HeartbeatHandle {
    task: JoinHandle<HeartbeatEnd>,
    stop: CancellationToken,
    outbox: mpsc::UnboundedSender<String>,
}

impl HeartbeatHandle {
    /// Queue text for the next beat. False once the loop has ended.
    pub fn send_info(&self, text: impl Into<String>) -> bool {
        self.outbox.send(text.into()).is_ok()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end on its own.
    pub async fn join(self) -> HeartbeatEnd {
        self.task
            .await
            .unwrap_or_else(|e| HeartbeatEnd::PeerLost(format!("heartbeat task failed: {e}")))
    }

    /// Ask the loop to stop, then wait for it.
    pub async fn finish(self) -> HeartbeatEnd {
        self.stop.cancel();
        self.join().await
    }
}

/// Start the prober side. `abort` is cancelled if the target stops answering.
pub fn spawn_prober<S>(
    mut stream: S,
    key: SessionKey,
    cfg: HeartbeatConfig,
    abort: CancellationToken,
) -> HeartbeatHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stop = CancellationToken::new();
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let stop_task = stop.clone();
    let task = tokio::spawn(async move {
        run_prober(&mut stream, key, cfg, &abort, &stop_task, &mut inbox).await
    });
    HeartbeatHandle { task, stop, outbox }
}

/// Start the target side.
pub fn spawn_target<S>(mut stream: S, key: SessionKey, cfg: HeartbeatConfig) -> HeartbeatHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let stop = CancellationToken::new();
    let (outbox, mut inbox) = mpsc::unbounded_channel();
    let stop_task = stop.clone();
    let task = tokio::spawn(async move { run_target(&mut stream, key, cfg, &stop_task, &mut inbox).await });
    HeartbeatHandle { task, stop, outbox }
}

pub async fn run_prober<S>(
    stream: &mut S,
    key: SessionKey,
    cfg: HeartbeatConfig,
    abort: &CancellationToken,
    stop: &CancellationToken,
    outbox: &mut mpsc::UnboundedReceiver<String>,
) -> HeartbeatEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        if stop.is_cancelled() {
            return say_goodbye(stream, key).await;
        }
        let text = outbox.try_recv().unwrap_or_else(|_| BEAT_TEXT.to_string());
        let beat = Unit::info(Direction::FromProber, Status::Ok, key, &text);
        if let Err(e) = write_unit(stream, &beat).await {
            warn!(error = %e, "heartbeat send failed; aborting probe workers");
            abort.cancel();
            return HeartbeatEnd::PeerLost(e.to_string());
        }
        let reply = match read_unit_within(stream, cfg.reply_timeout()).await {
            Ok(u) => u,
            Err(e) => {
                warn!(error = %e, "target missed a heartbeat; aborting probe workers");
                abort.cancel();
                return HeartbeatEnd::PeerLost(e.to_string());
            }
        };
        if !reply.is_ok() {
            let msg = reply.message();
            info!(message = msg.as_deref().unwrap_or(""), "target ended the heartbeat");
            return HeartbeatEnd::PeerEnded(msg);
        }
        match reply.message() {
            Some(msg) if msg != BEAT_TEXT => info!(%msg, "message from target"),
            _ => debug!("heartbeat ok"),
        }
        tokio::select! {
            _ = stop.cancelled() => return say_goodbye(stream, key).await,
            _ = time::sleep(cfg.period) => {}
        }
    }
}

async fn say_goodbye<S>(stream: &mut S, key: SessionKey) -> HeartbeatEnd
where
    S: AsyncWrite + Unpin,
{
    let bye = Unit::info(Direction::FromProber, Status::Bad, key, COMPLETE_TEXT);
    if let Err(e) = write_unit(stream, &bye).await {
        debug!(error = %e, "could not tell the target the session is over");
    }
    HeartbeatEnd::Stopped
}

pub async fn run_target<S>(
    stream: &mut S,
    key: SessionKey,
    cfg: HeartbeatConfig,
    stop: &CancellationToken,
    outbox: &mut mpsc::UnboundedReceiver<String>,
) -> HeartbeatEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let unit = tokio::select! {
            _ = stop.cancelled() => return HeartbeatEnd::Stopped,
            res = read_unit_within(stream, cfg.reply_timeout()) => match res {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "prober stopped sending heartbeats");
                    return HeartbeatEnd::PeerLost(e.to_string());
                }
            },
        };
        if unit.content() != ContentType::Info {
            warn!(content = ?unit.content(), "bad heartbeat from prober");
            let reply = Unit::info(Direction::FromTarget, Status::Bad, key, INCORRECT_TEXT);
            let _ = write_unit(stream, &reply).await;
            return HeartbeatEnd::ProtocolViolation(unit.content());
        }
        if !unit.is_ok() {
            let msg = unit.message();
            info!(message = msg.as_deref().unwrap_or(""), "prober ended the session");
            return HeartbeatEnd::PeerEnded(msg);
        }
        match unit.message() {
            Some(msg) if msg != BEAT_TEXT => info!(%msg, "message from prober"),
            _ => debug!("heartbeat ok"),
        }
        let text = outbox.try_recv().unwrap_or_else(|_| BEAT_TEXT.to_string());
        let reply = Unit::info(Direction::FromTarget, Status::Ok, key, &text);
        if let Err(e) = write_unit(stream, &reply).await {
            warn!(error = %e, "heartbeat reply failed");
            return HeartbeatEnd::PeerLost(e.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::read_unit;

    const KEY: SessionKey = SessionKey(*b"___heart_beat___");

    fn quick() -> HeartbeatConfig {
        HeartbeatConfig {
            period: Duration::from_millis(10),
            grace: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn target_rejects_non_info_beats() {
        let (mut prober, target) = tokio::io::duplex(1024);
        let hb = spawn_target(target, KEY, quick());
        let wrong = Unit::new(Direction::FromProber, ContentType::Media, Status::Ok, KEY);
        write_unit(&mut prober, &wrong).await.unwrap();
        let reply = read_unit(&mut prober).await.unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.message().as_deref(), Some(INCORRECT_TEXT));
        assert_eq!(hb.join().await, HeartbeatEnd::ProtocolViolation(ContentType::Media));
    }

    #[tokio::test]
    async fn bad_reply_from_target_ends_prober_without_abort() {
        let (prober, mut target) = tokio::io::duplex(1024);
        let abort = CancellationToken::new();
        let hb = spawn_prober(prober, KEY, quick(), abort.clone());
        let beat = read_unit(&mut target).await.unwrap();
        assert_eq!(beat.message().as_deref(), Some(BEAT_TEXT));
        let stop = Unit::info(Direction::FromTarget, Status::Bad, KEY, "shutting down");
        write_unit(&mut target, &stop).await.unwrap();
        assert_eq!(
            hb.join().await,
            HeartbeatEnd::PeerEnded(Some("shutting down".into()))
        );
        assert!(!abort.is_cancelled());
    }

    #[test]
    fn reply_timeout_saturates() {
        let cfg = HeartbeatConfig::new(Duration::from_secs(u64::MAX));
        assert_eq!(cfg.reply_timeout(), Duration::MAX);
    }
}
