//! Session negotiation over the data port.
//!
//! Prober: HANDSHAKE unit with a fresh key, wait for OK, send one unit per
//! parameter (`[code][big-endian value]`), send the `0xFF` terminator, read the
//! verdict. Target: the mirror image, driven by [`TargetHandshake`], which does
//! no I/O so each transition can be tested on its own.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::config::{ProberConfig, MAX_INTERVAL_SECS, PORT_SPACE_END};
use crate::error::{HandshakeError, WireError};
use crate::ports::MAX_CHUNK;
use crate::wire::{read_unit_within, write_unit, ContentType, Direction, SessionKey, Status, Unit};

/// Payload code that ends the parameter exchange.
pub const DONE: u8 = 0xFF;
/// Ports below this need root on the target.
pub const PRIVILEGED_PORT_LIMIT: u32 = 1024;
/// How long the target waits for each handshake unit.
pub const TARGET_READ_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_SECS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    Timeout,
    PortStart,
    PortEnd,
    PortChunk,
    /// Optional; defaults to [`DEFAULT_HEARTBEAT_SECS`].
    Heartbeat,
}

impl Param {
    pub fn code(self) -> u8 {
        match self {
            Param::Timeout => 0x00,
            Param::PortStart => 0x01,
            Param::PortEnd => 0x02,
            Param::PortChunk => 0x03,
            Param::Heartbeat => 0x04,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(Param::Timeout),
            0x01 => Some(Param::PortStart),
            0x02 => Some(Param::PortEnd),
            0x03 => Some(Param::PortChunk),
            0x04 => Some(Param::Heartbeat),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Param::Timeout => "timeout",
            Param::PortStart => "port_start",
            Param::PortEnd => "port_end",
            Param::PortChunk => "port_chunk",
            Param::Heartbeat => "heartbeat",
        }
    }
}

/// Parameters both sides agree on once the handshake is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Seconds.
    pub timeout: u64,
    pub port_start: u32,
    /// Exclusive.
    pub port_end: u32,
    pub port_chunk: u32,
    /// Heartbeat period in seconds.
    pub heartbeat: u64,
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat)
    }

    /// Parameters in the order the prober sends them.
    pub fn params(&self) -> [(Param, u64); 5] {
        [
            (Param::Timeout, self.timeout),
            (Param::PortStart, self.port_start as u64),
            (Param::PortEnd, self.port_end as u64),
            (Param::PortChunk, self.port_chunk as u64),
            (Param::Heartbeat, self.heartbeat),
        ]
    }

    pub fn validate(&self) -> Result<(), HandshakeError> {
        let reason = if self.port_start >= self.port_end {
            format!("port_start {} not below port_end {}", self.port_start, self.port_end)
        } else if self.port_end > PORT_SPACE_END {
            format!("port_end {} past {PORT_SPACE_END}", self.port_end)
        } else if self.port_chunk == 0 || self.port_chunk > MAX_CHUNK {
            format!("port_chunk {} outside 1..={MAX_CHUNK}", self.port_chunk)
        } else if self.timeout == 0 || self.timeout > MAX_INTERVAL_SECS {
            format!("timeout {} outside 1..={MAX_INTERVAL_SECS}", self.timeout)
        } else if self.heartbeat == 0 || self.heartbeat > MAX_INTERVAL_SECS {
            format!("heartbeat {} outside 1..={MAX_INTERVAL_SECS}", self.heartbeat)
        } else {
            return Ok(());
        };
        Err(HandshakeError::InvalidParameters(reason))
    }
}

impl From<&ProberConfig> for SessionConfig {
    fn from(cfg: &ProberConfig) -> Self {
        Self {
            timeout: cfg.timeout_secs,
            port_start: cfg.port_start,
            port_end: cfg.port_end,
            port_chunk: cfg.chunk,
            heartbeat: cfg.heartbeat_secs,
        }
    }
}

/// Parameters collected so far on the target.
#[derive(Debug, Clone, Default)]
struct ParamSet {
    timeout: Option<u64>,
    port_start: Option<u64>,
    port_end: Option<u64>,
    port_chunk: Option<u64>,
    heartbeat: Option<u64>,
}

impl ParamSet {
    fn set(&mut self, param: Param, value: u64) {
        let slot = match param {
            Param::Timeout => &mut self.timeout,
            Param::PortStart => &mut self.port_start,
            Param::PortEnd => &mut self.port_end,
            Param::PortChunk => &mut self.port_chunk,
            Param::Heartbeat => &mut self.heartbeat,
        };
        *slot = Some(value);
    }

    fn build(&self) -> Result<SessionConfig, HandshakeError> {
        let need = |v: Option<u64>, p: Param| v.ok_or(HandshakeError::MissingParameter(p.name()));
        let port = |v: u64, p: Param| {
            u32::try_from(v).map_err(|_| {
                HandshakeError::InvalidParameters(format!("{} value {v} out of range", p.name()))
            })
        };
        Ok(SessionConfig {
            timeout: need(self.timeout, Param::Timeout)?,
            port_start: port(need(self.port_start, Param::PortStart)?, Param::PortStart)?,
            port_end: port(need(self.port_end, Param::PortEnd)?, Param::PortEnd)?,
            port_chunk: port(need(self.port_chunk, Param::PortChunk)?, Param::PortChunk)?,
            heartbeat: self.heartbeat.unwrap_or(DEFAULT_HEARTBEAT_SECS),
        })
    }
}

/// Minimal big-endian bytes for `v`, at least one byte.
pub fn encode_value(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let skip = bytes.iter().take(7).take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Big-endian integer of 1..=8 bytes.
pub fn decode_value(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() || bytes.len() > 8 {
        return None;
    }
    Some(bytes.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
}

pub fn param_unit(key: SessionKey, param: Param, value: u64) -> Unit {
    let mut payload = vec![param.code()];
    payload.extend(encode_value(value));
    Unit::new(Direction::FromProber, ContentType::Handshake, Status::Ok, key).with_payload(payload)
}

pub fn done_unit(key: SessionKey) -> Unit {
    Unit::new(Direction::FromProber, ContentType::Handshake, Status::Ok, key).with_payload(vec![DONE])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Listening,
    KeyReceived,
    ParamExchange,
    Ready,
    Rejected,
}

/// What the target driver should do after feeding a unit to [`TargetHandshake`].
#[derive(Debug)]
pub enum Step {
    /// Send the reply and keep reading.
    Reply(Unit),
    /// Nothing to send, keep reading.
    Continue,
    /// Send the final OK; the session is established.
    Ready { reply: Unit, config: SessionConfig },
    /// Send the reply if there is one, then close. Never retried.
    Reject {
        reply: Option<Unit>,
        error: HandshakeError,
    },
}

/// Target-side handshake state machine.
#[derive(Debug)]
pub struct TargetHandshake {
    state: HandshakeState,
    key: SessionKey,
    params: ParamSet,
    privileged: bool,
}

impl TargetHandshake {
    pub fn new(privileged: bool) -> Self {
        Self {
            state: HandshakeState::Listening,
            key: SessionKey::default(),
            params: ParamSet::default(),
            privileged,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn on_unit(&mut self, unit: &Unit) -> Step {
        match self.state {
            HandshakeState::Listening => self.on_opener(unit),
            HandshakeState::KeyReceived | HandshakeState::ParamExchange => {
                self.state = HandshakeState::ParamExchange;
                self.on_param(unit)
            }
            HandshakeState::Ready | HandshakeState::Rejected => Step::Reject {
                reply: None,
                error: HandshakeError::InvalidParameters("handshake already finished".into()),
            },
        }
    }

    fn on_opener(&mut self, unit: &Unit) -> Step {
        if unit.content() != ContentType::Handshake {
            self.state = HandshakeState::Rejected;
            return Step::Reject {
                reply: None,
                error: HandshakeError::NotHandshake(unit.content()),
            };
        }
        self.key = unit.key;
        self.state = HandshakeState::KeyReceived;
        Step::Reply(self.verdict(Status::Ok))
    }

    fn on_param(&mut self, unit: &Unit) -> Step {
        if unit.content() != ContentType::Handshake {
            return self.reject(HandshakeError::NotHandshake(unit.content()));
        }
        let payload = match unit.payload() {
            Some(p) if !p.is_empty() => p,
            _ => return self.reject(HandshakeError::EmptyParameter),
        };
        let code = payload[0];
        if code == DONE {
            return self.finish();
        }
        let Some(param) = Param::from_code(code) else {
            return self.reject(HandshakeError::UnknownParameter(code));
        };
        let raw = &payload[1..];
        let Some(value) = decode_value(raw) else {
            return self.reject(HandshakeError::BadParameterValue {
                name: param.name(),
                len: raw.len(),
            });
        };
        debug!(param = param.name(), value, "handshake parameter");
        self.params.set(param, value);
        Step::Continue
    }

    fn finish(&mut self) -> Step {
        let config = match self.params.build() {
            Ok(c) => c,
            Err(e) => return self.reject(e),
        };
        if let Err(e) = config.validate() {
            return self.reject(e);
        }
        if config.port_start < PRIVILEGED_PORT_LIMIT && !self.privileged {
            return self.reject(HandshakeError::InsufficientPrivilege {
                port_start: config.port_start,
            });
        }
        self.state = HandshakeState::Ready;
        Step::Ready {
            reply: self.verdict(Status::Ok),
            config,
        }
    }

    fn reject(&mut self, error: HandshakeError) -> Step {
        self.state = HandshakeState::Rejected;
        let reply = Unit::info(Direction::FromTarget, Status::Bad, self.key, &error.to_string());
        Step::Reject {
            reply: Some(reply),
            error,
        }
    }

    fn verdict(&self, status: Status) -> Unit {
        Unit::new(Direction::FromTarget, ContentType::Handshake, status, self.key)
    }
}

/// A negotiated target-side session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSession {
    pub key: SessionKey,
    pub config: SessionConfig,
}

/// Run the target side of the handshake on an accepted data connection.
pub async fn accept_handshake<S>(stream: &mut S, privileged: bool) -> Result<TargetSession, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut machine = TargetHandshake::new(privileged);
    loop {
        let unit = read_unit_within(stream, TARGET_READ_TIMEOUT).await?;
        match machine.on_unit(&unit) {
            Step::Reply(reply) => {
                info!(key = %machine.key(), "handshake opened");
                write_unit(stream, &reply).await?;
            }
            Step::Continue => {}
            Step::Ready { reply, config } => {
                write_unit(stream, &reply).await?;
                info!(key = %machine.key(), ?config, "handshake complete");
                return Ok(TargetSession {
                    key: machine.key(),
                    config,
                });
            }
            Step::Reject { reply, error } => {
                warn!(%error, "handshake rejected");
                if let Some(reply) = reply {
                    // Best effort; the error below is what matters.
                    let _ = write_unit(stream, &reply).await;
                }
                return Err(error);
            }
        }
    }
}

/// A negotiated prober-side session; `stream` stays the control channel.
#[derive(Debug)]
pub struct ProberSession<S> {
    pub stream: S,
    pub key: SessionKey,
    pub config: SessionConfig,
}

/// Result of the prober side of the handshake.
#[derive(Debug)]
pub enum HandshakeOutcome<S> {
    Ready(ProberSession<S>),
    /// Target answered BAD with a reason.
    Rejected(String),
    /// Target closed, or answered BAD without a reason. Retrying is the caller's call.
    NoSession,
}

/// Run the prober side of the handshake. Never retries.
pub async fn initiate_handshake<S>(
    mut stream: S,
    config: SessionConfig,
    key: SessionKey,
    limit: Duration,
) -> Result<HandshakeOutcome<S>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let opener = Unit::new(Direction::FromProber, ContentType::Handshake, Status::Ok, key);
    write_unit(&mut stream, &opener).await?;

    let ack = match read_unit_within(&mut stream, limit).await {
        Ok(u) => u,
        Err(e) if e.is_disconnect() => return Ok(HandshakeOutcome::NoSession),
        Err(e) => return Err(e.into()),
    };
    if !ack.is_ok() || ack.content() != ContentType::Handshake {
        debug!(?ack, "target refused the handshake opener");
        return Ok(HandshakeOutcome::NoSession);
    }

    if let Err(e) = send_params(&mut stream, config, key).await {
        if !e.is_disconnect() {
            return Err(e.into());
        }
        // The target may have hung up after a BAD reply; try to read it.
    }

    let verdict = match read_unit_within(&mut stream, limit).await {
        Ok(u) => u,
        Err(e) if e.is_disconnect() => return Ok(HandshakeOutcome::NoSession),
        Err(e) => return Err(e.into()),
    };
    if verdict.is_ok() {
        return Ok(HandshakeOutcome::Ready(ProberSession {
            stream,
            key,
            config,
        }));
    }
    Ok(match verdict.message() {
        Some(reason) => HandshakeOutcome::Rejected(reason),
        None => HandshakeOutcome::NoSession,
    })
}

async fn send_params<S>(stream: &mut S, config: SessionConfig, key: SessionKey) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    for (param, value) in config.params() {
        write_unit(stream, &param_unit(key, param, value)).await?;
    }
    write_unit(stream, &done_unit(key)).await
}
