//! Error taxonomy.
//!
//! Only protocol and privilege failures are surfaced as errors. Transport
//! failures on probed ports (refused, reset, timeout) and bind contention on
//! the target are absorbed by the workers and turned into classifications.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::wire::ContentType;

/// Failures while framing or parsing a `Unit`.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed header: need {expected} bytes, got {got}")]
    MalformedHeader { expected: usize, got: usize },

    #[error("unknown content type code {0}")]
    UnknownContentType(u8),

    #[error("payload of {0} bytes exceeds the 65535 byte limit")]
    PayloadTooLarge(usize),

    #[error("truncated payload: length prefix says {expected} bytes, got {got}")]
    TruncatedPayload { expected: usize, got: usize },

    #[error("peer closed the connection")]
    Closed,

    #[error("no unit received within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    /// True when the peer went away rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::Closed | WireError::Timeout(_) => true,
            WireError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Terminal failures of the handshake. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("first unit was {0:?}, not a handshake")]
    NotHandshake(ContentType),

    #[error("unknown handshake parameter 0x{0:02x}")]
    UnknownParameter(u8),

    #[error("handshake parameter {name} carried {len} value bytes (expected 1..=8)")]
    BadParameterValue { name: &'static str, len: usize },

    #[error("handshake parameter unit had no payload")]
    EmptyParameter,

    #[error("missing handshake parameter {0}")]
    MissingParameter(&'static str),

    #[error("invalid handshake parameters: {0}")]
    InvalidParameters(String),

    #[error("insufficient privilege: port_start {port_start} requires root")]
    InsufficientPrivilege { port_start: u32 },

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Failures of a whole session, as seen by the top-level drivers.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to data port {addr}")]
    ConnectTimeout { addr: SocketAddr },

    #[error("bad port request from prober")]
    BadPortRequest,

    #[error("bad port response from target: {0}")]
    BadPortResponse(String),

    #[error("malformed port list: {0}")]
    MalformedPortList(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Wire(#[from] WireError),
}
