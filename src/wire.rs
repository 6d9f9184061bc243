//! Wire codec for the `Unit`, the one message shape used on every socket.
//!
//! ```text
//! byte 0     : [D|CCC|S|P|--]  direction, content type, status, has_payload, unused
//! bytes 1-16 : session key
//! bytes 17+  : if P=1, u16 big-endian length then that many payload bytes
//! ```
use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use crate::error::WireError;

pub const KEY_LEN: usize = 16;
/// Header byte plus session key.
pub const HEADER_LEN: usize = 1 + KEY_LEN;
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

const DIRECTION_SHIFT: u8 = 7;
const CONTENT_SHIFT: u8 = 4;
const CONTENT_MASK: u8 = 0b111;
const STATUS_SHIFT: u8 = 3;
const PAYLOAD_SHIFT: u8 = 2;

/// 16-byte correlation id for one session or one probed port.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionKey(pub [u8; KEY_LEN]);

impl SessionKey {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({self})")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Direction {
    FromTarget = 0,
    FromProber = 1,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Direction::FromTarget => Direction::FromProber,
            Direction::FromProber => Direction::FromTarget,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContentType {
    Handshake = 0,
    PortRequest = 1,
    PortResponse = 2,
    Info = 4,
    Media = 5,
}

impl ContentType {
    pub const ALL: [ContentType; 5] = [
        ContentType::Handshake,
        ContentType::PortRequest,
        ContentType::PortResponse,
        ContentType::Info,
        ContentType::Media,
    ];

    pub fn from_code(code: u8) -> Result<Self, WireError> {
        match code {
            0 => Ok(ContentType::Handshake),
            1 => Ok(ContentType::PortRequest),
            2 => Ok(ContentType::PortResponse),
            4 => Ok(ContentType::Info),
            5 => Ok(ContentType::Media),
            other => Err(WireError::UnknownContentType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Bad = 0,
    Ok = 1,
}

impl From<bool> for Status {
    fn from(ok: bool) -> Self {
        if ok {
            Status::Ok
        } else {
            Status::Bad
        }
    }
}

/// The header byte as named fields. `to_byte`/`from_byte` are the only place
/// bit positions appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Header {
    pub direction: Direction,
    pub content: ContentType,
    pub status: Status,
    pub has_payload: bool,
}

impl Header {
    pub fn to_byte(self) -> u8 {
        ((self.direction as u8) << DIRECTION_SHIFT)
            | ((self.content as u8) << CONTENT_SHIFT)
            | ((self.status as u8) << STATUS_SHIFT)
            | ((self.has_payload as u8) << PAYLOAD_SHIFT)
    }

    /// Parse a header byte. The two unused low bits are ignored.
    pub fn from_byte(b: u8) -> Result<Self, WireError> {
        let direction = if (b >> DIRECTION_SHIFT) & 1 == 1 {
            Direction::FromProber
        } else {
            Direction::FromTarget
        };
        Ok(Self {
            direction,
            content: ContentType::from_code((b >> CONTENT_SHIFT) & CONTENT_MASK)?,
            status: Status::from((b >> STATUS_SHIFT) & 1 == 1),
            has_payload: (b >> PAYLOAD_SHIFT) & 1 == 1,
        })
    }
}

/// One protocol message.
///
/// A unit whose header says `has_payload` but which carries no bytes yet is
/// the intermediate state between the two read stages of [`read_unit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub header: Header,
    pub key: SessionKey,
    payload: Option<Vec<u8>>,
}

impl Unit {
    pub fn new(direction: Direction, content: ContentType, status: Status, key: SessionKey) -> Self {
        Self {
            header: Header {
                direction,
                content,
                status,
                has_payload: false,
            },
            key,
            payload: None,
        }
    }

    /// An INFO unit carrying UTF-8 text.
    pub fn info(direction: Direction, status: Status, key: SessionKey, text: &str) -> Self {
        Self::new(direction, ContentType::Info, status, key).with_payload(text.as_bytes().to_vec())
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.set_payload(Some(payload));
        self
    }

    /// Replace the payload, keeping `has_payload` in step with it.
    pub fn set_payload(&mut self, payload: Option<Vec<u8>>) {
        self.header.has_payload = payload.is_some();
        self.payload = payload;
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_ok(&self) -> bool {
        self.header.status == Status::Ok
    }

    pub fn content(&self) -> ContentType {
        self.header.content
    }

    /// Text of an INFO unit, if it has any.
    pub fn message(&self) -> Option<String> {
        match (self.header.content, self.payload()) {
            (ContentType::Info, Some(p)) => Some(String::from_utf8_lossy(p).into_owned()),
            _ => None,
        }
    }

    /// Payload-less answer to this unit: same key and content, opposite direction.
    pub fn reply(&self, status: Status) -> Unit {
        Unit::new(self.header.direction.flipped(), self.header.content, status, self.key)
    }

    pub fn encoded_len(&self) -> usize {
        match (&self.payload, self.header.has_payload) {
            (Some(p), _) => HEADER_LEN + 2 + p.len(),
            (None, true) => HEADER_LEN + 2,
            (None, false) => HEADER_LEN,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(self.header.to_byte());
        out.extend_from_slice(self.key.as_bytes());
        if self.header.has_payload {
            let payload = self.payload.as_deref().unwrap_or(&[]);
            if payload.len() > MAX_PAYLOAD {
                return Err(WireError::PayloadTooLarge(payload.len()));
            }
            out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    /// First read stage: parse the fixed 17 bytes. The payload, if the header
    /// announces one, is left for the caller to attach.
    pub fn decode_head(buf: &[u8]) -> Result<Unit, WireError> {
        if buf.len() < HEADER_LEN {
            return Err(WireError::MalformedHeader {
                expected: HEADER_LEN,
                got: buf.len(),
            });
        }
        let header = Header::from_byte(buf[0])?;
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&buf[1..HEADER_LEN]);
        Ok(Unit {
            header,
            key: SessionKey(key),
            payload: None,
        })
    }

    /// Decode a complete unit from one contiguous buffer. Trailing bytes are ignored.
    pub fn decode(buf: &[u8]) -> Result<Unit, WireError> {
        let mut unit = Self::decode_head(buf)?;
        if unit.header.has_payload {
            let rest = &buf[HEADER_LEN..];
            if rest.len() < 2 {
                return Err(WireError::TruncatedPayload {
                    expected: 2,
                    got: rest.len(),
                });
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            let body = &rest[2..];
            if body.len() < len {
                return Err(WireError::TruncatedPayload {
                    expected: len,
                    got: body.len(),
                });
            }
            unit.payload = Some(body[..len].to_vec());
        }
        Ok(unit)
    }
}

/// Read one unit in two stages: the fixed header, then the length-prefixed payload.
pub async fn read_unit<R>(reader: &mut R) -> Result<Unit, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut head).await?;
    let mut unit = Unit::decode_head(&head)?;
    if unit.header.has_payload {
        let mut len = [0u8; 2];
        read_exact_or_closed(reader, &mut len).await?;
        let mut payload = vec![0u8; u16::from_be_bytes(len) as usize];
        read_exact_or_closed(reader, &mut payload).await?;
        unit.payload = Some(payload);
    }
    Ok(unit)
}

/// [`read_unit`] bounded by `limit`.
pub async fn read_unit_within<R>(reader: &mut R, limit: Duration) -> Result<Unit, WireError>
where
    R: AsyncRead + Unpin,
{
    match time::timeout(limit, read_unit(reader)).await {
        Ok(res) => res,
        Err(_) => Err(WireError::Timeout(limit)),
    }
}

pub async fn write_unit<W>(writer: &mut W, unit: &Unit) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = unit.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Closed),
        Err(e) => Err(WireError::Io(e)),
    }
}
