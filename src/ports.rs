use crate::error::SessionError;

/// Largest chunk whose port-response payload still fits the u16 length prefix:
/// 2 bytes of count plus 2 bytes per port.
pub const MAX_CHUNK: u32 = (u16::MAX as u32 - 2) / 2;

/// Target-side generator that splits `[start, end)` into chunks of `chunk` ports.
///
/// The last real chunk may be shorter. After it, exactly one empty chunk is
/// yielded as the "exhausted" signal, then the iterator is done for good.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    end: u32,
    chunk: u32,
    cursor: u32,
    exhausted: bool,
}

impl PortAllocator {
    /// `end` is exclusive and may be 65536. A `chunk` of 0 is treated as 1.
    pub fn new(start: u32, end: u32, chunk: u32) -> Self {
        Self {
            end: end.min(u16::MAX as u32 + 1),
            chunk: chunk.max(1),
            cursor: start,
            exhausted: false,
        }
    }
}

impl Iterator for PortAllocator {
    type Item = Vec<u16>;

    fn next(&mut self) -> Option<Vec<u16>> {
        if self.exhausted {
            return None;
        }
        if self.cursor >= self.end {
            self.exhausted = true;
            return Some(Vec::new());
        }
        let high = self.cursor.saturating_add(self.chunk).min(self.end);
        let out = (self.cursor..high).map(|p| p as u16).collect();
        self.cursor = high;
        Some(out)
    }
}

pub fn chunk_count(start: u32, end: u32, chunk: u32) -> u32 {
    if end <= start {
        return 0;
    }
    (end - start).div_ceil(chunk.max(1))
}

/// Port-response payload: `[u16 count][count x u16 port]`, all big-endian.
/// An empty list encodes as `00 00`, the exhaustion signal.
pub fn encode_port_list(ports: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + ports.len() * 2);
    out.extend_from_slice(&(ports.len() as u16).to_be_bytes());
    for p in ports {
        out.extend_from_slice(&p.to_be_bytes());
    }
    out
}

pub fn decode_port_list(payload: &[u8]) -> Result<Vec<u16>, SessionError> {
    if payload.len() < 2 {
        return Err(SessionError::MalformedPortList(format!(
            "payload of {} bytes has no port count",
            payload.len()
        )));
    }
    let count = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let body = &payload[2..];
    if body.len() != count * 2 {
        return Err(SessionError::MalformedPortList(format!(
            "count says {count} ports but {} bytes follow",
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .collect())
}

/// Render a sorted port list as contiguous ranges, e.g. `[100,101,102,105]` -> `100-102, 105`.
pub fn compress_ranges(sorted: &[u16]) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut iter = sorted.iter().copied();
    let Some(first) = iter.next() else {
        return String::new();
    };
    let (mut lo, mut hi) = (first, first);
    for p in iter {
        if hi.checked_add(1) == Some(p) {
            hi = p;
            continue;
        }
        parts.push(render_range(lo, hi));
        lo = p;
        hi = p;
    }
    parts.push(render_range(lo, hi));
    parts.join(", ")
}

fn render_range(lo: u16, hi: u16) -> String {
    if lo == hi {
        lo.to_string()
    } else {
        format!("{lo}-{hi}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_then_one_empty_then_stop() {
        let chunks: Vec<Vec<u16>> = PortAllocator::new(100, 210, 50).collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], (100..150).collect::<Vec<u16>>());
        assert_eq!(chunks[1], (150..200).collect::<Vec<u16>>());
        assert_eq!(chunks[2], (200..210).collect::<Vec<u16>>());
        assert!(chunks[3].is_empty());
    }

    #[test]
    fn stays_stopped_after_exhaustion() {
        let mut alloc = PortAllocator::new(1, 2, 10);
        assert_eq!(alloc.next(), Some(vec![1]));
        assert_eq!(alloc.next(), Some(vec![]));
        assert_eq!(alloc.next(), None);
        assert_eq!(alloc.next(), None);
    }

    #[test]
    fn range_ending_at_65536() {
        let chunks: Vec<Vec<u16>> = PortAllocator::new(65530, 65536, 4).collect();
        assert_eq!(chunks[0], vec![65530, 65531, 65532, 65533]);
        assert_eq!(chunks[1], vec![65534, 65535]);
        assert!(chunks[2].is_empty());
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(100, 210, 50), 3);
        assert_eq!(chunk_count(0, 100, 100), 1);
        assert_eq!(chunk_count(5, 5, 10), 0);
    }

    #[test]
    fn port_list_payload_layout() {
        assert_eq!(encode_port_list(&[80, 443]), vec![0, 2, 0, 80, 1, 187]);
        assert_eq!(encode_port_list(&[]), vec![0, 0]);
        assert_eq!(decode_port_list(&[0, 2, 0, 80, 1, 187]).unwrap(), vec![80, 443]);
        assert!(decode_port_list(&[0, 0]).unwrap().is_empty());
    }

    #[test]
    fn port_list_count_mismatch_rejected() {
        assert!(decode_port_list(&[0, 3, 0, 80]).is_err());
        assert!(decode_port_list(&[0]).is_err());
    }

    #[test]
    fn compress_examples() {
        assert_eq!(compress_ranges(&[100, 101, 102, 105]), "100-102, 105");
        assert_eq!(compress_ranges(&[7]), "7");
        assert_eq!(compress_ranges(&[]), "");
        assert_eq!(compress_ranges(&[1, 3, 4, 65534, 65535]), "1, 3-4, 65534-65535");
    }

    #[test]
    fn max_chunk_fits_payload() {
        let ports: Vec<u16> = (0..MAX_CHUNK as u16).collect();
        assert!(encode_port_list(&ports).len() <= u16::MAX as usize);
    }
}
