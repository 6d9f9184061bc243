use serde::{Deserialize, Serialize};

/// Outcome bucket for one probed port.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Target accepted and echoed the probe id back.
    Accepted,
    /// Connection refused or reset on every attempt.
    Closed,
    /// Connect timed out.
    Dropped,
    /// Connected, but the reply was missing or wrong. Usually another process owns the port.
    ServerError,
}

impl Classification {
    pub const ALL: [Classification; 4] = [
        Classification::Accepted,
        Classification::Closed,
        Classification::Dropped,
        Classification::ServerError,
    ];

    /// Short label used in summaries and the text report.
    pub fn label(self) -> &'static str {
        match self {
            Classification::Accepted => "accept",
            Classification::Closed => "close",
            Classification::Dropped => "drop",
            Classification::ServerError => "srverr",
        }
    }
}

/// Per-category counters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub accepted: u64,
    pub closed: u64,
    pub dropped: u64,
    pub server_error: u64,
}

impl Counts {
    pub fn get(&self, class: Classification) -> u64 {
        match class {
            Classification::Accepted => self.accepted,
            Classification::Closed => self.closed,
            Classification::Dropped => self.dropped,
            Classification::ServerError => self.server_error,
        }
    }

    pub fn bump(&mut self, class: Classification) {
        match class {
            Classification::Accepted => self.accepted += 1,
            Classification::Closed => self.closed += 1,
            Classification::Dropped => self.dropped += 1,
            Classification::ServerError => self.server_error += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.accepted + self.closed + self.dropped + self.server_error
    }
}

/// Why probe workers were stopped before their chunks were done.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbortCause {
    /// The target stopped answering heartbeats.
    HeartbeatLost,
    /// The local user interrupted the run.
    Interrupted,
}

/// Final per-category port lists, sorted ascending.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanResults {
    pub accepted: Vec<u16>,
    pub closed: Vec<u16>,
    pub dropped: Vec<u16>,
    pub server_error: Vec<u16>,
    /// Workers were stopped early; the lists may be incomplete.
    pub aborted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_cause: Option<AbortCause>,
}

impl ScanResults {
    pub fn list(&self, class: Classification) -> &[u16] {
        match class {
            Classification::Accepted => &self.accepted,
            Classification::Closed => &self.closed,
            Classification::Dropped => &self.dropped,
            Classification::ServerError => &self.server_error,
        }
    }

    pub fn list_mut(&mut self, class: Classification) -> &mut Vec<u16> {
        match class {
            Classification::Accepted => &mut self.accepted,
            Classification::Closed => &mut self.closed,
            Classification::Dropped => &mut self.dropped,
            Classification::ServerError => &mut self.server_error,
        }
    }

    pub fn counts(&self) -> Counts {
        Counts {
            accepted: self.accepted.len() as u64,
            closed: self.closed.len() as u64,
            dropped: self.dropped.len() as u64,
            server_error: self.server_error.len() as u64,
        }
    }

    pub fn total(&self) -> usize {
        Classification::ALL.iter().map(|c| self.list(*c).len()).sum()
    }
}

/// Run metadata for the report header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunInfo {
    pub server: String,
    pub data_port: u16,
    pub port_start: u32,
    pub port_end: u32,
    pub chunk_size: u32,
    pub chunks: u32,
    pub delay_secs: f64,
    pub started: String,
    pub finished: String,
    pub elapsed_secs: u64,
}

impl RunInfo {
    pub fn total_ports(&self) -> u32 {
        self.port_end.saturating_sub(self.port_start)
    }
}
