//! Runtime configuration for both roles, as produced by the CLI.
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::ports::MAX_CHUNK;

/// Exclusive upper bound of the port space.
pub const PORT_SPACE_END: u32 = u16::MAX as u32 + 1;
/// Upper bound for the socket timeout and the heartbeat period, in seconds.
pub const MAX_INTERVAL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct ProberConfig {
    /// Target address; also the address every probed port is dialled on.
    pub server: IpAddr,
    pub data_port: u16,
    pub port_start: u32,
    /// Exclusive.
    pub port_end: u32,
    pub chunk: u32,
    /// Per-socket timeout in whole seconds (sent to the target in the handshake).
    pub timeout_secs: u64,
    /// Sleep between refused/reset connect attempts.
    pub delay: Duration,
    pub heartbeat_secs: u64,
    /// Upper bound on concurrently running probe workers.
    pub max_workers: usize,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            server: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            data_port: 8080,
            port_start: 1,
            port_end: 1025,
            chunk: 100,
            timeout_secs: 3,
            delay: Duration::from_secs(1),
            heartbeat_secs: 1,
            max_workers: 256,
        }
    }
}

impl ProberConfig {
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.data_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn total_ports(&self) -> u32 {
        self.port_end.saturating_sub(self.port_start)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port_start >= self.port_end {
            bail!(
                "invalid port range {}-{} (start must be below the exclusive end)",
                self.port_start,
                self.port_end
            );
        }
        if self.port_end > PORT_SPACE_END {
            bail!("port end {} is past {PORT_SPACE_END}", self.port_end);
        }
        if self.chunk == 0 || self.chunk > MAX_CHUNK {
            bail!("chunk size must be within 1..={MAX_CHUNK}, got {}", self.chunk);
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_INTERVAL_SECS {
            bail!("timeout must be within 1..={MAX_INTERVAL_SECS} seconds, got {}", self.timeout_secs);
        }
        if self.heartbeat_secs == 0 || self.heartbeat_secs > MAX_INTERVAL_SECS {
            bail!(
                "heartbeat period must be within 1..={MAX_INTERVAL_SECS} seconds, got {}",
                self.heartbeat_secs
            );
        }
        if self.max_workers == 0 {
            bail!("max workers must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Address the data port and every listen worker bind to.
    pub bind: IpAddr,
    pub data_port: u16,
    /// Whether the process may bind ports below 1024.
    pub privileged: bool,
}

impl TargetConfig {
    pub fn new(bind: IpAddr, data_port: u16) -> Self {
        Self {
            bind,
            data_port,
            privileged: has_elevated_privilege(),
        }
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.data_port)
    }
}

/// True when running as root.
#[cfg(unix)]
pub fn has_elevated_privilege() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Non-unix platforms do not reserve low ports.
#[cfg(not(unix))]
pub fn has_elevated_privilege() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ProberConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_bad_ranges() {
        let mut cfg = ProberConfig {
            port_start: 200,
            port_end: 100,
            ..ProberConfig::default()
        };
        assert!(cfg.validate().is_err());
        cfg.port_start = 1;
        cfg.port_end = PORT_SPACE_END + 1;
        assert!(cfg.validate().is_err());
        cfg.port_end = PORT_SPACE_END;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_oversized_chunk() {
        let cfg = ProberConfig {
            chunk: MAX_CHUNK + 1,
            ..ProberConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_huge_intervals() {
        let cfg = ProberConfig {
            heartbeat_secs: u64::MAX,
            ..ProberConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = ProberConfig {
            timeout_secs: MAX_INTERVAL_SECS + 1,
            ..ProberConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
