//! Library crate for drop-detect-rs: detect selective TCP port interference
//! between a prober and a cooperating target.
pub mod aggregate;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod ports;
pub mod prober;
pub mod report;
pub mod target;
pub mod types;
pub mod wire;
