//! Progress display seam. The prober pushes notices and periodic snapshots
//! through [`Dashboard`]; [`LogDashboard`] renders them as log lines.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregate::Snapshot;

pub trait Dashboard: Send + Sync {
    /// One-off status line.
    fn notify(&self, text: &str);
    /// Latest counters.
    fn update(&self, snapshot: &Snapshot);
}

#[derive(Debug, Clone, Copy)]
pub struct LogDashboard {
    total_ports: u64,
    chunks: u64,
}

impl LogDashboard {
    pub fn new(total_ports: u64, chunks: u64) -> Self {
        Self { total_ports, chunks }
    }
}

impl Dashboard for LogDashboard {
    fn notify(&self, text: &str) {
        info!("{text}");
    }

    fn update(&self, s: &Snapshot) {
        info!(
            accept = s.counts.accepted,
            close = s.counts.closed,
            drop = s.counts.dropped,
            srverr = s.counts.server_error,
            workers = s.live_workers,
            "progress {}/{} ports, {} chunks total",
            s.counts.total(),
            self.total_ports,
            self.chunks
        );
    }
}

/// Push snapshots to `dashboard` at most once per `every`, until `done` fires.
/// A final update is always sent on the way out.
pub fn spawn_progress(
    dashboard: Arc<dyn Dashboard>,
    mut snapshots: watch::Receiver<Snapshot>,
    every: Duration,
    done: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = done.cancelled() => break,
                _ = ticker.tick() => {
                    if snapshots.has_changed().unwrap_or(false) {
                        let snap = *snapshots.borrow_and_update();
                        dashboard.update(&snap);
                    }
                }
            }
        }
        let last = *snapshots.borrow();
        dashboard.update(&last);
    })
}
