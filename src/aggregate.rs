//! Aggregate state, owned by a single task.
//!
//! Probe workers never touch the lists directly: they send [`ProbeEvent`]s to
//! the [`Aggregator`], which applies them in arrival order and publishes a
//! [`Snapshot`] after each one. The abort signal travels separately as a
//! `CancellationToken` so workers can poll it without a lock.
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::types::{Classification, Counts, ScanResults};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeEvent {
    WorkerStarted,
    Classified { port: u16, class: Classification },
    WorkerFinished,
}

/// What the dashboard sees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub counts: Counts,
    pub live_workers: u64,
    pub aborted: bool,
}

/// Cheap, cloneable sender side handed to every worker.
#[derive(Debug, Clone)]
pub struct AggregateHandle {
    events: mpsc::UnboundedSender<ProbeEvent>,
    abort: CancellationToken,
    snapshots: watch::Receiver<Snapshot>,
}

impl AggregateHandle {
    pub fn record(&self, port: u16, class: Classification) {
        self.send(ProbeEvent::Classified { port, class });
    }

    pub fn worker_started(&self) {
        self.send(ProbeEvent::WorkerStarted);
    }

    pub fn worker_finished(&self) {
        self.send(ProbeEvent::WorkerFinished);
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    fn send(&self, ev: ProbeEvent) {
        // Only fails once the aggregator is gone, at which point nobody reads the result.
        let _ = self.events.send(ev);
    }
}

/// Owner of the four category lists and the live-worker counter.
#[derive(Debug)]
pub struct Aggregator {
    events: mpsc::UnboundedReceiver<ProbeEvent>,
    snapshots: watch::Sender<Snapshot>,
    abort: CancellationToken,
    results: ScanResults,
    counts: Counts,
    live_workers: u64,
}

/// Create an aggregator and the first handle to it.
pub fn channel(abort: CancellationToken) -> (Aggregator, AggregateHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (snap_tx, snap_rx) = watch::channel(Snapshot::default());
    let aggregator = Aggregator {
        events: rx,
        snapshots: snap_tx,
        abort: abort.clone(),
        results: ScanResults::default(),
        counts: Counts::default(),
        live_workers: 0,
    };
    let handle = AggregateHandle {
        events: tx,
        abort,
        snapshots: snap_rx,
    };
    (aggregator, handle)
}

impl Aggregator {
    /// Apply events until every handle is dropped, then return the sorted lists.
    pub async fn run(mut self) -> ScanResults {
        while let Some(ev) = self.events.recv().await {
            self.apply(ev);
            self.publish();
        }
        self.finish()
    }

    fn apply(&mut self, ev: ProbeEvent) {
        match ev {
            ProbeEvent::WorkerStarted => self.live_workers += 1,
            ProbeEvent::WorkerFinished => self.live_workers = self.live_workers.saturating_sub(1),
            ProbeEvent::Classified { port, class } => {
                trace!(port, class = class.label(), "classified");
                self.counts.bump(class);
                self.results.list_mut(class).push(port);
            }
        }
    }

    fn publish(&self) {
        self.snapshots.send_replace(Snapshot {
            counts: self.counts,
            live_workers: self.live_workers,
            aborted: self.abort.is_cancelled(),
        });
    }

    fn finish(mut self) -> ScanResults {
        self.publish();
        for class in Classification::ALL {
            self.results.list_mut(class).sort_unstable();
        }
        self.results.aborted = self.abort.is_cancelled();
        self.results
    }
}
