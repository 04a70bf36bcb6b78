//! Bandwidth sampling. Purely observational: reads the wire counters on a
//! timer and reports per-interval rates; never touches link state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::utils::stop::StopSignal;

use super::LinkEvent;

/// Cumulative wire-level byte counters, bumped by the frame sink (tx) and the
/// inbound frame path (rx).
#[derive(Debug, Default)]
pub struct WireCounters {
    tx: AtomicU64,
    rx: AtomicU64,
}

impl WireCounters {
    pub fn add_tx(&self, bytes: u64) {
        self.tx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_rx(&self, bytes: u64) {
        self.rx.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, u64) {
        (self.tx.load(Ordering::Relaxed), self.rx.load(Ordering::Relaxed))
    }
}

/// One bandwidth measurement over a sampling interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub sent_per_sec: u64,
    pub recv_per_sec: u64,
}

/// Start the periodic sampler. Runs until `stop` fires or the event channel
/// closes.
pub fn spawn_sampler(
    counters: Arc<WireCounters>,
    interval: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
    stop: StopSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; it only seeds the baseline.
        ticker.tick().await;
        let (mut last_tx, mut last_rx) = counters.snapshot();
        let mut last_at = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.wait() => break,
            }
            let (tx, rx) = counters.snapshot();
            let elapsed_ms = last_at.elapsed().as_millis().max(1) as u64;
            last_at = tokio::time::Instant::now();

            let sample = BandwidthSample {
                sent_per_sec: (tx - last_tx) * 1000 / elapsed_ms,
                recv_per_sec: (rx - last_rx) * 1000 / elapsed_ms,
            };
            last_tx = tx;
            last_rx = rx;

            trace!(event = "bandwidth_sample", up = sample.sent_per_sec, down = sample.recv_per_sec);
            if events.send(LinkEvent::Stats(sample)).is_err() {
                break;
            }
        }
    })
}
