//! Flow-controlled sender.
//!
//! Streams a file from disk through a bounded read-ahead queue and feeds the
//! resulting frames to the data channel strictly in order, suspending on the
//! drain signal whenever the channel's buffered amount sits above the
//! low-buffer watermark. Frames are never dropped, duplicated, or reordered
//! across suspensions.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::core::config::READ_AHEAD_FRAMES;
use crate::core::connection::stats::WireCounters;
use crate::core::connection::transport::DataChannel;
use crate::utils::stop::StopSignal;

use super::frame::{encode_data_frame, ControlFrame, FIRST_SEQ, SEQ_PREFIX_LEN};
use super::TransferError;

// ── Drain signal ─────────────────────────────────────────────────────────────

/// Single-slot "buffer drained" signal.
///
/// At most one waiter may be registered at a time; transfers are serialized
/// by the sink's transfer lock, so a second registration is a flow-control
/// bug and is reported as such rather than silently stacking waiters.
#[derive(Debug, Default)]
pub struct DrainSignal {
    slot: Mutex<Option<oneshot::Sender<()>>>,
}

impl DrainSignal {
    pub(crate) fn arm(&self) -> Result<oneshot::Receiver<()>, TransferError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(TransferError::FlowControl);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(tx);
        Ok(rx)
    }

    pub(crate) fn disarm(&self) {
        self.slot.lock().take();
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Deliver the one-shot notification. No-op when nothing is armed.
    pub fn fire(&self) {
        if let Some(waiter) = self.slot.lock().take() {
            let _ = waiter.send(());
        }
    }
}

// ── Frame sink ───────────────────────────────────────────────────────────────

/// Outcome of a completed file send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReport {
    pub name: String,
    pub size: u64,
    pub frames: u32,
}

/// Flow-controlled writer for one data channel.
pub struct FrameSink<C: DataChannel> {
    channel: C,
    /// Whole-frame budget in bytes; the chunk payload is this minus the
    /// sequence prefix.
    chunk_size: usize,
    watermark: AtomicUsize,
    drain: DrainSignal,
    /// One file at a time; held for the whole meta..done span.
    transfer_lock: tokio::sync::Mutex<()>,
    wire: Arc<WireCounters>,
}

impl<C: DataChannel> FrameSink<C> {
    pub fn new(channel: C, chunk_size: usize, watermark: usize, wire: Arc<WireCounters>) -> Self {
        Self {
            channel,
            chunk_size,
            watermark: AtomicUsize::new(watermark),
            drain: DrainSignal::default(),
            transfer_lock: tokio::sync::Mutex::new(()),
            wire,
        }
    }

    pub fn watermark(&self) -> usize {
        self.watermark.load(Ordering::Acquire)
    }

    /// Adopt a (re)negotiated watermark and push it into the channel as the
    /// drain threshold.
    pub async fn configure_watermark(&self, bytes: usize) {
        self.watermark.store(bytes, Ordering::Release);
        self.channel.set_drain_threshold(bytes).await;
    }

    /// The drain signal the transport's buffer-low notification feeds.
    pub fn drain(&self) -> &DrainSignal {
        &self.drain
    }

    /// Send one file: `meta`, the sequenced chunk frames, then `done`.
    ///
    /// `stop` doubles as the cancel handle for this transfer; cancellation
    /// takes effect between frames and during backpressure waits.
    pub async fn send_file(&self, path: &Path, stop: &StopSignal) -> Result<SendReport, TransferError> {
        let _transfer = self.transfer_lock.try_lock().map_err(|_| TransferError::Busy)?;

        let size = tokio::fs::metadata(path).await?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();

        let payload = self.chunk_size - SEQ_PREFIX_LEN;
        let chunks = size.div_ceil(payload as u64);
        if chunks > u64::from(u16::MAX) {
            return Err(TransferError::SequenceExhausted { chunks });
        }

        info!(event = "file_send_start", name = %name, size, chunks);
        let meta = ControlFrame::Meta {
            name: name.clone(),
            size,
        };
        self.transmit_text(meta.to_wire()?, stop).await?;

        let (mut frames, reader) = spawn_reader(path.to_path_buf(), size, chunks as u16, payload);
        let mut sent: u32 = 0;
        while let Some(frame) = frames.recv().await {
            self.transmit_binary(frame, stop).await?;
            sent += 1;
        }
        reader.await.map_err(std::io::Error::other)??;

        self.transmit_text(ControlFrame::Done.to_wire()?, stop).await?;
        info!(event = "file_send_done", name = %name, size, frames = sent);

        Ok(SendReport {
            name,
            size,
            frames: sent,
        })
    }

    /// Multi-file queueing is out of scope; one `send_file` at a time.
    pub async fn send_files(&self, _paths: &[PathBuf], _stop: &StopSignal) -> Result<(), TransferError> {
        Err(TransferError::Unsupported("concurrent multi-file transfer"))
    }

    /// Wait (bounded by `stop`) for the channel to hand everything to the
    /// network. Called before tearing the link down after a send.
    pub async fn settle(&self, stop: &StopSignal) {
        while !stop.is_stopped() && self.channel.buffered_amount().await > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn transmit_binary(&self, frame: Bytes, stop: &StopSignal) -> Result<(), TransferError> {
        self.wait_capacity(stop).await?;
        let len = frame.len();
        self.channel.send_binary(frame).await?;
        self.wire.add_tx(len as u64);
        Ok(())
    }

    async fn transmit_text(&self, text: String, stop: &StopSignal) -> Result<(), TransferError> {
        self.wait_capacity(stop).await?;
        let len = text.len();
        self.channel.send_text(text).await?;
        self.wire.add_tx(len as u64);
        Ok(())
    }

    /// Suspend until the buffered amount is at or below the watermark.
    async fn wait_capacity(&self, stop: &StopSignal) -> Result<(), TransferError> {
        loop {
            if stop.is_stopped() {
                return Err(TransferError::Cancelled);
            }
            let limit = self.watermark();
            if self.channel.buffered_amount().await <= limit {
                return Ok(());
            }

            let drained = self.drain.arm()?;
            // The buffer may have drained between the check and the arm, in
            // which case the engine's one-shot has already come and gone.
            if self.channel.buffered_amount().await <= limit {
                self.drain.disarm();
                return Ok(());
            }
            debug!(
                event = "backpressure_wait",
                watermark = limit,
                "suspending until the channel drains"
            );
            tokio::select! {
                _ = drained => {}
                _ = stop.wait() => {
                    self.drain.disarm();
                    return Err(TransferError::Cancelled);
                }
            }
        }
    }
}

// ── Disk reader ──────────────────────────────────────────────────────────────

/// Spawn the disk reader that fills the outbound frame queue.
///
/// The bounded channel is the frame queue: FIFO, at most [`READ_AHEAD_FRAMES`]
/// frames ahead of the flow-controlled consumer.
fn spawn_reader(
    path: PathBuf,
    size: u64,
    chunks: u16,
    payload: usize,
) -> (
    mpsc::Receiver<Bytes>,
    tokio::task::JoinHandle<Result<(), std::io::Error>>,
) {
    let (tx, rx) = mpsc::channel(READ_AHEAD_FRAMES);

    let handle = tokio::spawn(async move {
        let mut file = tokio::fs::File::open(&path).await?;
        for seq in FIRST_SEQ..=chunks {
            let offset = u64::from(seq - 1) * payload as u64;
            let len = (payload as u64).min(size - offset) as usize;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).await?;
            if tx.send(encode_data_frame(seq, &buf)).await.is_err() {
                // Consumer dropped (send failed or was cancelled).
                break;
            }
        }
        Ok(())
    });

    (rx, handle)
}

// ── Tests ────────────────────────────────────────────────────────────────────
