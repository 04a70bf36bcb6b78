//! Chunked file transfer over the peer data channel.
//!
//! # Protocol overview
//!
//! - One file at a time. The sender emits a `meta` control frame, the file
//!   body as sequenced binary frames, then a `done` control frame.
//! - Control frames are UTF-8 JSON text; data frames carry a 2-byte
//!   big-endian sequence number (starting at 1, no gaps) followed by raw
//!   chunk bytes.
//! - Flow control: a frame is transmitted only while the channel's buffered
//!   amount sits at or below the low-buffer watermark; otherwise the sender
//!   suspends on a single-slot drain signal.
//! - Reliable, ordered delivery is delegated to the transport; the sequence
//!   prefix exists to detect reassembly corruption, not to reorder.

pub mod frame;
pub mod receiver;
pub mod sender;

use thiserror::Error;

use crate::core::connection::transport::TransportError;

/// Transfer-protocol failures. Every one of these is surfaced to the caller;
/// none is silently swallowed.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A data frame arrived out of order. There is no retransmission, so the
    /// defined recovery is aborting the active receive.
    #[error("sequence gap: expected {expected}, got {got}")]
    SequenceGap { expected: u16, got: u16 },
    /// A frame arrived that the receiver state cannot accept.
    #[error("protocol violation: {0}")]
    ReceiverState(&'static str),
    /// The file would need more frames than the 16-bit sequence space holds.
    /// Oversized files are rejected before the first frame goes out.
    #[error("file needs {chunks} chunks, exceeding the 65535-frame sequence space")]
    SequenceExhausted { chunks: u64 },
    /// A second transfer was started while one is in flight.
    #[error("another transfer is already in flight")]
    Busy,
    #[error("not implemented: {0}")]
    Unsupported(&'static str),
    #[error("transfer cancelled")]
    Cancelled,
    /// The single-slot drain waiter was already registered. Transfers are
    /// serialized, so this indicates a flow-control bug, not peer behavior.
    #[error("drain waiter already registered")]
    FlowControl,
    /// A frame that cannot be decoded at all.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("control frame codec: {0}")]
    Codec(#[from] serde_json::Error),
    /// Materialization requested before the file completed.
    #[error("file receive is not complete")]
    Incomplete,
    #[error("transport send failed: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
