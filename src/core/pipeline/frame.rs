//! Frame codec for the data channel.
//!
//! Control frames are JSON text. Data frames are binary:
//!
//!   [2 bytes: sequence, big-endian] [N bytes: chunk]
//!
//! Sequence numbers run 1..=65535 within one file. The sender refuses files
//! that would exhaust the space (the field is not widened and wraparound is
//! never produced), and the receiver treats any out-of-line number as a gap.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::TransferError;

/// Bytes reserved at the front of every data frame for the sequence number.
pub const SEQ_PREFIX_LEN: usize = 2;

/// Sequence number of the first data frame of a file.
pub const FIRST_SEQ: u16 = 1;

/// Control frames, interleaved as JSON text around a file's data frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Announces the next file: declared name and total byte size.
    Meta { name: String, size: u64 },
    /// Terminates the file announced by the preceding `Meta`.
    Done,
}

impl ControlFrame {
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_wire(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Prefix `payload` with its big-endian sequence number.
pub fn encode_data_frame(seq: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEQ_PREFIX_LEN + payload.len());
    buf.put_u16(seq);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Split a data frame into its sequence number and chunk bytes.
pub fn decode_data_frame(frame: &Bytes) -> Result<(u16, Bytes), TransferError> {
    if frame.len() < SEQ_PREFIX_LEN {
        return Err(TransferError::Malformed(
            "data frame shorter than its sequence prefix",
        ));
    }
    let seq = u16::from_be_bytes([frame[0], frame[1]]);
    Ok((seq, frame.slice(SEQ_PREFIX_LEN..)))
}
