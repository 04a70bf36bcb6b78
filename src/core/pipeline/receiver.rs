//! Receive-side reassembly.
//!
//! A `meta` control frame opens a [`FileReceiver`]; in-order data frames
//! append to it; `done` seals it. Exactly one receiver is active at any
//! instant, and completed receivers stay around until the application takes
//! them, so a finished file can be materialized (once) and saved later.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use super::frame::{decode_data_frame, ControlFrame, FIRST_SEQ};
use super::TransferError;

/// Accumulates one file from its ordered sequence of data frames.
#[derive(Debug)]
pub struct FileReceiver {
    id: u64,
    name: String,
    declared_size: u64,
    /// Received byte ranges in arrival order.
    segments: Vec<Bytes>,
    received: u64,
    /// Sequence number the next data frame must carry. Kept wider than the
    /// wire field so frame 65535 is never followed by an accepted wrap.
    next_seq: u32,
    complete: bool,
    /// Materialized content, built once on first access after completion.
    blob: Option<Bytes>,
}

impl FileReceiver {
    fn new(id: u64, name: String, declared_size: u64) -> Self {
        Self {
            id,
            name,
            declared_size,
            segments: Vec::new(),
            received: 0,
            next_seq: u32::from(FIRST_SEQ),
            complete: false,
            blob: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn append(&mut self, seq: u16, chunk: Bytes) -> Result<(), TransferError> {
        if u32::from(seq) != self.next_seq {
            return Err(TransferError::SequenceGap {
                expected: self.next_seq as u16,
                got: seq,
            });
        }
        self.next_seq += 1;
        self.received += chunk.len() as u64;
        self.segments.push(chunk);
        Ok(())
    }

    fn finish(&mut self) {
        self.complete = true;
    }

    /// The file content as one contiguous buffer.
    ///
    /// Computed lazily on the first call after completion; later calls return
    /// the same cached buffer (clones share the underlying allocation).
    pub fn materialize(&mut self) -> Result<Bytes, TransferError> {
        if !self.complete {
            return Err(TransferError::Incomplete);
        }
        if let Some(blob) = &self.blob {
            return Ok(blob.clone());
        }
        let mut buf = BytesMut::with_capacity(self.received as usize);
        for segment in &self.segments {
            buf.extend_from_slice(segment);
        }
        let blob = buf.freeze();
        self.blob = Some(blob.clone());
        Ok(blob)
    }
}

/// What the assembler reports after consuming one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Started { id: u64, name: String, size: u64 },
    Progress { id: u64, received: u64, size: u64 },
    Finished { id: u64, name: String, size: u64 },
}

/// Demultiplexes the inbound frame stream into [`FileReceiver`]s.
#[derive(Debug, Default)]
pub struct FileAssembler {
    next_id: u64,
    active: Option<u64>,
    receivers: HashMap<u64, FileReceiver>,
}

impl FileAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a control frame (text).
    pub fn on_text(&mut self, text: &str) -> Result<InboundEvent, TransferError> {
        let frame = ControlFrame::from_wire(text)
            .map_err(|_| TransferError::Malformed("unparseable control frame"))?;
        match frame {
            ControlFrame::Meta { name, size } => self.on_meta(name, size),
            ControlFrame::Done => self.on_done(),
        }
    }

    /// Consume a data frame (binary).
    pub fn on_binary(&mut self, frame: &Bytes) -> Result<InboundEvent, TransferError> {
        let (seq, chunk) = decode_data_frame(frame)?;
        let id = self
            .active
            .ok_or(TransferError::ReceiverState("data frame with no active receiver"))?;
        let receiver = self
            .receivers
            .get_mut(&id)
            .ok_or(TransferError::ReceiverState("active receiver missing"))?;
        receiver.append(seq, chunk)?;
        Ok(InboundEvent::Progress {
            id,
            received: receiver.received,
            size: receiver.declared_size,
        })
    }

    fn on_meta(&mut self, name: String, size: u64) -> Result<InboundEvent, TransferError> {
        if self.active.is_some() {
            return Err(TransferError::ReceiverState(
                "meta frame while another receive is active",
            ));
        }
        self.next_id += 1;
        let id = self.next_id;
        self.receivers
            .insert(id, FileReceiver::new(id, name.clone(), size));
        self.active = Some(id);
        Ok(InboundEvent::Started { id, name, size })
    }

    fn on_done(&mut self) -> Result<InboundEvent, TransferError> {
        let id = self
            .active
            .take()
            .ok_or(TransferError::ReceiverState("done frame with no active receiver"))?;
        let receiver = self
            .receivers
            .get_mut(&id)
            .ok_or(TransferError::ReceiverState("active receiver missing"))?;
        receiver.finish();
        Ok(InboundEvent::Finished {
            id,
            name: receiver.name.clone(),
            size: receiver.received,
        })
    }

    /// Discard the in-progress receive — the defined recovery action for a
    /// sequence gap, since no retransmission mechanism exists.
    pub fn abort_active(&mut self) -> Option<u64> {
        let id = self.active.take()?;
        self.receivers.remove(&id);
        Some(id)
    }

    pub fn receiver(&self, id: u64) -> Option<&FileReceiver> {
        self.receivers.get(&id)
    }

    pub fn receiver_mut(&mut self, id: u64) -> Option<&mut FileReceiver> {
        self.receivers.get_mut(&id)
    }

    /// Remove a (typically completed) receiver from the retained set.
    pub fn take(&mut self, id: u64) -> Option<FileReceiver> {
        if self.active == Some(id) {
            self.active = None;
        }
        self.receivers.remove(&id)
    }

    pub fn active_id(&self) -> Option<u64> {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipeline::frame::encode_data_frame;

    fn meta(name: &str, size: u64) -> String {
        ControlFrame::Meta {
            name: name.into(),
            size,
        }
        .to_wire()
        .unwrap()
    }

    fn done() -> String {
        ControlFrame::Done.to_wire().unwrap()
    }

    /// Feed a whole file through the assembler in `payload`-sized chunks.
    fn feed_file(asm: &mut FileAssembler, name: &str, content: &[u8], payload: usize) -> u64 {
        let id = match asm.on_text(&meta(name, content.len() as u64)).unwrap() {
            InboundEvent::Started { id, .. } => id,
            other => panic!("unexpected event: {other:?}"),
        };
        let mut seq: u16 = FIRST_SEQ;
        for chunk in content.chunks(payload) {
            asm.on_binary(&encode_data_frame(seq, chunk)).unwrap();
            seq += 1;
        }
        match asm.on_text(&done()).unwrap() {
            InboundEvent::Finished { id: fid, .. } => assert_eq!(fid, id),
            other => panic!("unexpected event: {other:?}"),
        }
        id
    }

    #[test]
    fn round_trip_is_byte_identical_across_boundary_sizes() {
        const PAYLOAD: usize = 64;
        for size in [0usize, PAYLOAD - 1, PAYLOAD, PAYLOAD + 1, 10 * PAYLOAD + 37] {
            let content: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut asm = FileAssembler::new();
            let id = feed_file(&mut asm, "blob.bin", &content, PAYLOAD);

            let receiver = asm.receiver_mut(id).unwrap();
            assert!(receiver.is_complete());
            assert_eq!(receiver.name(), "blob.bin");
            assert_eq!(receiver.received(), size as u64);
            assert_eq!(&receiver.materialize().unwrap()[..], &content[..]);
        }
    }

    #[test]
    fn receiver_ids_are_monotonic() {
        let mut asm = FileAssembler::new();
        let first = feed_file(&mut asm, "a", b"aa", 16);
        let second = feed_file(&mut asm, "b", b"bb", 16);
        assert_eq!(second, first + 1);
        // Both are retained until taken.
        assert!(asm.receiver(first).is_some());
        assert!(asm.take(first).is_some());
        assert!(asm.receiver(first).is_none());
        assert!(asm.receiver(second).is_some());
    }

    #[test]
    fn sequence_gap_is_reported() {
        let mut asm = FileAssembler::new();
        asm.on_text(&meta("f", 100)).unwrap();
        asm.on_binary(&encode_data_frame(1, b"x")).unwrap();
        let err = asm.on_binary(&encode_data_frame(3, b"y")).unwrap_err();
        assert!(
            matches!(err, TransferError::SequenceGap { expected: 2, got: 3 }),
            "{err:?}"
        );
        // Recovery: abort the transfer.
        let aborted = asm.abort_active().unwrap();
        assert!(asm.receiver(aborted).is_none());
        assert!(asm.active_id().is_none());
    }

    #[test]
    fn duplicate_sequence_is_a_gap_too() {
        let mut asm = FileAssembler::new();
        asm.on_text(&meta("f", 100)).unwrap();
        asm.on_binary(&encode_data_frame(1, b"x")).unwrap();
        let err = asm.on_binary(&encode_data_frame(1, b"x")).unwrap_err();
        assert!(matches!(err, TransferError::SequenceGap { expected: 2, got: 1 }));
    }

    #[test]
    fn data_without_meta_is_a_protocol_violation() {
        let mut asm = FileAssembler::new();
        let err = asm.on_binary(&encode_data_frame(1, b"x")).unwrap_err();
        assert!(matches!(err, TransferError::ReceiverState(_)));
    }

    #[test]
    fn done_without_meta_is_a_protocol_violation() {
        let mut asm = FileAssembler::new();
        let err = asm.on_text(&done()).unwrap_err();
        assert!(matches!(err, TransferError::ReceiverState(_)));
    }

    #[test]
    fn meta_while_active_is_a_protocol_violation() {
        let mut asm = FileAssembler::new();
        asm.on_text(&meta("first", 10)).unwrap();
        let err = asm.on_text(&meta("second", 10)).unwrap_err();
        assert!(matches!(err, TransferError::ReceiverState(_)));
        // The active receive is untouched; the caller decides whether to abort.
        assert!(asm.active_id().is_some());
    }

    #[test]
    fn materialize_is_idempotent_and_cached() {
        let mut asm = FileAssembler::new();
        let id = feed_file(&mut asm, "f", b"hello world", 4);
        let receiver = asm.receiver_mut(id).unwrap();
        let first = receiver.materialize().unwrap();
        let second = receiver.materialize().unwrap();
        assert_eq!(first, second);
        // Same backing buffer, not a recomputation.
        assert_eq!(first.as_ptr(), second.as_ptr());
    }

    #[test]
    fn materialize_before_done_is_rejected() {
        let mut asm = FileAssembler::new();
        asm.on_text(&meta("f", 4)).unwrap();
        asm.on_binary(&encode_data_frame(1, b"ab")).unwrap();
        let id = asm.active_id().unwrap();
        let err = asm.receiver_mut(id).unwrap().materialize().unwrap_err();
        assert!(matches!(err, TransferError::Incomplete));
    }

    #[test]
    fn progress_counts_received_bytes() {
        let mut asm = FileAssembler::new();
        asm.on_text(&meta("f", 6)).unwrap();
        let ev = asm.on_binary(&encode_data_frame(1, b"abc")).unwrap();
        assert_eq!(
            ev,
            InboundEvent::Progress {
                id: 1,
                received: 3,
                size: 6
            }
        );
        let ev = asm.on_binary(&encode_data_frame(2, b"def")).unwrap();
        assert!(matches!(ev, InboundEvent::Progress { received: 6, .. }));
    }
}
