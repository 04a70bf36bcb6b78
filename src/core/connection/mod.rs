//! Peer link: the negotiation state machine and data-channel lifecycle for
//! one local participant.
//!
//! The link reacts to two inbound streams — relay messages and transport
//! events — and reports everything observable on one typed event channel.
//! All of its state is mutated from the single worker task that owns it; the
//! flow-controlled sender runs apart but only touches the frame sink.

pub mod stats;
pub mod transport;
pub mod webrtc;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::config::{self, Settings};
use crate::core::pipeline::receiver::{FileAssembler, FileReceiver, InboundEvent};
use crate::core::pipeline::sender::FrameSink;
use crate::core::pipeline::TransferError;
use crate::core::signaling::{SessionId, SignalingMessage};
use crate::utils::stop::StopSignal;

use stats::{BandwidthSample, WireCounters};
use transport::{DataChannel, Transport, TransportError, TransportEvent, TransportState};

// ── States / errors / events ─────────────────────────────────────────────────

/// Negotiation state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Offering,
    Answering,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Idle => "idle",
            LinkState::Offering => "offering",
            LinkState::Answering => "answering",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Link-level failures. Negotiation failures are fatal to the attempt and
/// never retried automatically; the caller decides whether to connect again.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connect rejected in state {state}: negotiation in flight or link closed")]
    DoubleConnect { state: LinkState },
    #[error("negotiation failed: {0}")]
    Negotiation(#[from] TransportError),
    #[error("negotiation timed out after {0:?}")]
    NegotiationTimeout(Duration),
    #[error("signaling channel closed")]
    SignalingClosed,
}

/// Everything the link reports, as one fixed tagged union.
#[derive(Debug)]
pub enum LinkEvent {
    StateChanged(LinkState),
    PeerJoined(SessionId),
    PeerLeft(SessionId),
    /// An `error` message from the relay (admission rejection, full room).
    RelayError(String),
    Stats(BandwidthSample),
    ReceiveFileStarted { id: u64, name: String, size: u64 },
    ReceiveFileProgress { id: u64, received: u64, size: u64 },
    ReceiveFileDone { id: u64, name: String, size: u64 },
    /// A fatal link failure raised outside a `connect()` call.
    Failure(LinkError),
    /// A transfer-protocol error; the link stays up.
    TransferFailure(TransferError),
}

/// Link tunables, resolved from [`Settings`].
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub chunk_size: usize,
    pub default_watermark: usize,
    pub watermark_scale: usize,
    pub negotiation_timeout: Duration,
    pub stats_interval: Duration,
}

impl From<&Settings> for LinkSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            default_watermark: settings.watermark,
            watermark_scale: config::WATERMARK_SCALE,
            negotiation_timeout: settings.negotiation_timeout,
            stats_interval: settings.stats_interval,
        }
    }
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

// ── Peer link ────────────────────────────────────────────────────────────────

pub struct PeerLink<T: Transport> {
    transport: T,
    settings: LinkSettings,
    state: LinkState,
    local_id: Option<SessionId>,
    remote_id: Option<SessionId>,
    sink: Option<Arc<FrameSink<T::Channel>>>,
    assembler: FileAssembler,
    /// Max message size advertised by the remote, once connected.
    max_message_size: Option<usize>,
    watermark: usize,
    /// Armed while a negotiation attempt is outstanding.
    deadline: Option<Instant>,
    signals: mpsc::UnboundedSender<SignalingMessage>,
    events: mpsc::UnboundedSender<LinkEvent>,
    wire: Arc<WireCounters>,
    sampler_stop: Option<StopSignal>,
}

impl<T: Transport> PeerLink<T> {
    pub fn new(
        transport: T,
        signals: mpsc::UnboundedSender<SignalingMessage>,
        events: mpsc::UnboundedSender<LinkEvent>,
        settings: LinkSettings,
    ) -> Self {
        let watermark = settings.default_watermark;
        Self {
            transport,
            settings,
            state: LinkState::Idle,
            local_id: None,
            remote_id: None,
            sink: None,
            assembler: FileAssembler::new(),
            max_message_size: None,
            watermark,
            deadline: None,
            signals,
            events,
            wire: Arc::new(WireCounters::default()),
            sampler_stop: None,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn local_session(&self) -> Option<SessionId> {
        self.local_id
    }

    pub fn remote_session(&self) -> Option<SessionId> {
        self.remote_id
    }

    pub fn watermark(&self) -> usize {
        self.watermark
    }

    pub fn max_message_size(&self) -> Option<usize> {
        self.max_message_size
    }

    /// The flow-controlled sender, once a data channel exists.
    pub fn sink(&self) -> Option<Arc<FrameSink<T::Channel>>> {
        self.sink.clone()
    }

    pub fn wire_counters(&self) -> Arc<WireCounters> {
        self.wire.clone()
    }

    /// Deadline of the outstanding negotiation attempt, if one is armed.
    pub fn negotiation_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remove a completed receiver from the retained set.
    pub fn take_file(&mut self, id: u64) -> Option<FileReceiver> {
        self.assembler.take(id)
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Ask the relay to put us in `room`. No state change until a pairing
    /// notification arrives.
    pub fn join(&self, room: &str) -> Result<(), LinkError> {
        self.send_signal(SignalingMessage::Join {
            room: room.to_string(),
        })
    }

    /// Start negotiating as the offering side.
    ///
    /// A no-op when already connected. While a negotiation is in flight the
    /// call is rejected instead of racing it; after a failed or lost attempt
    /// the caller may invoke it again (nothing retries automatically).
    pub async fn connect(&mut self) -> Result<(), LinkError> {
        match self.state {
            LinkState::Connected => return Ok(()),
            LinkState::Idle | LinkState::Failed | LinkState::Disconnected => {}
            state => return Err(LinkError::DoubleConnect { state }),
        }
        match self.start_offer().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Fatal to this attempt; the caller may connect() again.
                self.sink = None;
                self.set_state(LinkState::Failed);
                Err(e)
            }
        }
    }

    async fn start_offer(&mut self) -> Result<(), LinkError> {
        let channel = self
            .transport
            .create_data_channel(config::DATA_CHANNEL_LABEL)
            .await?;
        self.install_channel(channel).await;

        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.send_signal(SignalingMessage::Offer { payload: offer })?;

        self.arm_deadline();
        self.set_state(LinkState::Offering);
        Ok(())
    }

    /// Consume one message from the relay.
    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Welcome { session } => {
                debug!(event = "session_assigned", %session);
                self.local_id = Some(session);
            }
            SignalingMessage::UserJoin { peer } => {
                info!(event = "peer_joined", %peer);
                self.remote_id = Some(peer);
                self.emit(LinkEvent::PeerJoined(peer));
            }
            SignalingMessage::UserLeave { peer } => {
                info!(event = "peer_left", %peer);
                self.remote_id = None;
                self.emit(LinkEvent::PeerLeft(peer));
            }
            SignalingMessage::Offer { payload } => {
                if let Err(e) = self.accept_offer(payload).await {
                    self.fail_negotiation(e);
                }
            }
            SignalingMessage::Answer { payload } => {
                if let Err(e) = self.transport.set_remote_description(payload).await {
                    self.fail_negotiation(e.into());
                }
            }
            SignalingMessage::Candidate { payload } => {
                // Malformed candidates are logged and change nothing.
                if let Err(e) = self.transport.add_ice_candidate(payload).await {
                    warn!(event = "candidate_rejected", error = %e);
                }
            }
            SignalingMessage::Error { message } => {
                warn!(event = "relay_error", message = %message);
                self.emit(LinkEvent::RelayError(message));
            }
            other => {
                warn!(event = "unexpected_signal", ?other);
            }
        }
    }

    /// Answer an inbound offer. The answer-side data channel is announced by
    /// the engine via [`TransportEvent::ChannelOpen`].
    async fn accept_offer(&mut self, payload: serde_json::Value) -> Result<(), LinkError> {
        if self.state != LinkState::Idle {
            debug!(event = "offer_in_state", state = %self.state);
        }
        self.transport.set_remote_description(payload).await?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.send_signal(SignalingMessage::Answer { payload: answer })?;

        self.arm_deadline();
        self.set_state(LinkState::Answering);
        self.set_state(LinkState::Connecting);
        Ok(())
    }

    /// Consume one event from the transport engine.
    pub async fn handle_transport_event(&mut self, event: TransportEvent<T::Channel>) {
        match event {
            TransportEvent::StateChanged(state) => self.on_transport_state(state).await,
            TransportEvent::ChannelOpen(channel) => self.install_channel(channel).await,
            TransportEvent::ChannelText(text) => {
                self.wire.add_rx(text.len() as u64);
                match self.assembler.on_text(&text) {
                    Ok(inbound) => self.emit_inbound(inbound),
                    Err(e) => self.on_transfer_error(e),
                }
            }
            TransportEvent::ChannelBinary(frame) => {
                self.wire.add_rx(frame.len() as u64);
                match self.assembler.on_binary(&frame) {
                    Ok(inbound) => self.emit_inbound(inbound),
                    Err(e) => self.on_transfer_error(e),
                }
            }
            TransportEvent::BufferLow => {
                if let Some(sink) = &self.sink {
                    sink.drain().fire();
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                if self
                    .send_signal(SignalingMessage::Candidate { payload: candidate })
                    .is_err()
                {
                    debug!(event = "candidate_after_signaling_closed");
                }
            }
        }
    }

    /// The negotiation deadline expired before the transport connected.
    pub fn on_negotiation_timeout(&mut self) {
        if !matches!(
            self.state,
            LinkState::Offering | LinkState::Answering | LinkState::Connecting
        ) {
            return;
        }
        let waited = self.settings.negotiation_timeout;
        warn!(event = "negotiation_timeout", ?waited);
        self.deadline = None;
        self.set_state(LinkState::Failed);
        self.emit(LinkEvent::Failure(LinkError::NegotiationTimeout(waited)));
    }

    /// Tear the link down locally.
    pub async fn close(&mut self) {
        self.transport.close().await;
        self.terminal(LinkState::Closed);
    }

    // ── Transport reactions ──────────────────────────────────────────────

    async fn on_transport_state(&mut self, state: TransportState) {
        match state {
            TransportState::New => {}
            TransportState::Connecting => {
                if matches!(self.state, LinkState::Offering | LinkState::Answering) {
                    self.set_state(LinkState::Connecting);
                }
            }
            TransportState::Connected => self.on_connected().await,
            TransportState::Disconnected => self.terminal(LinkState::Disconnected),
            TransportState::Failed => self.terminal(LinkState::Failed),
            TransportState::Closed => self.terminal(LinkState::Closed),
        }
    }

    async fn on_connected(&mut self) {
        self.deadline = None;
        self.max_message_size = self.transport.remote_max_message_size().await;
        self.watermark = match self.max_message_size {
            Some(max) => max * self.settings.watermark_scale,
            None => self.settings.default_watermark,
        };
        info!(
            event = "link_connected",
            watermark = self.watermark,
            max_message_size = ?self.max_message_size,
        );
        if let Some(sink) = &self.sink {
            sink.configure_watermark(self.watermark).await;
        }
        self.set_state(LinkState::Connected);
        self.start_sampler();
    }

    async fn install_channel(&mut self, channel: T::Channel) {
        if self.sink.is_some() {
            // The offer side created the sink at connect(); the open
            // announcement refers to the same channel.
            debug!(event = "channel_already_installed", label = channel.label());
            return;
        }
        debug!(event = "channel_installed", label = channel.label());
        let sink = Arc::new(FrameSink::new(
            channel,
            self.settings.chunk_size,
            self.watermark,
            self.wire.clone(),
        ));
        if self.state == LinkState::Connected {
            sink.configure_watermark(self.watermark).await;
        }
        self.sink = Some(sink);
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn on_transfer_error(&mut self, error: TransferError) {
        if matches!(error, TransferError::SequenceGap { .. }) {
            // No retransmission exists; discard the corrupt transfer.
            if let Some(aborted) = self.assembler.abort_active() {
                warn!(event = "receive_aborted", id = aborted, error = %error);
            }
        }
        self.emit(LinkEvent::TransferFailure(error));
    }

    fn emit_inbound(&mut self, inbound: InboundEvent) {
        let event = match inbound {
            InboundEvent::Started { id, name, size } => {
                info!(event = "receive_file_started", id, name = %name, size);
                LinkEvent::ReceiveFileStarted { id, name, size }
            }
            InboundEvent::Progress { id, received, size } => {
                LinkEvent::ReceiveFileProgress { id, received, size }
            }
            InboundEvent::Finished { id, name, size } => {
                info!(event = "receive_file_done", id, name = %name, size);
                LinkEvent::ReceiveFileDone { id, name, size }
            }
        };
        self.emit(event);
    }

    fn fail_negotiation(&mut self, error: LinkError) {
        self.deadline = None;
        self.sink = None;
        self.set_state(LinkState::Failed);
        self.emit(LinkEvent::Failure(error));
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.settings.negotiation_timeout);
    }

    fn set_state(&mut self, state: LinkState) {
        if state == self.state {
            return;
        }
        info!(event = "link_state_changed", from = %self.state, to = %state);
        self.state = state;
        self.emit(LinkEvent::StateChanged(state));
    }

    fn terminal(&mut self, state: LinkState) {
        self.stop_sampler();
        self.deadline = None;
        self.sink = None;
        self.set_state(state);
    }

    fn start_sampler(&mut self) {
        if self.sampler_stop.is_some() {
            return;
        }
        let stop = StopSignal::new();
        stats::spawn_sampler(
            self.wire.clone(),
            self.settings.stats_interval,
            self.events.clone(),
            stop.clone(),
        );
        self.sampler_stop = Some(stop);
    }

    fn stop_sampler(&mut self) {
        if let Some(stop) = self.sampler_stop.take() {
            stop.stop();
        }
    }

    fn send_signal(&self, message: SignalingMessage) -> Result<(), LinkError> {
        self.signals
            .send(message)
            .map_err(|_| LinkError::SignalingClosed)
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(event);
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::transport::testing::{MockChannel, MockTransport};
    use super::*;
    use crate::core::pipeline::frame::{encode_data_frame, ControlFrame};
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Rig {
        link: PeerLink<MockTransport>,
        transport_rx: UnboundedReceiver<TransportEvent<MockChannel>>,
        signals_rx: UnboundedReceiver<SignalingMessage>,
        events_rx: UnboundedReceiver<LinkEvent>,
    }

    fn rig() -> Rig {
        rig_with(LinkSettings::default())
    }

    fn rig_with(settings: LinkSettings) -> Rig {
        let (transport, transport_rx) = MockTransport::new();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let link = PeerLink::new(transport, signals_tx, events_tx, settings);
        Rig {
            link,
            transport_rx,
            signals_rx,
            events_rx,
        }
    }

    impl Rig {
        /// Feed every queued engine event into the link.
        async fn pump(&mut self) {
            while let Ok(event) = self.transport_rx.try_recv() {
                self.link.handle_transport_event(event).await;
            }
        }

        fn drain_signals(&mut self) -> Vec<SignalingMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.signals_rx.try_recv() {
                out.push(msg);
            }
            out
        }

        fn drain_events(&mut self) -> Vec<LinkEvent> {
            let mut out = Vec::new();
            while let Ok(ev) = self.events_rx.try_recv() {
                out.push(ev);
            }
            out
        }

        fn states(&mut self) -> Vec<LinkState> {
            self.drain_events()
                .into_iter()
                .filter_map(|ev| match ev {
                    LinkEvent::StateChanged(s) => Some(s),
                    _ => None,
                })
                .collect()
        }

        /// Drive the mock engine to connected and feed it through.
        async fn engine_connects(&mut self) {
            self.link
                .handle_transport_event(TransportEvent::StateChanged(TransportState::Connecting))
                .await;
            self.link
                .handle_transport_event(TransportEvent::StateChanged(TransportState::Connected))
                .await;
        }
    }

    #[tokio::test]
    async fn offerer_walks_idle_offering_connecting_connected() {
        let mut rig = rig();

        rig.link.join("room-42").unwrap();
        assert!(matches!(
            &rig.drain_signals()[..],
            [SignalingMessage::Join { room }] if room == "room-42"
        ));
        assert_eq!(rig.link.state(), LinkState::Idle);

        let peer = SessionId::new();
        rig.link
            .handle_signal(SignalingMessage::UserJoin { peer })
            .await;
        assert_eq!(rig.link.remote_session(), Some(peer));

        rig.link.connect().await.unwrap();
        assert_eq!(rig.link.state(), LinkState::Offering);
        assert!(rig.link.negotiation_deadline().is_some());
        assert!(matches!(
            &rig.drain_signals()[..],
            [SignalingMessage::Offer { .. }]
        ));
        assert_eq!(
            rig.link.transport.calls(),
            vec!["create_data_channel", "create_offer", "set_local_description"]
        );

        rig.engine_connects().await;
        assert_eq!(rig.link.state(), LinkState::Connected);
        assert!(rig.link.negotiation_deadline().is_none());

        let states = rig.states();
        let expected_tail = [
            LinkState::Offering,
            LinkState::Connecting,
            LinkState::Connected,
        ];
        assert!(
            states.ends_with(&expected_tail),
            "observed states: {states:?}"
        );
    }

    #[tokio::test]
    async fn answerer_walks_answering_then_connecting() {
        let mut rig = rig();

        rig.link
            .handle_signal(SignalingMessage::Offer {
                payload: serde_json::json!({"type": "offer", "sdp": "remote"}),
            })
            .await;
        assert_eq!(rig.link.state(), LinkState::Connecting);
        assert!(matches!(
            &rig.drain_signals()[..],
            [SignalingMessage::Answer { .. }]
        ));
        assert_eq!(
            rig.link.transport.calls(),
            vec![
                "set_remote_description",
                "create_answer",
                "set_local_description"
            ]
        );
        assert_eq!(
            rig.states(),
            vec![LinkState::Answering, LinkState::Connecting]
        );

        // Answer side gets its channel from the engine.
        let channel = rig.link.transport.channel.clone();
        rig.link
            .handle_transport_event(TransportEvent::ChannelOpen(channel))
            .await;
        assert!(rig.link.sink().is_some());

        rig.engine_connects().await;
        assert_eq!(rig.link.state(), LinkState::Connected);
    }

    #[tokio::test]
    async fn second_connect_mid_negotiation_is_rejected() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        let err = rig.link.connect().await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::DoubleConnect {
                state: LinkState::Offering
            }
        ));
        assert_eq!(rig.link.state(), LinkState::Offering);
    }

    #[tokio::test]
    async fn connect_when_connected_is_a_noop() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;
        let calls_before = rig.link.transport.calls().len();

        rig.link.connect().await.unwrap();
        assert_eq!(rig.link.state(), LinkState::Connected);
        assert_eq!(rig.link.transport.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn watermark_derives_from_remote_max_message_size() {
        let mut rig = rig();
        *rig.link.transport.state.remote_max_message_size.lock() = Some(8192);

        rig.link.connect().await.unwrap();
        rig.engine_connects().await;

        assert_eq!(rig.link.max_message_size(), Some(8192));
        assert_eq!(rig.link.watermark(), 8192 * 16);
        let sink = rig.link.sink().unwrap();
        assert_eq!(sink.watermark(), 8192 * 16);
        // The drain threshold was pushed into the channel.
        assert_eq!(
            rig.link
                .transport
                .channel
                .state
                .drain_threshold
                .load(std::sync::atomic::Ordering::SeqCst),
            8192 * 16
        );
    }

    #[tokio::test]
    async fn watermark_falls_back_to_default_when_unadvertised() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;
        assert_eq!(rig.link.max_message_size(), None);
        assert_eq!(rig.link.watermark(), config::DEFAULT_LOW_WATERMARK);
    }

    #[tokio::test]
    async fn malformed_candidate_is_logged_not_fatal() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.drain_events();

        rig.link
            .transport
            .state
            .fail_candidates
            .store(true, std::sync::atomic::Ordering::SeqCst);
        rig.link
            .handle_signal(SignalingMessage::Candidate {
                payload: serde_json::json!({"candidate": "garbage"}),
            })
            .await;

        assert_eq!(rig.link.state(), LinkState::Offering);
        assert!(rig.drain_events().is_empty());
    }

    #[tokio::test]
    async fn failed_remote_description_is_fatal_and_reported() {
        let mut rig = rig();
        rig.link
            .transport
            .state
            .fail_set_remote
            .store(true, std::sync::atomic::Ordering::SeqCst);

        rig.link
            .handle_signal(SignalingMessage::Offer {
                payload: serde_json::json!({"type": "offer", "sdp": "remote"}),
            })
            .await;

        assert_eq!(rig.link.state(), LinkState::Failed);
        let events = rig.drain_events();
        assert!(
            events
                .iter()
                .any(|e| matches!(e, LinkEvent::Failure(LinkError::Negotiation(_)))),
            "{events:?}"
        );
    }

    #[tokio::test]
    async fn failed_offer_creation_returns_the_error_to_the_caller() {
        let mut rig = rig();
        rig.link
            .transport
            .state
            .fail_create_offer
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = rig.link.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::Negotiation(_)));
        assert_eq!(rig.link.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn negotiation_timeout_fails_the_attempt() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.link.on_negotiation_timeout();

        assert_eq!(rig.link.state(), LinkState::Failed);
        let events = rig.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::Failure(LinkError::NegotiationTimeout(_)))));
        assert!(rig.link.negotiation_deadline().is_none());
    }

    #[tokio::test]
    async fn timeout_after_connected_changes_nothing() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;
        rig.drain_events();

        rig.link.on_negotiation_timeout();
        assert_eq!(rig.link.state(), LinkState::Connected);
        assert!(rig.drain_events().is_empty());
    }

    #[tokio::test]
    async fn relay_errors_surface_as_events() {
        let mut rig = rig();
        rig.link
            .handle_signal(SignalingMessage::Error {
                message: "relay full, 10 sessions already admitted".into(),
            })
            .await;
        let events = rig.drain_events();
        assert!(matches!(
            &events[..],
            [LinkEvent::RelayError(message)] if message.contains("10")
        ));
    }

    #[tokio::test]
    async fn inbound_frames_become_receive_events() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;
        rig.drain_events();

        let meta = ControlFrame::Meta {
            name: "notes.txt".into(),
            size: 6,
        }
        .to_wire()
        .unwrap();
        rig.link
            .handle_transport_event(TransportEvent::ChannelText(meta))
            .await;
        rig.link
            .handle_transport_event(TransportEvent::ChannelBinary(encode_data_frame(1, b"abc")))
            .await;
        rig.link
            .handle_transport_event(TransportEvent::ChannelBinary(encode_data_frame(2, b"def")))
            .await;
        rig.link
            .handle_transport_event(TransportEvent::ChannelText(
                ControlFrame::Done.to_wire().unwrap(),
            ))
            .await;

        let events = rig.drain_events();
        assert!(matches!(
            events[0],
            LinkEvent::ReceiveFileStarted { id: 1, ref name, size: 6 } if name == "notes.txt"
        ));
        assert!(matches!(
            events[1],
            LinkEvent::ReceiveFileProgress { received: 3, .. }
        ));
        assert!(matches!(
            events[3],
            LinkEvent::ReceiveFileDone { id: 1, ref name, size: 6 } if name == "notes.txt"
        ));

        // Received bytes were counted on the wire.
        let (_, rx_bytes) = rig.link.wire_counters().snapshot();
        assert!(rx_bytes > 6);

        let mut file = rig.link.take_file(1).unwrap();
        assert_eq!(&file.materialize().unwrap()[..], b"abcdef");
    }

    #[tokio::test]
    async fn sequence_gap_aborts_the_receive_and_surfaces() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;
        rig.drain_events();

        let meta = ControlFrame::Meta {
            name: "f".into(),
            size: 100,
        }
        .to_wire()
        .unwrap();
        rig.link
            .handle_transport_event(TransportEvent::ChannelText(meta))
            .await;
        rig.link
            .handle_transport_event(TransportEvent::ChannelBinary(encode_data_frame(1, b"x")))
            .await;
        rig.link
            .handle_transport_event(TransportEvent::ChannelBinary(encode_data_frame(5, b"y")))
            .await;

        let events = rig.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::TransferFailure(TransferError::SequenceGap { expected: 2, got: 5 })
        )));
        // Aborted: the receiver is gone, data frames are violations now.
        rig.link
            .handle_transport_event(TransportEvent::ChannelBinary(encode_data_frame(3, b"z")))
            .await;
        let events = rig.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::TransferFailure(TransferError::ReceiverState(_))
        )));
    }

    #[tokio::test]
    async fn buffer_low_fires_the_drain_signal() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;

        let sink = rig.link.sink().unwrap();
        let waiter = sink.drain().arm().unwrap();
        rig.link
            .handle_transport_event(TransportEvent::BufferLow)
            .await;
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stats_flow_after_connected() {
        let mut rig = rig_with(LinkSettings {
            stats_interval: Duration::from_secs(1),
            ..LinkSettings::default()
        });
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;
        rig.drain_events();
        // Let the sampler seed its baseline before traffic is counted.
        tokio::task::yield_now().await;

        rig.link.wire_counters().add_tx(2_000);
        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        let events = rig.drain_events();
        assert!(
            events.iter().any(|e| matches!(
                e,
                LinkEvent::Stats(BandwidthSample {
                    sent_per_sec: 2_000,
                    ..
                })
            )),
            "{events:?}"
        );
    }

    #[tokio::test]
    async fn close_reaches_the_engine_and_the_state() {
        let mut rig = rig();
        rig.link.connect().await.unwrap();
        rig.engine_connects().await;

        rig.link.close().await;
        assert_eq!(rig.link.state(), LinkState::Closed);
        assert!(rig.link.transport.calls().contains(&"close".to_string()));
        // Pending engine events are ignored gracefully afterwards.
        rig.pump().await;
    }
}
