//! `webrtc`-crate binding of the transport capability traits.
//!
//! Installs the engine's callbacks once and forwards everything they report
//! into the typed transport-event channel the peer link consumes. The link
//! never sees a `webrtc` type.

use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::core::config::IceSettings;

use super::transport::{DataChannel, Transport, TransportError, TransportEvent, TransportState};

// ── Channel ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct WebRtcChannel {
    dc: Arc<RTCDataChannel>,
}

impl DataChannel for WebRtcChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.dc
            .send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_binary(&self, frame: Bytes) -> Result<(), TransportError> {
        self.dc
            .send(&frame)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    async fn set_drain_threshold(&self, bytes: usize) {
        self.dc.set_buffered_amount_low_threshold(bytes).await;
    }
}

// ── Transport ────────────────────────────────────────────────────────────────

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<TransportEvent<WebRtcChannel>>,
}

impl WebRtcTransport {
    /// Build a peer connection against the configured ICE server and install
    /// the engine callbacks.
    pub async fn new(
        ice: &IceSettings,
    ) -> Result<
        (
            Self,
            mpsc::UnboundedReceiver<TransportEvent<WebRtcChannel>>,
        ),
        TransportError,
    > {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec![ice.url.clone()],
                username: ice.username.clone(),
                credential: ice.credential.clone(),
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| TransportError::Negotiation(e.to_string()))?,
        );

        let (events, events_rx) = mpsc::unbounded_channel();

        {
            let tx = events.clone();
            pc.on_peer_connection_state_change(Box::new(move |state| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(TransportEvent::StateChanged(map_state(state)));
                })
            }));
        }

        // Trickle ICE: every locally gathered candidate goes to the relay.
        {
            let tx = events.clone();
            pc.on_ice_candidate(Box::new(move |candidate| {
                let tx = tx.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            warn!(event = "candidate_encode_failed", error = %e);
                            return;
                        }
                    };
                    match serde_json::to_value(init) {
                        Ok(value) => {
                            let _ = tx.send(TransportEvent::LocalCandidate(value));
                        }
                        Err(e) => warn!(event = "candidate_encode_failed", error = %e),
                    }
                })
            }));
        }

        // Answer side: the offerer's channel is announced by the engine.
        {
            let tx = events.clone();
            pc.on_data_channel(Box::new(move |dc| {
                let tx = tx.clone();
                Box::pin(async move {
                    wire_channel(dc, tx).await;
                })
            }));
        }

        Ok((Self { pc, events }, events_rx))
    }
}

impl Transport for WebRtcTransport {
    type Channel = WebRtcChannel;

    async fn create_data_channel(&self, label: &str) -> Result<WebRtcChannel, TransportError> {
        // Ordered and fully reliable (the SCTP default, no partial reliability).
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(|e| TransportError::ChannelCreate(e.to_string()))?;
        wire_channel(dc.clone(), self.events.clone()).await;
        Ok(WebRtcChannel { dc })
    }

    async fn create_offer(&self) -> Result<Value, TransportError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        serde_json::to_value(offer).map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn create_answer(&self) -> Result<Value, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        serde_json::to_value(answer).map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn set_local_description(&self, description: Value) -> Result<(), TransportError> {
        let desc: RTCSessionDescription = serde_json::from_value(description)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn set_remote_description(&self, description: Value) -> Result<(), TransportError> {
        let desc: RTCSessionDescription = serde_json::from_value(description)
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| TransportError::Candidate(e.to_string()))?;
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    fn connection_state(&self) -> TransportState {
        map_state(self.pc.connection_state())
    }

    /// `a=max-message-size` from the committed remote description, if the
    /// peer advertised one.
    async fn remote_max_message_size(&self) -> Option<usize> {
        let desc = self.pc.remote_description().await?;
        parse_max_message_size(&desc.sdp)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(event = "peer_connection_close_failed", error = %e);
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Install the per-channel callbacks and forward into the event channel.
async fn wire_channel(
    dc: Arc<RTCDataChannel>,
    tx: mpsc::UnboundedSender<TransportEvent<WebRtcChannel>>,
) {
    debug!(event = "channel_wired", label = dc.label());

    {
        let tx = tx.clone();
        let dc_open = dc.clone();
        dc.on_open(Box::new(move || {
            let tx = tx.clone();
            let dc = dc_open.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ChannelOpen(WebRtcChannel { dc }));
            })
        }));
    }

    {
        let tx = tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => {
                            let _ = tx.send(TransportEvent::ChannelText(text));
                        }
                        Err(e) => warn!(event = "non_utf8_text_frame", error = %e),
                    }
                } else {
                    let _ = tx.send(TransportEvent::ChannelBinary(msg.data));
                }
            })
        }));
    }

    {
        let tx = tx.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::BufferLow);
            })
        }))
        .await;
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

/// Find `a=max-message-size:<n>` in an SDP body.
fn parse_max_message_size(sdp: &str) -> Option<usize> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix("a=max-message-size:"))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_message_size_is_parsed_from_sdp() {
        let sdp = "v=0\r\n\
                   m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
                   a=sctp-port:5000\r\n\
                   a=max-message-size:262144\r\n";
        assert_eq!(parse_max_message_size(sdp), Some(262144));
    }

    #[test]
    fn missing_or_garbled_attribute_yields_none() {
        assert_eq!(parse_max_message_size("v=0\r\na=sctp-port:5000\r\n"), None);
        assert_eq!(parse_max_message_size("a=max-message-size:banana\r\n"), None);
    }

    #[test]
    fn engine_states_map_onto_transport_states() {
        assert_eq!(
            map_state(RTCPeerConnectionState::Connecting),
            TransportState::Connecting
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Connected),
            TransportState::Connected
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Failed),
            TransportState::Failed
        );
        assert_eq!(
            map_state(RTCPeerConnectionState::Unspecified),
            TransportState::New
        );
    }
}
