//! Peer worker: drives one link end-to-end.
//!
//! Owns the select loop that funnels relay messages and transport events into
//! the [`PeerLink`], reacts to link events (spawning the file send, saving
//! received files), and enforces the negotiation deadline. All link and
//! receiver state is mutated from this one task.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::core::config::Settings;
use crate::core::connection::transport::{Transport, TransportEvent};
use crate::core::connection::webrtc::WebRtcTransport;
use crate::core::connection::{LinkEvent, LinkSettings, LinkState, PeerLink};
use crate::core::pipeline::sender::SendReport;
use crate::core::pipeline::TransferError;
use crate::core::signaling::client::SignalingClient;
use crate::core::signaling::SignalingMessage;
use crate::utils::stop::StopSignal;

/// What this peer is here to do.
#[derive(Debug, Clone)]
pub enum Role {
    Send { file: PathBuf },
    Recv { output: PathBuf },
}

/// Connect to the relay, join the room, and run the link until it ends.
pub async fn run(settings: Settings, room: String, role: Role, stop: StopSignal) -> Result<()> {
    let (client, signals) = SignalingClient::connect(&settings.relay_url).await?;
    let (transport, transport_events) = WebRtcTransport::new(&settings.ice)
        .await
        .context("building the WebRTC transport")?;
    let (event_tx, events) = mpsc::unbounded_channel();

    let link = PeerLink::new(
        transport,
        client.sender(),
        event_tx,
        LinkSettings::from(&settings),
    );
    link.join(&room)?;
    info!(event = "room_join_requested", room = %room);

    drive(link, signals, transport_events, events, role, stop).await
}

enum Flow {
    Continue,
    Finished,
}

async fn drive<T: Transport>(
    mut link: PeerLink<T>,
    mut signals: mpsc::UnboundedReceiver<SignalingMessage>,
    mut transport_events: mpsc::UnboundedReceiver<TransportEvent<T::Channel>>,
    mut events: mpsc::UnboundedReceiver<LinkEvent>,
    role: Role,
    stop: StopSignal,
) -> Result<()> {
    let initiator = matches!(role, Role::Send { .. });
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Result<SendReport, TransferError>>();
    let mut sending = false;
    let mut files_saved = 0usize;

    loop {
        let deadline = link.negotiation_deadline();
        tokio::select! {
            message = signals.recv() => {
                let Some(message) = message else {
                    bail!("relay connection closed");
                };
                // The sending side initiates once the relay pairs the room.
                let pair_up = initiator
                    && link.state() == LinkState::Idle
                    && matches!(message, SignalingMessage::UserJoin { .. });
                link.handle_signal(message).await;
                if pair_up {
                    link.connect().await.context("starting negotiation")?;
                }
            }
            Some(event) = transport_events.recv() => {
                link.handle_transport_event(event).await;
            }
            Some(event) = events.recv() => {
                match handle_event(event, &mut link, &role, &stop, &done_tx, &mut sending, &mut files_saved).await? {
                    Flow::Continue => {}
                    Flow::Finished => break,
                }
            }
            Some(outcome) = done_rx.recv() => {
                let report = outcome.context("file send failed")?;
                info!(
                    event = "send_complete",
                    name = %report.name,
                    bytes = report.size,
                    frames = report.frames,
                );
                // Let the channel hand buffered frames to the network before
                // tearing the connection down.
                if let Some(sink) = link.sink() {
                    sink.settle(&stop).await;
                }
                link.close().await;
                break;
            }
            _ = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600))
            ), if deadline.is_some() => {
                link.on_negotiation_timeout();
            }
            _ = stop.wait() => {
                info!(event = "stop_requested");
                link.close().await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_event<T: Transport>(
    event: LinkEvent,
    link: &mut PeerLink<T>,
    role: &Role,
    stop: &StopSignal,
    done_tx: &mpsc::UnboundedSender<Result<SendReport, TransferError>>,
    sending: &mut bool,
    files_saved: &mut usize,
) -> Result<Flow> {
    match event {
        LinkEvent::StateChanged(LinkState::Connected) => {
            if let Role::Send { file } = role {
                if !*sending {
                    *sending = true;
                    let sink = link.sink().context("connected without a data channel")?;
                    let path = file.clone();
                    let stop = stop.clone();
                    let done = done_tx.clone();
                    tokio::spawn(async move {
                        let _ = done.send(sink.send_file(&path, &stop).await);
                    });
                }
            }
            Ok(Flow::Continue)
        }
        LinkEvent::StateChanged(LinkState::Failed) => bail!("link failed"),
        LinkEvent::StateChanged(state @ (LinkState::Disconnected | LinkState::Closed)) => {
            if *files_saved > 0 {
                Ok(Flow::Finished)
            } else {
                bail!("link ended in state {state}")
            }
        }
        LinkEvent::StateChanged(_) => Ok(Flow::Continue),
        LinkEvent::PeerJoined(peer) => {
            info!(event = "peer_available", %peer);
            Ok(Flow::Continue)
        }
        LinkEvent::PeerLeft(peer) => {
            info!(event = "peer_gone", %peer);
            if matches!(role, Role::Recv { .. }) && *files_saved > 0 {
                link.close().await;
                return Ok(Flow::Finished);
            }
            Ok(Flow::Continue)
        }
        LinkEvent::RelayError(message) => bail!("relay rejected us: {message}"),
        LinkEvent::Stats(sample) => {
            info!(
                event = "bandwidth",
                up_bps = sample.sent_per_sec,
                down_bps = sample.recv_per_sec,
            );
            Ok(Flow::Continue)
        }
        LinkEvent::ReceiveFileStarted { name, size, .. } => {
            info!(event = "receiving", name = %name, size);
            Ok(Flow::Continue)
        }
        LinkEvent::ReceiveFileProgress { id, received, size } => {
            debug!(event = "receive_progress", id, received, size);
            Ok(Flow::Continue)
        }
        LinkEvent::ReceiveFileDone { id, name, .. } => {
            if let Role::Recv { output } = role {
                let mut file = link.take_file(id).context("completed receiver vanished")?;
                let blob = file
                    .materialize()
                    .with_context(|| format!("materializing {name}"))?;
                let path = output.join(sanitize_file_name(&name));
                tokio::fs::write(&path, &blob)
                    .await
                    .with_context(|| format!("saving {}", path.display()))?;
                *files_saved += 1;
                info!(event = "file_saved", path = %path.display(), bytes = blob.len());
            }
            Ok(Flow::Continue)
        }
        LinkEvent::Failure(error) => Err(anyhow::Error::new(error).context("link failure")),
        LinkEvent::TransferFailure(error) => {
            // Reportable but not fatal to the link; the sender may retry
            // with a fresh transfer.
            error!(event = "transfer_error", %error);
            Ok(Flow::Continue)
        }
    }
}

/// Reduce a declared file name to a safe base name for saving.
fn sanitize_file_name(name: &str) -> String {
    let candidate = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let trimmed = candidate.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}
