//! WebSocket relay server.
//!
//! Accepts sessions, registers them, and pumps each connection between its
//! socket and the shared [`RoomRegistry`]. The registry mutex is the only
//! synchronization point; it is never held across an await.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::utils::stop::StopSignal;

use super::registry::RoomRegistry;
use super::{SessionId, SignalingMessage};

/// The rendezvous relay: one TCP listener, one shared registry.
pub struct RelayServer {
    listener: TcpListener,
    registry: Arc<Mutex<RoomRegistry>>,
}

impl RelayServer {
    pub async fn bind(listen: &str, cap: usize) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("binding relay listener on {listen}"))?;
        Ok(Self {
            listener,
            registry: Arc::new(Mutex::new(RoomRegistry::new(cap))),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("relay listener address")
    }

    /// Accept sessions until the stop signal fires.
    pub async fn run(self, stop: StopSignal) -> Result<()> {
        info!(event = "relay_listening", addr = %self.local_addr()?);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let registry = self.registry.clone();
                            tokio::spawn(async move {
                                handle_session(stream, peer_addr, registry).await;
                            });
                        }
                        Err(e) => warn!(event = "accept_failed", error = %e),
                    }
                }
                _ = stop.wait() => {
                    info!(event = "relay_stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Serve one connection: session lifecycle, outbound pump, inbound dispatch.
async fn handle_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<Mutex<RoomRegistry>>,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(event = "handshake_failed", %peer_addr, error = %e);
            return;
        }
    };

    let session = SessionId::new();
    debug!(event = "session_accepted", %session, %peer_addr);

    let (mut sink, mut source) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    registry.lock().connect(session, outbound_tx);

    loop {
        tokio::select! {
            queued = outbound_rx.recv() => {
                // The registry never drops its sender while the session is
                // registered, so a closed channel means we are shutting down.
                let Some(message) = queued else { break };
                let text = match message.to_wire() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = "encode_failed", %session, error = %e);
                        continue;
                    }
                };
                if sink.send(Message::text(text)).await.is_err() {
                    break;
                }
            }
            incoming = source.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        dispatch(&registry, session, text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong/binary: nothing to route
                    Some(Err(e)) => {
                        debug!(event = "session_read_failed", %session, error = %e);
                        break;
                    }
                }
            }
        }
    }

    registry.lock().disconnect(session);
    debug!(event = "session_closed", %session);
}

/// Route one parsed client message into the registry.
fn dispatch(registry: &Mutex<RoomRegistry>, session: SessionId, text: &str) {
    match SignalingMessage::from_wire(text) {
        Ok(SignalingMessage::Join { room }) => {
            // The registry already answered the client on rejection.
            let _ = registry.lock().join(session, &room);
        }
        Ok(
            message @ (SignalingMessage::Offer { .. }
            | SignalingMessage::Answer { .. }
            | SignalingMessage::Candidate { .. }),
        ) => {
            registry.lock().forward(session, message);
        }
        Ok(other) => {
            warn!(event = "unexpected_client_message", %session, ?other);
        }
        Err(e) => {
            warn!(event = "unparseable_message", %session, error = %e);
        }
    }
}
