//! Client end of the relay connection.
//!
//! Owns the WebSocket and pumps it both ways: an unbounded outbound queue the
//! peer link writes into, and an inbound channel of parsed messages the
//! worker loop consumes. Either pump ending closes the inbound channel, which
//! is how the worker learns the relay is gone.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use super::SignalingMessage;

pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalingMessage>,
}

impl SignalingClient {
    /// Connect to the relay at `url` (e.g. `ws://host:3000`).
    ///
    /// Returns the client plus the stream of inbound relay messages.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>)> {
        let (ws, _response) = connect_async(url)
            .await
            .with_context(|| format!("connecting to relay at {url}"))?;
        debug!(event = "relay_connected", url);

        let (mut sink, mut source) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_wire() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(event = "encode_failed", error = %e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::text(text)).await {
                    warn!(event = "relay_send_failed", error = %e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(Message::Text(text)) => match SignalingMessage::from_wire(text.as_str()) {
                        Ok(message) => {
                            if inbound_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(event = "unparseable_relay_message", error = %e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(event = "relay_read_failed", error = %e);
                        break;
                    }
                }
            }
            debug!(event = "relay_stream_ended");
        });

        Ok((Self { outbound }, inbound))
    }

    /// Handle the peer link uses to push messages toward the relay.
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalingMessage> {
        self.outbound.clone()
    }
}
