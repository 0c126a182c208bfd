//! C3: the message-channel client.
//!
//! Open-once, duplex, text-framed JSON over a websocket. Unlike the
//! teacher's `websocket.rs`, this client does **not** reconnect itself —
//! reconnect policy belongs to the controller state machine one layer up,
//! which needs to interleave it with handshake state. This client only
//! opens once, forwards frames, and reports closure.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::Error;

/// Events surfaced by the channel. Mirrors the OPEN/CLOSE/MESSAGE/ERROR
/// vocabulary from the interface description.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(String),
    Error(String),
    Close,
}

/// A single connection attempt of the message channel. `send` no-ops if
/// the channel is not open (already closed or never opened).
pub struct MessageChannel {
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl MessageChannel {
    /// Open a websocket connection to `url` and begin forwarding frames.
    /// Returns immediately; `OPEN` or `ERROR` arrives on the event stream.
    pub fn connect(url: url::Url) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(256);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

        let events_tx_task = events_tx.clone();
        tokio::spawn(async move {
            let connected = tokio_tungstenite::connect_async(url.as_str()).await;
            let stream = match connected {
                Ok((stream, _response)) => stream,
                Err(err) => {
                    let typed = Error::WebSocketConnect(err);
                    warn!(error = %typed, "message channel failed to open");
                    let _ = events_tx_task.send(ChannelEvent::Error(typed.to_string()));
                    let _ = events_tx_task.send(ChannelEvent::Close);
                    return;
                }
            };

            let (mut write, mut read) = stream.split();
            let _ = events_tx_task.send(ChannelEvent::Open);
            debug!("message channel open");

            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(message) => {
                                if let Err(err) = write.send(message).await {
                                    warn!(error = %err, "message channel send failed");
                                    let _ = events_tx_task.send(ChannelEvent::Error(err.to_string()));
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                let _ = events_tx_task.send(ChannelEvent::Message(text.to_string()));
                            }
                            Some(Ok(WsMessage::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(error = %err, "message channel read failed");
                                let _ = events_tx_task.send(ChannelEvent::Error(err.to_string()));
                                break;
                            }
                        }
                    }
                }
            }
            let _ = events_tx_task.send(ChannelEvent::Close);
            debug!("message channel closed");
        });

        Self {
            outbound: Some(outbound_tx),
            events: events_tx,
        }
    }

    /// Subscribe to channel events. Multiple subscribers are supported.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Send a text frame. No-ops (returns `Ok`) if the channel has already
    /// closed, matching "send no-ops if not open".
    pub fn send(&self, text: impl Into<String>) -> Result<(), Error> {
        match &self.outbound {
            Some(tx) => {
                let _ = tx.send(WsMessage::text(text.into()));
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Close the channel from this end.
    pub fn close(&mut self) {
        self.outbound = None;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn send_after_close_is_a_no_op() {
        let (tx, _rx) = broadcast::channel(4);
        let mut channel = MessageChannel {
            outbound: None,
            events: tx,
        };
        assert!(channel.send("hello").is_ok());
        channel.close();
        assert!(channel.send("still fine").is_ok());
    }
}
