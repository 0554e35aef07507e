//! WebSocket signaling client.
//!
//! Reader and writer run as separate tasks bridged to the caller with
//! unbounded mpsc channels. The writer also sends a `ping` envelope every
//! [`SIGNALING_PING_INTERVAL`].

use super::SignalMessage;
use crate::core::config::{SIGNALING_CONNECT_TIMEOUT, SIGNALING_PING_INTERVAL};
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Handle to a live signaling connection.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<SignalMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// `url` with our peer id appended as the `peerId` query parameter.
pub fn endpoint(url: &str, peer: Uuid) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}peerId={peer}")
}

impl SignalingClient {
    /// Connect to `url` and start the reader and writer tasks. Incoming
    /// envelopes arrive on the returned receiver; it closes when the socket
    /// does.
    pub async fn connect(
        url: &str,
        peer: Uuid,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>)> {
        let target = endpoint(url, peer);
        let (stream, _) = tokio::time::timeout(SIGNALING_CONNECT_TIMEOUT, connect_async(target.as_str()))
            .await
            .context("signaling connect timed out")?
            .with_context(|| format!("connecting to {url}"))?;
        info!(event = "signaling_connected", url = %url, "Signaling connected");

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            let mut ping = tokio::time::interval(SIGNALING_PING_INTERVAL);
            ping.tick().await;
            loop {
                let msg = tokio::select! {
                    next = out_rx.recv() => match next {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = ping.tick() => SignalMessage::Ping,
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(event = "signal_encode_failed", kind = msg.kind(), error = %e, "Envelope not sent");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    warn!(event = "signaling_write_failed", error = %e, "Signaling socket closed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(event = "signaling_read_failed", error = %e, "Signaling socket error");
                        break;
                    }
                };
                match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(msg) => {
                        debug!(event = "signal_received", kind = msg.kind(), "Signal received");
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(event = "signal_decode_failed", error = %e, "Malformed signaling envelope dropped"),
                }
            }
            info!(event = "signaling_closed", "Signaling connection closed");
        });

        Ok((
            Self {
                outbound: out_tx,
                reader,
                writer,
            },
            in_rx,
        ))
    }

    /// Sender feeding the writer task.
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalMessage> {
        self.outbound.clone()
    }

    pub fn send(&self, msg: SignalMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .map_err(|_| anyhow::anyhow!("signaling connection closed"))
    }

    pub fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}
