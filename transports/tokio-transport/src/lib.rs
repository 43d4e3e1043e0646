//! Tokio WebSocket transport for the signaling relay.
//!
//! Each signaling envelope travels as one text frame. Binary frames are
//! accepted on the read side and passed through unchanged.

use async_trait::async_trait;
use callcore::{Transport, TransportEvent, TransportFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct TokioWebSocketTransport {
    ws_sink: Mutex<Option<WsSink>>,
}

impl TokioWebSocketTransport {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Mutex::new(Some(sink)),
        }
    }
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let text = std::str::from_utf8(data)
            .map_err(|e| anyhow::anyhow!("Refusing to send non-UTF-8 frame: {}", e))?;

        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        trace!(target: "Relay/Send", "--> {} bytes", data.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut sink) = self.ws_sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!(target: "Relay", "Error closing websocket: {e}");
            }
        }
    }
}

/// Dials the relay at `url` every time a transport is requested.
pub struct TokioWebSocketTransportFactory {
    url: String,
}

impl TokioWebSocketTransportFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        info!(target: "Relay", "Dialing {}", self.url);
        let (client, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let transport = Arc::new(TokioWebSocketTransport::new(sink));

        // Connected must be queued before the pump can report anything.
        let _ = event_tx.send(TransportEvent::Connected).await;
        tokio::spawn(read_pump(stream, event_tx));

        Ok((transport, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(msg)) => {
                if msg.is_text() || msg.is_binary() {
                    let data = msg.into_data();
                    trace!(target: "Relay", "<-- {} bytes", data.len());
                    if event_tx
                        .send(TransportEvent::DataReceived(data))
                        .await
                        .is_err()
                    {
                        warn!(target: "Relay", "Event receiver dropped, closing read pump");
                        break;
                    }
                } else if msg.is_close() {
                    trace!(target: "Relay", "Received close frame");
                    break;
                }
            }
            Some(Err(e)) => {
                error!(target: "Relay", "Error reading from websocket: {e}");
                break;
            }
            None => {
                trace!(target: "Relay", "Websocket stream ended");
                break;
            }
        }
    }

    let _ = event_tx.send(TransportEvent::Disconnected).await;
}
