//! WebSocket transport with JSON frames and automatic reconnect

use super::{Transport, TransportEvent};
use crate::error::{ChatError, Result};
use crate::events::ChatEvent;
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Realtime channel over a WebSocket endpoint.
///
/// Frames are `{"event": ..., "data": ...}` JSON text messages. When the link
/// drops the transport reports `Disconnected`, waits with exponential backoff
/// and reports `Connected` again once a new socket is up.
pub struct WsTransport {
    url: String,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ChatEvent>>>>,
    shutdown: CancellationToken,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            outbound: Arc::new(Mutex::new(None)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop reconnecting and close the socket
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl Transport for WsTransport {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn connect(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded();
        let url = self.url.clone();
        let outbound = self.outbound.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            while !shutdown.is_cancelled() {
                match tokio_tungstenite::connect_async(url.as_str()).await {
                    Ok((socket, _response)) => {
                        backoff = INITIAL_BACKOFF;
                        let (out_tx, out_rx) = mpsc::unbounded();
                        *outbound.lock() = Some(out_tx);
                        info!(%url, "WebSocket connected");
                        if events_tx.unbounded_send(TransportEvent::Connected).is_err() {
                            break;
                        }

                        let reason = run_socket(socket, out_rx, &events_tx, &shutdown).await;
                        *outbound.lock() = None;
                        if events_tx
                            .unbounded_send(TransportEvent::Disconnected { reason })
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(%url, "WebSocket connect failed: {}", e);
                    }
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            debug!(%url, "WebSocket transport stopped");
        });

        Ok(events_rx)
    }

    async fn send(&self, event: ChatEvent) -> Result<()> {
        let outbound = self.outbound.lock();
        let tx = outbound.as_ref().ok_or(ChatError::TransportClosed)?;
        tx.unbounded_send(event)
            .map_err(|_| ChatError::TransportClosed)
    }

    fn is_connected(&self) -> bool {
        self.outbound
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

/// Pump one socket until it closes; returns the disconnect reason
async fn run_socket<S>(
    socket: tokio_tungstenite::WebSocketStream<S>,
    mut out_rx: mpsc::UnboundedReceiver<ChatEvent>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &CancellationToken,
) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = sink.send(Frame::Close(None)).await;
                return "shutdown".to_string();
            }
            outgoing = out_rx.next() => {
                let Some(event) = outgoing else {
                    return "outbound channel closed".to_string();
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode {}: {}", event.name().as_str(), e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Frame::text(text)).await {
                    return format!("send failed: {e}");
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Frame::Text(text))) => {
                        match serde_json::from_str::<ChatEvent>(text.as_str()) {
                            Ok(event) => {
                                if events_tx.unbounded_send(TransportEvent::Event(event)).is_err() {
                                    return "receiver dropped".to_string();
                                }
                            }
                            Err(e) => debug!("Ignoring unrecognised frame: {}", e),
                        }
                    }
                    Some(Ok(Frame::Close(frame))) => {
                        return frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("read failed: {e}"),
                    None => return "stream ended".to_string(),
                }
            }
        }
    }
}
