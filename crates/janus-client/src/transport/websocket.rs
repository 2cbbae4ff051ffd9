use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use super::{CloseReason, Transport, TransportEvent, TransportEvents, TransportKind};
use crate::error::{JanusError, JanusResult};
use crate::protocol::{Request, SessionId};

pub const JANUS_SUBPROTOCOL: &str = "janus-protocol";

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

enum Outbound {
    Text(String),
    Close(Option<CloseReason>),
}

/// Persistent socket to the gateway's WebSocket endpoint.
pub struct WebSocketTransport {
    server: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    pub async fn connect(server: &str) -> JanusResult<(Self, TransportEvents)> {
        let mut request = server.into_client_request()?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(JANUS_SUBPROTOCOL),
        );
        let (stream, _) = connect_async(request).await?;
        debug!(target: "janus::ws", server, "websocket connected");

        let (mut sink, mut source) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let writer_server = server.to_string();
        let writer = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Text(text) => {
                        trace!(target: "janus::ws", len = text.len(), "sending frame");
                        if let Err(err) = sink.send(Message::Text(text)).await {
                            warn!(
                                target: "janus::ws",
                                server = %writer_server,
                                error = %err,
                                "websocket send failed"
                            );
                            break;
                        }
                    }
                    Outbound::Close(reason) => {
                        let frame = reason.map(|reason| CloseFrame {
                            code: CloseCode::from(reason.code),
                            reason: reason.reason.into(),
                        });
                        if let Err(err) = sink.send(Message::Close(frame)).await {
                            debug!(target: "janus::ws", error = %err, "close frame not sent");
                        }
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<Value>(&text) {
                        Ok(value) => {
                            if events_tx.send(TransportEvent::Message(value)).is_err() {
                                return;
                            }
                        }
                        Err(err) => {
                            warn!(target: "janus::ws", error = %err, "dropping malformed frame");
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        let _ = events_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        let _ = events_tx.send(TransportEvent::Failed(err.to_string()));
                        return;
                    }
                }
            }
            let _ = events_tx.send(TransportEvent::Closed {
                code: None,
                reason: "connection closed".into(),
            });
        });

        Ok((
            Self {
                server: server.to_string(),
                outbound: outbound_tx,
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            },
            events_rx,
        ))
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&self, request: &Request) -> JanusResult<()> {
        let text = serde_json::to_string(request)?;
        self.outbound
            .send(Outbound::Text(text))
            .map_err(|_| JanusError::Transport(format!("websocket to {} is closed", self.server)))
    }

    fn start_receiving(&self, _session_id: SessionId) {}

    async fn close(&self, reason: Option<CloseReason>) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let _ = self.outbound.send(Outbound::Close(reason));
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                debug!(target: "janus::ws", server = %self.server, "close did not flush in time");
            }
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.lock().take() {
            writer.abort();
        }
    }
}
