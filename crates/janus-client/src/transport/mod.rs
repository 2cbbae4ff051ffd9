//! Signaling transports.
//!
//! Both transports share one contract: requests go out through
//! [`Transport::send`], and everything the gateway says comes back as
//! [`TransportEvent`]s on the channel handed out by the [`Connector`]. For the
//! socket transport that is every inbound frame. For the polling transport it
//! is both the POST responses and the long-poll results, so the session sees
//! a single ordered stream regardless of how the bytes travelled.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::SessionConfig;
use crate::error::JanusResult;
use crate::protocol::{Request, SessionId};

pub mod polling;
pub mod websocket;

pub use polling::{HttpBackend, PollingTransport, ReqwestBackend};
pub use websocket::WebSocketTransport;

/// Close code sent when the gateway reports the session timed out.
pub const GATEWAY_TIMEOUT_CLOSE_CODE: u16 = 3504;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    LongPoll,
}

impl TransportKind {
    /// Socket transport for `ws://`/`wss://` URIs, polling for everything else.
    pub fn for_server(server: &str) -> TransportKind {
        if server.starts_with("ws") {
            TransportKind::WebSocket
        } else {
            TransportKind::LongPoll
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::LongPoll => f.write_str("long-poll"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn gateway_timeout() -> Self {
        Self {
            code: GATEWAY_TIMEOUT_CLOSE_CODE,
            reason: "Gateway timeout".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// One gateway message, or an array of them from a batched poll.
    Message(Value),
    /// The peer closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// The transport gave up; no further events follow.
    Failed(String),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn send(&self, request: &Request) -> JanusResult<()>;

    /// Starts the receive loop for `session_id`. Only the polling transport
    /// needs this; the socket transport receives from the moment it opens.
    fn start_receiving(&self, session_id: SessionId);

    async fn close(&self, reason: Option<CloseReason>);
}

/// Opens a transport to one server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        server: &str,
        config: &SessionConfig,
    ) -> JanusResult<(Arc<dyn Transport>, TransportEvents)>;
}

/// Picks the socket or polling transport from the server URI.
#[derive(Debug, Default, Clone)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        server: &str,
        config: &SessionConfig,
    ) -> JanusResult<(Arc<dyn Transport>, TransportEvents)> {
        match TransportKind::for_server(server) {
            TransportKind::WebSocket => {
                let (transport, events) = WebSocketTransport::connect(server).await?;
                Ok((Arc::new(transport), events))
            }
            TransportKind::LongPoll => {
                let backend = Arc::new(ReqwestBackend::new(config)?);
                let (transport, events) = PollingTransport::new(server, config, backend);
                Ok((Arc::new(transport), events))
            }
        }
    }
}
