//! Wire messages exchanged with the gateway.
//!
//! Outbound traffic is a single [`Request`] shape whose optional fields are
//! omitted when unset. Inbound traffic is parsed into [`ServerMessage`], a
//! closed set of the message kinds the gateway pushes, with
//! [`ServerMessage::Unknown`] keeping anything else around for logging.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub type SessionId = u64;
pub type HandleId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Create,
    Claim,
    Attach,
    Message,
    Trickle,
    Detach,
    Hangup,
    Destroy,
    Keepalive,
}

impl RequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Create => "create",
            RequestKind::Claim => "claim",
            RequestKind::Attach => "attach",
            RequestKind::Message => "message",
            RequestKind::Trickle => "trickle",
            RequestKind::Detach => "detach",
            RequestKind::Hangup => "hangup",
            RequestKind::Destroy => "destroy",
            RequestKind::Keepalive => "keepalive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Offer/answer envelope carried next to plugin messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trickle: Option<bool>,
}

impl Jsep {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
            trickle: None,
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
            trickle: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// A trickled ICE candidate, or the `{"completed": true}` end-of-candidates sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrickleCandidate {
    Completed { completed: bool },
    Candidate(CandidateInit),
}

impl TrickleCandidate {
    pub fn completed() -> Self {
        TrickleCandidate::Completed { completed: true }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        matches!(self, TrickleCandidate::Completed { completed: true })
    }

    /// Candidate to hand to the peer connection; `None` signals end-of-candidates.
    pub fn as_init(&self) -> Option<CandidateInit> {
        match self {
            TrickleCandidate::Candidate(init) => Some(init.clone()),
            TrickleCandidate::Completed { .. } => None,
        }
    }
}

impl From<CandidateInit> for TrickleCandidate {
    fn from(value: CandidateInit) -> Self {
        TrickleCandidate::Candidate(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub janus: RequestKind,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle_id: Option<HandleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opaque_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsep: Option<Jsep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<TrickleCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apisecret: Option<String>,
}

impl Request {
    pub fn new(janus: RequestKind, transaction: impl Into<String>) -> Self {
        Self {
            janus,
            transaction: transaction.into(),
            session_id: None,
            handle_id: None,
            plugin: None,
            opaque_id: None,
            body: None,
            jsep: None,
            candidate: None,
            token: None,
            apisecret: None,
        }
    }

    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn handle(mut self, handle_id: HandleId) -> Self {
        self.handle_id = Some(handle_id);
        self
    }

    pub fn credentials(mut self, token: Option<&str>, apisecret: Option<&str>) -> Self {
        self.token = token.map(str::to_owned);
        self.apisecret = apisecret.map(str::to_owned);
        self
    }

    pub fn plugin(mut self, plugin: impl Into<String>, opaque_id: Option<String>) -> Self {
        self.plugin = Some(plugin.into());
        self.opaque_id = opaque_id;
        self
    }

    pub fn body(mut self, body: Value, jsep: Option<Jsep>) -> Self {
        self.body = Some(body);
        self.jsep = jsep;
        self
    }

    pub fn candidate(mut self, candidate: TrickleCandidate) -> Self {
        self.candidate = Some(candidate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginData {
    pub plugin: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SuccessData {
    #[serde(default)]
    pub id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "janus", rename_all = "lowercase")]
pub enum ServerMessage {
    Ack {
        transaction: Option<String>,
        session_id: Option<SessionId>,
    },
    Success {
        transaction: Option<String>,
        session_id: Option<SessionId>,
        sender: Option<HandleId>,
        data: Option<SuccessData>,
        plugindata: Option<PluginData>,
    },
    Error {
        transaction: Option<String>,
        session_id: Option<SessionId>,
        error: ErrorBody,
    },
    Event {
        transaction: Option<String>,
        sender: Option<HandleId>,
        plugindata: Option<PluginData>,
        jsep: Option<Jsep>,
    },
    Trickle {
        sender: Option<HandleId>,
        candidate: Option<TrickleCandidate>,
    },
    WebrtcUp {
        sender: Option<HandleId>,
    },
    Hangup {
        sender: Option<HandleId>,
        reason: Option<String>,
    },
    Detached {
        sender: Option<HandleId>,
    },
    Media {
        sender: Option<HandleId>,
        #[serde(rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        receiving: bool,
    },
    SlowLink {
        sender: Option<HandleId>,
        #[serde(default)]
        uplink: bool,
        lost: Option<u64>,
    },
    Timeout {
        session_id: Option<SessionId>,
    },
    Keepalive {
        session_id: Option<SessionId>,
    },
    #[serde(skip)]
    Unknown(Value),
}

impl ServerMessage {
    /// Parses one inbound message, keeping unrecognised payloads as [`ServerMessage::Unknown`].
    pub fn parse(value: Value) -> ServerMessage {
        match serde_json::from_value::<ServerMessage>(value.clone()) {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "unrecognised gateway message");
                ServerMessage::Unknown(value)
            }
        }
    }

    pub fn transaction(&self) -> Option<&str> {
        match self {
            ServerMessage::Ack { transaction, .. }
            | ServerMessage::Success { transaction, .. }
            | ServerMessage::Error { transaction, .. }
            | ServerMessage::Event { transaction, .. } => transaction.as_deref(),
            _ => None,
        }
    }

    pub fn sender(&self) -> Option<HandleId> {
        match self {
            ServerMessage::Success { sender, .. }
            | ServerMessage::Event { sender, .. }
            | ServerMessage::Trickle { sender, .. }
            | ServerMessage::WebrtcUp { sender }
            | ServerMessage::Hangup { sender, .. }
            | ServerMessage::Detached { sender }
            | ServerMessage::Media { sender, .. }
            | ServerMessage::SlowLink { sender, .. } => *sender,
            _ => None,
        }
    }

    /// Id carried by a `success` reply to `create`/`claim`/`attach`.
    pub fn created_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Success {
                session_id, data, ..
            } => session_id.or_else(|| data.as_ref().and_then(|d| d.id)),
            _ => None,
        }
    }

    /// `data.id` of a `success` reply; the handle id for `attach`.
    pub fn data_id(&self) -> Option<u64> {
        match self {
            ServerMessage::Success { data, .. } => data.as_ref().and_then(|d| d.id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Ack { .. } => "ack",
            ServerMessage::Success { .. } => "success",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Event { .. } => "event",
            ServerMessage::Trickle { .. } => "trickle",
            ServerMessage::WebrtcUp { .. } => "webrtcup",
            ServerMessage::Hangup { .. } => "hangup",
            ServerMessage::Detached { .. } => "detached",
            ServerMessage::Media { .. } => "media",
            ServerMessage::SlowLink { .. } => "slowlink",
            ServerMessage::Timeout { .. } => "timeout",
            ServerMessage::Keepalive { .. } => "keepalive",
            ServerMessage::Unknown(_) => "unknown",
        }
    }
}
