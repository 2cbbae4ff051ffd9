//! Contracts for the WebRTC engine and media capture the client drives.
//!
//! Nothing here talks to a network or a device. A [`WebRtcEngine`] hands out
//! [`PeerConnection`]s that report asynchronous happenings (gathered
//! candidates, remote tracks, data channel state) through a [`PeerEvent`]
//! channel; the handle's negotiation logic consumes those events. The
//! `webrtc-rs` feature provides an implementation over the `webrtc` crate.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{BundlePolicy, IceServer, IceTransportPolicy, SessionConfig};
use crate::error::NegotiationError;
use crate::protocol::{CandidateInit, Jsep};

#[cfg(feature = "webrtc-rs")]
pub mod rs;

/// Label used for the data channel negotiated alongside media.
pub const DEFAULT_DATA_CHANNEL_LABEL: &str = "JanusDataChannel";

pub type EngineResult<T> = Result<T, NegotiationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(value: &str) -> Option<MediaKind> {
        match value {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transceiver direction for one media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    pub fn from_flags(send: bool, recv: bool) -> Direction {
        match (send, recv) {
            (true, true) => Direction::SendRecv,
            (true, false) => Direction::SendOnly,
            (false, true) => Direction::RecvOnly,
            (false, false) => Direction::Inactive,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IceConnectionState::New => "new",
            IceConnectionState::Checking => "checking",
            IceConnectionState::Connected => "connected",
            IceConnectionState::Completed => "completed",
            IceConnectionState::Disconnected => "disconnected",
            IceConnectionState::Failed => "failed",
            IceConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Peer connection settings derived from the session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_transport_policy: IceTransportPolicy,
    pub bundle_policy: BundlePolicy,
    pub ipv6: bool,
    pub simulcast: bool,
}

impl PeerConfig {
    pub fn from_session(config: &SessionConfig, simulcast: bool) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            ice_transport_policy: config.ice_transport_policy,
            bundle_policy: config.bundle_policy,
            ipv6: config.ipv6,
            simulcast,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfferOptions {
    pub ice_restart: bool,
}

/// What to ask the capture provider for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

pub trait MediaTrack: Send + Sync {
    fn id(&self) -> String;
    fn kind(&self) -> MediaKind;
    fn enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

pub trait MediaStream: Send + Sync {
    fn id(&self) -> String;
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    fn track(&self, kind: MediaKind) -> Option<Arc<dyn MediaTrack>> {
        self.tracks().into_iter().find(|track| track.kind() == kind)
    }
}

#[async_trait]
pub trait MediaCapture: Send + Sync {
    async fn capture(&self, constraints: MediaConstraints) -> EngineResult<Arc<dyn MediaStream>>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    async fn send_text(&self, text: &str) -> EngineResult<()>;
    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_id: String,
}

/// Asynchronous notifications raised by a peer connection.
pub enum PeerEvent {
    /// A locally gathered candidate; `None` marks the end of gathering.
    IceCandidate(Option<CandidateInit>),
    IceConnectionState(IceConnectionState),
    RemoteTrack(RemoteTrack),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    DataChannelOpen(String),
    DataChannelClosed(String),
    DataChannelMessage { label: String, data: String },
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::IceCandidate(candidate) => {
                f.debug_tuple("IceCandidate").field(candidate).finish()
            }
            PeerEvent::IceConnectionState(state) => {
                f.debug_tuple("IceConnectionState").field(state).finish()
            }
            PeerEvent::RemoteTrack(track) => f.debug_tuple("RemoteTrack").field(track).finish(),
            PeerEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            PeerEvent::DataChannelOpen(label) => {
                f.debug_tuple("DataChannelOpen").field(label).finish()
            }
            PeerEvent::DataChannelClosed(label) => {
                f.debug_tuple("DataChannelClosed").field(label).finish()
            }
            PeerEvent::DataChannelMessage { label, data } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &data.len())
                .finish(),
        }
    }
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, options: OfferOptions) -> EngineResult<Jsep>;
    async fn create_answer(&self) -> EngineResult<Jsep>;
    async fn set_local_description(&self, jsep: Jsep) -> EngineResult<()>;
    async fn set_remote_description(&self, jsep: Jsep) -> EngineResult<()>;
    /// Current local description, including any candidates gathered so far.
    async fn local_description(&self) -> Option<Jsep>;
    /// `None` signals end-of-candidates.
    async fn add_ice_candidate(&self, candidate: Option<CandidateInit>) -> EngineResult<()>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> EngineResult<()>;
    /// Swaps the sender of the track's kind in place, adding one if none exists.
    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> EngineResult<()>;
    async fn remove_track(&self, kind: MediaKind) -> EngineResult<()>;
    /// Sets the direction of the first transceiver of `kind`. A `RecvOnly`
    /// request with no transceiver of that kind adds one.
    async fn set_direction(&self, kind: MediaKind, direction: Direction) -> EngineResult<()>;
    /// Creates an unordered channel.
    async fn create_data_channel(&self, label: &str) -> EngineResult<Arc<dyn DataChannel>>;
    async fn insert_dtmf(&self, tones: &str, duration: Duration, gap: Duration)
        -> EngineResult<()>;
    async fn close(&self);
}

#[async_trait]
pub trait WebRtcEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> EngineResult<Arc<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_flags() {
        assert_eq!(Direction::from_flags(true, true), Direction::SendRecv);
        assert_eq!(Direction::from_flags(false, true), Direction::RecvOnly);
        assert_eq!(Direction::from_flags(false, false).to_string(), "inactive");
    }

    #[test]
    fn media_kind_round_trips_wire_names() {
        for kind in MediaKind::ALL {
            assert_eq!(MediaKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MediaKind::parse("screen"), None);
    }
}
