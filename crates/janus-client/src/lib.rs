//! Client-side signaling engine for the Janus WebRTC gateway.
//!
//! A [`Session`] talks to the gateway over a WebSocket or HTTP long-poll
//! transport, attaches plugin [`Handle`]s and routes the gateway's pushed
//! events to them. Handles negotiate media through the collaborator traits in
//! [`webrtc`], so the engine runs against webrtc-rs (feature `webrtc-rs`) or
//! any other implementation, including test fakes.

pub mod callbacks;
pub mod config;
mod data_channel;
pub mod error;
pub mod handle;
pub mod negotiation;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod webrtc;

pub use callbacks::{
    DataMessage, HandleCallbacks, MediaState, PluginMessage, SessionHandlers, SlowLink,
    WebrtcState,
};
pub use config::{
    BundlePolicy, IceServer, IceTransportPolicy, ServerList, SessionConfig, SessionConfigBuilder,
};
pub use error::{ErrorCategory, JanusError, JanusResult, NegotiationError};
pub use handle::{DetachOptions, Handle, MessageOutcome};
pub use negotiation::{MediaOptions, NegotiationOptions, NegotiationState, TrackAction};
pub use protocol::{CandidateInit, HandleId, Jsep, SdpType, ServerMessage, SessionId};
pub use registry::SessionRegistry;
pub use session::{AttachOptions, DestroyOptions, Session, SessionBuilder};
