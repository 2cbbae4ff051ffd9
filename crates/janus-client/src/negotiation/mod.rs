//! Offer/answer negotiation for a handle's peer connection.

use std::fmt;
use std::sync::Arc;

use crate::protocol::Jsep;
use crate::webrtc::MediaStream;

mod context;
mod engine;
pub mod media;

pub(crate) use context::{IceGathering, NegotiationContext};
pub use context::NegotiationState;
pub use media::{plan_media, KindPlan, MediaOptions, MediaPlan, TrackAction, TrackPresence};

/// Hook that rewrites a freshly created local description before it is applied.
pub type SdpHook = Arc<dyn Fn(&mut Jsep) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Offer,
    Answer,
}

/// Parameters for [`Handle::create_offer`](crate::Handle::create_offer) and
/// [`Handle::create_answer`](crate::Handle::create_answer).
#[derive(Clone, Default)]
pub struct NegotiationOptions {
    pub media: MediaOptions,
    /// Trickle candidates one by one. Only the round that creates the peer
    /// connection decides this; defaults to true.
    pub trickle: Option<bool>,
    /// Caller-owned stream used instead of capturing; its tracks are never stopped.
    pub stream: Option<Arc<dyn MediaStream>>,
    /// Remote offer to answer. Required by `create_answer`, rejected by `create_offer`.
    pub jsep: Option<Jsep>,
    pub ice_restart: bool,
    pub simulcast: bool,
    pub customize_sdp: Option<SdpHook>,
}

impl NegotiationOptions {
    pub fn new(media: MediaOptions) -> Self {
        Self {
            media,
            ..Default::default()
        }
    }

    pub fn trickle(mut self, trickle: bool) -> Self {
        self.trickle = Some(trickle);
        self
    }

    pub fn stream(mut self, stream: Arc<dyn MediaStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn jsep(mut self, jsep: Jsep) -> Self {
        self.jsep = Some(jsep);
        self
    }

    pub fn ice_restart(mut self, restart: bool) -> Self {
        self.ice_restart = restart;
        self
    }

    pub fn simulcast(mut self, simulcast: bool) -> Self {
        self.simulcast = simulcast;
        self
    }

    pub fn customize_sdp(mut self, hook: impl Fn(&mut Jsep) + Send + Sync + 'static) -> Self {
        self.customize_sdp = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for NegotiationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationOptions")
            .field("media", &self.media)
            .field("trickle", &self.trickle)
            .field("stream", &self.stream.as_ref().map(|stream| stream.id()))
            .field("jsep", &self.jsep.as_ref().map(|jsep| jsep.sdp_type))
            .field("ice_restart", &self.ice_restart)
            .field("simulcast", &self.simulcast)
            .field("customize_sdp", &self.customize_sdp.is_some())
            .finish()
    }
}
