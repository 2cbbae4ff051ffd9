use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::media::TrackPresence;
use crate::protocol::{CandidateInit, Jsep};
use crate::webrtc::{MediaKind, MediaStream, MediaTrack, PeerConnection};

/// Where a handle's negotiation currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// No negotiation has run yet.
    Idle,
    /// Working out the per-kind track changes of a renegotiation.
    Updating,
    ObtainingMedia,
    BuildingDescription,
    /// Local description applied; waiting for candidates when not trickling.
    GatheringCandidates { trickle: bool },
    /// The last round produced a description. Renegotiation re-enters at `Updating`.
    Ready,
    /// The peer connection was torn down by hangup, detach or cleanup.
    Closed,
}

pub(crate) struct LocalTrack {
    pub track: Arc<dyn MediaTrack>,
    /// Supplied by the caller; cleanup leaves it running.
    pub external: bool,
}

pub(crate) struct NegotiationContext {
    pub state: NegotiationState,
    pub pc: Option<Arc<dyn PeerConnection>>,
    pub local_stream: Option<Arc<dyn MediaStream>>,
    pub local_tracks: HashMap<MediaKind, LocalTrack>,
    /// Remote candidates received before the remote description; `None` is end-of-candidates.
    pub pending_candidates: Vec<Option<CandidateInit>>,
    pub local_sdp: Option<Jsep>,
    pub remote_sdp: Option<Jsep>,
    pub peer_task: Option<JoinHandle<()>>,
}

impl Default for NegotiationContext {
    fn default() -> Self {
        Self {
            state: NegotiationState::Idle,
            pc: None,
            local_stream: None,
            local_tracks: HashMap::new(),
            pending_candidates: Vec::new(),
            local_sdp: None,
            remote_sdp: None,
            peer_task: None,
        }
    }
}

impl NegotiationContext {
    pub fn track_presence(&self) -> TrackPresence {
        TrackPresence {
            audio: self.local_tracks.contains_key(&MediaKind::Audio),
            video: self.local_tracks.contains_key(&MediaKind::Video),
        }
    }

    /// State to fall back to when a round fails part way.
    pub fn settled_state(&self) -> NegotiationState {
        match (&self.pc, &self.local_sdp) {
            (None, _) => NegotiationState::Idle,
            (Some(_), Some(_)) => NegotiationState::Ready,
            (Some(_), None) => NegotiationState::Idle,
        }
    }

    /// Stops owned tracks and forgets everything tied to the peer connection.
    /// Returns the connection so the caller can close it outside the lock.
    pub fn reset(&mut self) -> Option<Arc<dyn PeerConnection>> {
        for (_, local) in self.local_tracks.drain() {
            if !local.external {
                local.track.stop();
            }
        }
        self.local_stream = None;
        if let Some(task) = self.peer_task.take() {
            task.abort();
        }
        self.pending_candidates.clear();
        self.local_sdp = None;
        self.remote_sdp = None;
        self.state = NegotiationState::Closed;
        self.pc.take()
    }
}

#[derive(Debug, Clone, Copy)]
struct GatheringFlags {
    trickle: bool,
    ice_done: bool,
}

/// ICE gathering progress, shared with the peer event task without the negotiation lock.
pub(crate) struct IceGathering {
    flags: Mutex<GatheringFlags>,
    settled: watch::Sender<bool>,
}

impl Default for IceGathering {
    fn default() -> Self {
        Self {
            flags: Mutex::new(GatheringFlags {
                trickle: true,
                ice_done: false,
            }),
            settled: watch::Sender::new(false),
        }
    }
}

impl IceGathering {
    /// Starts gathering for a new peer connection with the given trickle mode.
    pub fn begin(&self, trickle: bool) {
        *self.flags.lock() = GatheringFlags {
            trickle,
            ice_done: false,
        };
        self.settled.send_replace(false);
    }

    /// Gathering starts over (ICE restart); the trickle mode is kept.
    pub fn restart(&self) {
        self.flags.lock().ice_done = false;
        self.settled.send_replace(false);
    }

    pub fn trickle(&self) -> bool {
        self.flags.lock().trickle
    }

    pub fn is_done(&self) -> bool {
        self.flags.lock().ice_done
    }

    pub fn mark_done(&self) {
        self.flags.lock().ice_done = true;
        self.settled.send_replace(true);
    }

    /// Releases waiters without completing gathering.
    pub fn abort(&self) {
        self.flags.lock().ice_done = false;
        self.settled.send_replace(true);
    }

    /// Waits until gathering completed or was aborted; true only for completion.
    pub async fn wait(&self) -> bool {
        let mut settled = self.settled.subscribe();
        if settled.wait_for(|settled| *settled).await.is_err() {
            return false;
        }
        self.is_done()
    }
}
