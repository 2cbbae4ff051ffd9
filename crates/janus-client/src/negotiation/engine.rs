//! The negotiation round itself, plus the task that consumes peer connection events.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::context::{LocalTrack, NegotiationContext, NegotiationState};
use super::media::{plan_media, KindPlan, MediaPlan, TrackAction};
use super::{NegotiationOptions, Role};
use crate::callbacks::DataMessage;
use crate::error::{JanusError, JanusResult, NegotiationError};
use crate::handle::HandleInner;
use crate::protocol::{CandidateInit, Jsep, RequestKind, TrickleCandidate};
use crate::webrtc::{
    Direction, MediaConstraints, MediaKind, MediaStream, MediaTrack, OfferOptions,
    PeerConfig, PeerConnection, PeerEvent, DEFAULT_DATA_CHANNEL_LABEL,
};

#[derive(Default)]
struct AcquiredMedia {
    stream: Option<Arc<dyn MediaStream>>,
    external: bool,
    tracks: HashMap<MediaKind, Arc<dyn MediaTrack>>,
}

fn same_pc(a: &Arc<dyn PeerConnection>, b: &Arc<dyn PeerConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

impl HandleInner {
    pub(crate) async fn negotiate(
        self: &Arc<Self>,
        role: Role,
        options: NegotiationOptions,
    ) -> JanusResult<Jsep> {
        self.ensure_usable()?;
        match (role, options.jsep.is_some()) {
            (Role::Offer, true) => {
                return Err(NegotiationError::InvalidRequest(
                    "Provided a JSEP to a createOffer".into(),
                )
                .into())
            }
            (Role::Answer, false) => {
                return Err(NegotiationError::InvalidRequest(
                    "A valid JSEP is required for createAnswer".into(),
                )
                .into())
            }
            _ => {}
        }

        let (pc, local) = {
            let mut ctx = self.negotiation.lock().await;
            match self.build_description(&mut ctx, role, &options).await {
                Ok(built) => built,
                Err(err) => {
                    ctx.state = ctx.settled_state();
                    return Err(err);
                }
            }
        };

        if self.gathering.trickle() {
            return Ok(local);
        }

        debug!(handle_id = self.id, "waiting for ICE gathering to complete");
        if !self.gathering.wait().await {
            return Err(NegotiationError::Engine(
                "peer connection closed while gathering candidates".into(),
            )
            .into());
        }
        let mut full = pc.local_description().await.unwrap_or(local);
        full.trickle = Some(false);

        let mut ctx = self.negotiation.lock().await;
        if ctx.pc.as_ref().is_some_and(|current| same_pc(current, &pc)) {
            ctx.local_sdp = Some(full.clone());
            ctx.state = NegotiationState::Ready;
        }
        Ok(full)
    }

    async fn build_description(
        self: &Arc<Self>,
        ctx: &mut NegotiationContext,
        role: Role,
        options: &NegotiationOptions,
    ) -> JanusResult<(Arc<dyn PeerConnection>, Jsep)> {
        let handle_id = self.id;
        let update = ctx.pc.is_some();
        if update {
            ctx.state = NegotiationState::Updating;
        }
        let plan = plan_media(&options.media, ctx.track_presence(), update)?;
        debug!(
            handle_id,
            update,
            audio = ?plan.audio.action,
            video = ?plan.video.action,
            data = plan.data,
            "media plan"
        );

        ctx.state = NegotiationState::ObtainingMedia;
        let acquired = self.acquire_media(&plan, options).await?;

        let pc = match ctx.pc.clone() {
            Some(pc) => {
                if options.ice_restart {
                    self.gathering.restart();
                }
                pc
            }
            None => self.create_peer(ctx, options).await?,
        };

        ctx.state = NegotiationState::BuildingDescription;
        if !plan.keeps_all() {
            for kind in MediaKind::ALL {
                apply_track(ctx, &pc, kind, plan.kind(kind), &acquired).await?;
            }
        }
        if let Some(stream) = acquired.stream {
            ctx.local_stream = Some(stream.clone());
            (self.callbacks.on_local_stream)(stream);
        }

        if plan.data {
            let mut channels = self.channels.lock().await;
            if !channels.contains(DEFAULT_DATA_CHANNEL_LABEL) {
                let channel = pc.create_data_channel(DEFAULT_DATA_CHANNEL_LABEL).await?;
                channels.insert(channel);
            }
        }

        if let Some(remote) = options.jsep.clone() {
            pc.set_remote_description(remote.clone()).await?;
            ctx.remote_sdp = Some(remote);
            flush_candidates(handle_id, ctx, &pc).await;
        }

        let mut local = match role {
            Role::Offer => {
                pc.create_offer(OfferOptions {
                    ice_restart: options.ice_restart,
                })
                .await?
            }
            Role::Answer => pc.create_answer().await?,
        };
        if let Some(customize) = &options.customize_sdp {
            customize(&mut local);
        }
        pc.set_local_description(local.clone()).await?;
        ctx.local_sdp = Some(local.clone());

        ctx.state = if self.gathering.trickle() {
            NegotiationState::Ready
        } else {
            NegotiationState::GatheringCandidates { trickle: false }
        };
        Ok((pc, local))
    }

    async fn acquire_media(
        &self,
        plan: &MediaPlan,
        options: &NegotiationOptions,
    ) -> JanusResult<AcquiredMedia> {
        let wanted: Vec<MediaKind> = MediaKind::ALL
            .into_iter()
            .filter(|kind| plan.kind(*kind).action.needs_capture())
            .collect();
        let mut acquired = AcquiredMedia::default();
        if wanted.is_empty() {
            return Ok(acquired);
        }

        let stream = match &options.stream {
            Some(stream) => {
                acquired.external = true;
                Some(stream.clone())
            }
            None => {
                let capture = self
                    .session
                    .upgrade()
                    .and_then(|session| session.capture.clone());
                match capture {
                    Some(capture) => {
                        let constraints = MediaConstraints {
                            audio: wanted.contains(&MediaKind::Audio),
                            video: wanted.contains(&MediaKind::Video),
                        };
                        Some(capture.capture(constraints).await?)
                    }
                    None => {
                        debug!(handle_id = self.id, "no capture provider, negotiating without local media");
                        None
                    }
                }
            }
        };

        if let Some(stream) = &stream {
            for kind in &wanted {
                if let Some(track) = stream.track(*kind) {
                    acquired.tracks.insert(*kind, track);
                }
            }
        }
        if let Some(missing) = wanted
            .iter()
            .find(|kind| plan.kind(**kind).required && !acquired.tracks.contains_key(*kind))
        {
            if !acquired.external {
                for track in acquired.tracks.values() {
                    track.stop();
                }
            }
            return Err(NegotiationError::Capture(format!("no {missing} track available")).into());
        }
        acquired.stream = stream;
        Ok(acquired)
    }

    async fn create_peer(
        self: &Arc<Self>,
        ctx: &mut NegotiationContext,
        options: &NegotiationOptions,
    ) -> JanusResult<Arc<dyn PeerConnection>> {
        let session = self
            .session
            .upgrade()
            .ok_or_else(|| JanusError::invalid_handle(self.id))?;
        let engine = session
            .engine
            .clone()
            .ok_or_else(|| NegotiationError::Engine("no WebRTC engine configured".into()))?;
        let trickle = options.trickle.unwrap_or(true);
        self.gathering.begin(trickle);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let config = PeerConfig::from_session(session.config(), options.simulcast);
        let pc = engine.create_peer_connection(config, events_tx).await?;
        ctx.peer_task = Some(tokio::spawn(run_peer_events(
            Arc::downgrade(self),
            events_rx,
        )));
        ctx.pc = Some(pc.clone());
        *self.current_pc.lock() = Some(pc.clone());
        info!(handle_id = self.id, trickle, "peer connection created");
        Ok(pc)
    }

    pub(crate) async fn apply_remote_jsep(&self, jsep: Jsep) -> JanusResult<()> {
        let mut ctx = self.negotiation.lock().await;
        let pc = ctx.pc.clone().ok_or(NegotiationError::NoPeerConnection)?;
        pc.set_remote_description(jsep.clone()).await?;
        ctx.remote_sdp = Some(jsep);
        flush_candidates(self.id, &mut ctx, &pc).await;
        Ok(())
    }

    /// Applies a trickled remote candidate, or buffers it until the remote
    /// description is in place. `None` is end-of-candidates.
    pub(crate) async fn add_remote_candidate(&self, candidate: Option<CandidateInit>) {
        let mut ctx = self.negotiation.lock().await;
        match ctx.pc.clone() {
            Some(pc) if ctx.remote_sdp.is_some() => {
                if let Err(err) = pc.add_ice_candidate(candidate).await {
                    warn!(handle_id = self.id, error = %err, "remote candidate rejected");
                }
            }
            _ => {
                trace!(
                    handle_id = self.id,
                    buffered = ctx.pending_candidates.len() + 1,
                    "no remote description yet, buffering candidate"
                );
                ctx.pending_candidates.push(candidate);
            }
        }
    }

    /// Closes the peer connection and forgets all negotiation state. Tracks the
    /// caller supplied keep running. `on_cleanup` fires every time.
    pub(crate) async fn cleanup_webrtc(&self, send_request: bool) {
        let handle_id = self.id;
        if send_request {
            if let Some(session) = self.session.upgrade() {
                if let Err(err) = session
                    .post(RequestKind::Hangup, self.token.as_deref(), |request| {
                        request.handle(handle_id)
                    })
                    .await
                {
                    debug!(handle_id, error = %err, "hangup not sent");
                }
            }
        }

        let pc = {
            let mut ctx = self.negotiation.lock().await;
            let pc = ctx.reset();
            self.channels.lock().await.clear();
            pc
        };
        self.current_pc.lock().take();
        self.gathering.abort();
        if let Some(pc) = pc {
            pc.close().await;
            debug!(handle_id, "peer connection closed");
        }
        (self.callbacks.on_cleanup)(());
    }

    async fn on_peer_event(&self, event: PeerEvent) {
        let handle_id = self.id;
        match event {
            PeerEvent::IceCandidate(Some(candidate)) => {
                if self.gathering.trickle() {
                    self.send_trickle(TrickleCandidate::Candidate(candidate)).await;
                }
            }
            PeerEvent::IceCandidate(None) => {
                debug!(handle_id, "ICE gathering complete");
                self.gathering.mark_done();
                if self.gathering.trickle() {
                    self.send_trickle(TrickleCandidate::completed()).await;
                }
            }
            PeerEvent::IceConnectionState(state) => {
                debug!(handle_id, %state, "ICE connection state");
                (self.callbacks.on_ice_state)(state);
            }
            PeerEvent::RemoteTrack(track) => (self.callbacks.on_remote_track)(track),
            PeerEvent::DataChannel(channel) => {
                debug!(handle_id, label = %channel.label(), "remote data channel");
                self.channels.lock().await.adopt(channel);
            }
            PeerEvent::DataChannelOpen(label) => {
                let flushed = self.channels.lock().await.mark_open(&label).await;
                match flushed {
                    Ok(flushed) => debug!(handle_id, label = %label, flushed, "data channel open"),
                    Err(err) => warn!(handle_id, label = %label, error = %err, "flushing queued data failed"),
                }
                (self.callbacks.on_data_open)(label);
            }
            PeerEvent::DataChannelClosed(label) => {
                debug!(handle_id, label = %label, "data channel closed");
                self.channels.lock().await.mark_closed(&label);
            }
            PeerEvent::DataChannelMessage { label, data } => {
                (self.callbacks.on_data)(DataMessage { label, data });
            }
        }
    }
}

async fn apply_track(
    ctx: &mut NegotiationContext,
    pc: &Arc<dyn PeerConnection>,
    kind: MediaKind,
    plan: &KindPlan,
    acquired: &AcquiredMedia,
) -> JanusResult<()> {
    match plan.action {
        TrackAction::Add => {
            if let Some(track) = acquired.tracks.get(&kind) {
                pc.add_track(track.clone()).await?;
                ctx.local_tracks.insert(
                    kind,
                    LocalTrack {
                        track: track.clone(),
                        external: acquired.external,
                    },
                );
            }
        }
        TrackAction::Replace => {
            if let Some(track) = acquired.tracks.get(&kind) {
                pc.replace_track(track.clone()).await?;
                let previous = ctx.local_tracks.insert(
                    kind,
                    LocalTrack {
                        track: track.clone(),
                        external: acquired.external,
                    },
                );
                if let Some(previous) = previous.filter(|previous| !previous.external) {
                    previous.track.stop();
                }
            }
        }
        TrackAction::Remove => {
            pc.remove_track(kind).await?;
            if let Some(previous) = ctx.local_tracks.remove(&kind) {
                if !previous.external {
                    previous.track.stop();
                }
            }
        }
        TrackAction::Keep | TrackAction::None => {}
    }

    let sending = plan.send && ctx.local_tracks.contains_key(&kind);
    match Direction::from_flags(sending, plan.recv) {
        Direction::Inactive if plan.action != TrackAction::Remove => {}
        direction => pc.set_direction(kind, direction).await?,
    }
    Ok(())
}

async fn flush_candidates(
    handle_id: u64,
    ctx: &mut NegotiationContext,
    pc: &Arc<dyn PeerConnection>,
) {
    let pending = std::mem::take(&mut ctx.pending_candidates);
    if pending.is_empty() {
        return;
    }
    debug!(handle_id, count = pending.len(), "applying buffered remote candidates");
    for candidate in pending {
        if let Err(err) = pc.add_ice_candidate(candidate).await {
            warn!(handle_id, error = %err, "buffered candidate rejected");
        }
    }
}

async fn run_peer_events(handle: Weak<HandleInner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        let Some(handle) = handle.upgrade() else {
            break;
        };
        handle.on_peer_event(event).await;
    }
}
