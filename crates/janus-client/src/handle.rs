//! Plugin handles.
//!
//! Each attached handle owns a small event task fed by the session's dispatch
//! task, so a slow plugin callback or a negotiation step never stalls event
//! delivery for sibling handles.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::callbacks::{HandleCallbacks, MediaState, PluginMessage, SlowLink, WebrtcState};
use crate::data_channel::DataChannels;
use crate::error::{JanusError, JanusResult, NegotiationError};
use crate::negotiation::{
    IceGathering, NegotiationContext, NegotiationOptions, NegotiationState, Role,
};
use crate::protocol::{HandleId, Jsep, RequestKind, ServerMessage, TrickleCandidate};
use crate::session::{AttachOptions, SessionInner};
use crate::webrtc::{MediaKind, PeerConnection, DEFAULT_DATA_CHANNEL_LABEL};

pub const DEFAULT_DTMF_DURATION: Duration = Duration::from_millis(500);
pub const DEFAULT_DTMF_GAP: Duration = Duration::from_millis(50);

/// How [`Handle::detach`] releases the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachOptions {
    /// Release locally without telling the gateway.
    pub no_request: bool,
    /// Wait for the gateway's reply. When false the request is sent and not awaited.
    pub async_request: bool,
}

impl Default for DetachOptions {
    fn default() -> Self {
        Self {
            no_request: false,
            async_request: true,
        }
    }
}

/// Reply to a plugin message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// The plugin will answer asynchronously with an event.
    Ack,
    /// The plugin answered synchronously with this `plugindata.data`.
    Success(Option<Value>),
}

/// A session-scoped attachment to one gateway plugin.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("plugin", &self.inner.plugin)
            .field("detached", &self.inner.is_detached())
            .finish()
    }
}

impl Handle {
    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> HandleId {
        self.inner.id
    }

    pub fn plugin(&self) -> &str {
        self.inner.plugin()
    }

    pub fn opaque_id(&self) -> Option<&str> {
        self.inner.opaque_id.as_deref()
    }

    pub fn token(&self) -> Option<&str> {
        self.inner.token.as_deref()
    }

    /// The gateway detached the handle, or it was released locally.
    pub fn is_detached(&self) -> bool {
        self.inner.is_detached() || self.inner.is_released()
    }

    pub async fn negotiation_state(&self) -> NegotiationState {
        self.inner.negotiation.lock().await.state
    }

    /// Sends a plugin message, optionally carrying a JSEP.
    pub async fn send(&self, body: Value, jsep: Option<Jsep>) -> JanusResult<MessageOutcome> {
        let session = self.inner.live_session()?;
        let handle_id = self.inner.id;
        let reply = session
            .request(
                RequestKind::Message,
                Some(handle_id),
                self.inner.token.as_deref(),
                |request| request.handle(handle_id).body(body, jsep),
            )
            .await?;
        match reply {
            ServerMessage::Ack { .. } => Ok(MessageOutcome::Ack),
            ServerMessage::Success { plugindata, .. } => {
                Ok(MessageOutcome::Success(plugindata.map(|plugindata| plugindata.data)))
            }
            other => Err(JanusError::Transport(format!(
                "unexpected {} reply to a plugin message",
                other.kind()
            ))),
        }
    }

    pub async fn create_offer(&self, options: NegotiationOptions) -> JanusResult<Jsep> {
        self.inner.negotiate(Role::Offer, options).await
    }

    /// Answers the remote offer in `options.jsep`.
    pub async fn create_answer(&self, options: NegotiationOptions) -> JanusResult<Jsep> {
        self.inner.negotiate(Role::Answer, options).await
    }

    /// Applies the remote answer to an offer this handle created.
    pub async fn handle_remote_jsep(&self, jsep: Jsep) -> JanusResult<()> {
        self.inner.ensure_usable()?;
        self.inner.apply_remote_jsep(jsep).await
    }

    /// Sends text on the channel named `label`, creating it on first use.
    /// Messages sent before the channel opens are delivered in order once it does.
    pub async fn data(&self, text: impl Into<String>, label: Option<&str>) -> JanusResult<()> {
        self.inner.ensure_usable()?;
        let label = label.unwrap_or(DEFAULT_DATA_CHANNEL_LABEL);
        let pc = self
            .inner
            .current_pc
            .lock()
            .clone()
            .ok_or(NegotiationError::NoPeerConnection)?;
        let mut channels = self.inner.channels.lock().await;
        if !channels.contains(label) {
            let channel = pc.create_data_channel(label).await?;
            channels.insert(channel);
        }
        channels.send(label, text.into()).await?;
        Ok(())
    }

    /// Plays DTMF tones on the audio sender. Defaults: 500 ms tones, 50 ms gaps.
    pub async fn dtmf(
        &self,
        tones: &str,
        duration: Option<Duration>,
        gap: Option<Duration>,
    ) -> JanusResult<()> {
        self.inner.ensure_usable()?;
        if tones.is_empty() {
            return Err(NegotiationError::InvalidRequest("Invalid DTMF parameters".into()).into());
        }
        let pc = {
            let ctx = self.inner.negotiation.lock().await;
            let pc = ctx.pc.clone().ok_or(NegotiationError::NoPeerConnection)?;
            if !ctx.local_tracks.contains_key(&MediaKind::Audio) {
                return Err(NegotiationError::InvalidRequest(
                    "Invalid DTMF configuration (no audio track)".into(),
                )
                .into());
            }
            pc
        };
        pc.insert_dtmf(
            tones,
            duration.unwrap_or(DEFAULT_DTMF_DURATION),
            gap.unwrap_or(DEFAULT_DTMF_GAP),
        )
        .await?;
        Ok(())
    }

    pub async fn mute_audio(&self) -> bool {
        self.inner.set_track_enabled(MediaKind::Audio, false).await
    }

    pub async fn unmute_audio(&self) -> bool {
        self.inner.set_track_enabled(MediaKind::Audio, true).await
    }

    pub async fn mute_video(&self) -> bool {
        self.inner.set_track_enabled(MediaKind::Video, false).await
    }

    pub async fn unmute_video(&self) -> bool {
        self.inner.set_track_enabled(MediaKind::Video, true).await
    }

    pub async fn is_audio_muted(&self) -> bool {
        self.inner.is_muted(MediaKind::Audio).await
    }

    pub async fn is_video_muted(&self) -> bool {
        self.inner.is_muted(MediaKind::Video).await
    }

    /// Tears down the peer connection, optionally telling the gateway with a `hangup`.
    pub async fn hangup(&self, send_request: bool) {
        self.inner.cleanup_webrtc(send_request).await;
    }

    /// Detaches from the plugin. The local negotiation state is always torn
    /// down and the handle is always released, even if the request fails.
    pub async fn detach(&self, options: DetachOptions) -> JanusResult<()> {
        let inner = &self.inner;
        if inner.is_released() {
            return Err(JanusError::invalid_handle(inner.id));
        }
        inner.cleanup_webrtc(false).await;

        let handle_id = inner.id;
        let skip_request = options.no_request || inner.is_detached();
        match inner.session.upgrade() {
            Some(session) if !skip_request && session.is_connected() => {
                let token = inner.token.as_deref();
                let result = if options.async_request {
                    session
                        .request(RequestKind::Detach, None, token, |request| {
                            request.handle(handle_id)
                        })
                        .await
                        .map(|_| ())
                } else {
                    session
                        .post(RequestKind::Detach, token, |request| request.handle(handle_id))
                        .await
                };
                if let Err(err) = result {
                    warn!(handle_id, error = %err, "detach request failed, releasing handle anyway");
                }
            }
            Some(_) if !skip_request => {
                warn!(handle_id, "session is not connected, releasing handle locally");
            }
            _ => {}
        }

        inner.release();
        info!(handle_id, plugin = %inner.plugin, "handle detached");
        Ok(())
    }
}

pub(crate) struct HandleInner {
    pub(crate) id: HandleId,
    plugin: String,
    opaque_id: Option<String>,
    pub(crate) token: Option<String>,
    pub(crate) session: Weak<SessionInner>,
    pub(crate) callbacks: HandleCallbacks,
    detached: AtomicBool,
    pub(crate) negotiation: tokio::sync::Mutex<NegotiationContext>,
    pub(crate) gathering: IceGathering,
    /// Locked after `negotiation` when both are needed.
    pub(crate) channels: tokio::sync::Mutex<DataChannels>,
    pub(crate) current_pc: Mutex<Option<Arc<dyn PeerConnection>>>,
    events: Mutex<Option<mpsc::UnboundedSender<ServerMessage>>>,
}

impl HandleInner {
    pub(crate) fn spawn(
        id: HandleId,
        options: AttachOptions,
        token: Option<String>,
        session: Weak<SessionInner>,
    ) -> Arc<HandleInner> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HandleInner {
            id,
            plugin: options.plugin,
            opaque_id: options.opaque_id,
            token,
            session,
            callbacks: options.callbacks,
            detached: AtomicBool::new(false),
            negotiation: tokio::sync::Mutex::new(NegotiationContext::default()),
            gathering: IceGathering::default(),
            channels: tokio::sync::Mutex::new(DataChannels::default()),
            current_pc: Mutex::new(None),
            events: Mutex::new(Some(events_tx)),
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), events_rx));
        inner
    }

    pub(crate) fn plugin(&self) -> &str {
        &self.plugin
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn is_released(&self) -> bool {
        self.events.lock().is_none()
    }

    fn ensure_attached(&self) -> JanusResult<()> {
        if self.is_released() {
            return Err(JanusError::invalid_handle(self.id));
        }
        Ok(())
    }

    fn live_session(&self) -> JanusResult<Arc<SessionInner>> {
        self.ensure_attached()?;
        self.session
            .upgrade()
            .ok_or_else(|| JanusError::invalid_handle(self.id))
    }

    /// Attached, and the owning session is still connected.
    pub(crate) fn ensure_usable(&self) -> JanusResult<()> {
        if !self.live_session()?.is_connected() {
            return Err(JanusError::not_connected());
        }
        Ok(())
    }

    pub(crate) fn deliver(&self, message: ServerMessage) {
        if let Some(events) = self.events.lock().as_ref() {
            let _ = events.send(message);
        }
    }

    /// Drops the handle from its session and cancels its in-flight requests.
    /// Ends the event task once queued events are drained.
    pub(crate) fn release(&self) {
        self.events.lock().take();
        if let Some(session) = self.session.upgrade() {
            session.remove_handle(self.id);
            let cancelled = session.transactions.cancel_owned(self.id);
            if cancelled > 0 {
                debug!(handle_id = self.id, cancelled, "dropped in-flight requests");
            }
        }
    }

    /// Sends a `trickle` for this handle; failures are only logged.
    pub(crate) async fn send_trickle(&self, candidate: TrickleCandidate) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let handle_id = self.id;
        if let Err(err) = session
            .post(RequestKind::Trickle, self.token.as_deref(), |request| {
                request.handle(handle_id).candidate(candidate)
            })
            .await
        {
            debug!(handle_id, error = %err, "trickle not sent");
        }
    }

    async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let ctx = self.negotiation.lock().await;
        if ctx.pc.is_none() {
            return false;
        }
        match ctx.local_tracks.get(&kind) {
            Some(local) => {
                local.track.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    async fn is_muted(&self, kind: MediaKind) -> bool {
        let ctx = self.negotiation.lock().await;
        if ctx.pc.is_none() {
            return true;
        }
        ctx.local_tracks
            .get(&kind)
            .map_or(true, |local| !local.track.enabled())
    }

    async fn on_server_event(&self, message: ServerMessage) {
        let handle_id = self.id;
        match message {
            ServerMessage::Trickle { candidate, .. } => {
                let candidate = candidate.and_then(|candidate| candidate.as_init());
                self.add_remote_candidate(candidate).await;
            }
            ServerMessage::WebrtcUp { .. } => {
                debug!(handle_id, "webrtc up");
                (self.callbacks.on_webrtc_state)(WebrtcState {
                    up: true,
                    reason: None,
                });
            }
            ServerMessage::Hangup { reason, .. } => {
                info!(handle_id, reason = ?reason, "gateway hung up");
                (self.callbacks.on_webrtc_state)(WebrtcState { up: false, reason });
                self.cleanup_webrtc(false).await;
            }
            ServerMessage::Detached { .. } => {
                info!(handle_id, "gateway detached the handle");
                self.detached.store(true, Ordering::SeqCst);
                (self.callbacks.on_detached)(());
                self.cleanup_webrtc(false).await;
                self.release();
            }
            ServerMessage::Media {
                kind, receiving, ..
            } => match kind.as_deref().and_then(MediaKind::parse) {
                Some(kind) => (self.callbacks.on_media_state)(MediaState { kind, receiving }),
                None => debug!(handle_id, kind = ?kind, "media event for unknown kind"),
            },
            ServerMessage::SlowLink { uplink, lost, .. } => {
                (self.callbacks.on_slow_link)(SlowLink {
                    uplink,
                    lost: lost.unwrap_or(0),
                });
            }
            ServerMessage::Event {
                plugindata, jsep, ..
            } => match plugindata {
                Some(plugindata) => (self.callbacks.on_message)(PluginMessage {
                    data: plugindata.data,
                    jsep,
                }),
                None => warn!(handle_id, "plugin event without plugindata dropped"),
            },
            other => debug!(handle_id, kind = other.kind(), "unhandled handle event"),
        }
    }
}

async fn run_events(handle: Weak<HandleInner>, mut events: mpsc::UnboundedReceiver<ServerMessage>) {
    while let Some(message) = events.recv().await {
        let Some(handle) = handle.upgrade() else {
            break;
        };
        handle.on_server_event(message).await;
    }
}
