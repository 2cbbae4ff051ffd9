//! What a negotiation round has to change in the local media.
//!
//! [`plan_media`] is pure: it looks at the caller's [`MediaOptions`] and the
//! tracks the context currently sends, and produces one [`TrackAction`] per
//! kind. Nothing touches the peer connection until a plan exists, so a
//! conflicting request fails without side effects.

use crate::error::NegotiationError;
use crate::webrtc::MediaKind;

/// Media request for an offer or answer.
///
/// `None` flags take their defaults: audio and video are sent and received,
/// data is off. A generic `audio`/`video` of `Some(false)` wins over the
/// per-direction flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaOptions {
    pub audio: Option<bool>,
    pub video: Option<bool>,
    pub audio_send: Option<bool>,
    pub audio_recv: Option<bool>,
    pub video_send: Option<bool>,
    pub video_recv: Option<bool>,
    pub data: bool,
    pub add_audio: bool,
    pub add_video: bool,
    pub add_data: bool,
    pub remove_audio: bool,
    pub remove_video: bool,
    pub replace_audio: bool,
    pub replace_video: bool,
    pub fail_if_no_audio: bool,
    pub fail_if_no_video: bool,
}

impl MediaOptions {
    pub fn audio_send_enabled(&self) -> bool {
        Self::enabled(self.audio, self.audio_send)
    }

    pub fn audio_recv_enabled(&self) -> bool {
        Self::enabled(self.audio, self.audio_recv)
    }

    pub fn video_send_enabled(&self) -> bool {
        Self::enabled(self.video, self.video_send)
    }

    pub fn video_recv_enabled(&self) -> bool {
        Self::enabled(self.video, self.video_recv)
    }

    pub fn data_enabled(&self) -> bool {
        self.data
    }

    /// Capture must yield an audio track; only meaningful when sending audio.
    pub fn audio_send_required(&self) -> bool {
        Self::required(self.audio, self.audio_send, self.fail_if_no_audio)
    }

    pub fn video_send_required(&self) -> bool {
        Self::required(self.video, self.video_send, self.fail_if_no_video)
    }

    pub fn send_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_send_enabled(),
            MediaKind::Video => self.video_send_enabled(),
        }
    }

    pub fn recv_enabled(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio_recv_enabled(),
            MediaKind::Video => self.video_recv_enabled(),
        }
    }

    fn enabled(generic: Option<bool>, direction: Option<bool>) -> bool {
        if generic == Some(false) {
            return false;
        }
        direction.unwrap_or(true)
    }

    fn required(generic: Option<bool>, send: Option<bool>, fail_if_missing: bool) -> bool {
        if generic == Some(false) || send == Some(false) {
            return false;
        }
        fail_if_missing
    }

    fn request(&self, kind: MediaKind) -> Option<Request> {
        let (add, remove, replace) = match kind {
            MediaKind::Audio => (self.add_audio, self.remove_audio, self.replace_audio),
            MediaKind::Video => (self.add_video, self.remove_video, self.replace_video),
        };
        if add {
            Some(Request::Add)
        } else if remove {
            Some(Request::Remove)
        } else if replace {
            Some(Request::Replace)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Add,
    Remove,
    Replace,
}

/// Change to the local track of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackAction {
    /// Nothing to send and nothing to tear down.
    None,
    /// Capture a track of this kind and attach it.
    Add,
    /// Leave the existing track as it is.
    Keep,
    /// Detach and stop the existing track.
    Remove,
    /// Capture a fresh track and swap it into the existing sender.
    Replace,
}

impl TrackAction {
    pub fn needs_capture(self) -> bool {
        matches!(self, TrackAction::Add | TrackAction::Replace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindPlan {
    pub action: TrackAction,
    pub send: bool,
    pub recv: bool,
    /// Capture must produce a track of this kind or the round fails.
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPlan {
    /// The peer connection already existed: this is a renegotiation.
    pub update: bool,
    pub audio: KindPlan,
    pub video: KindPlan,
    pub data: bool,
}

impl MediaPlan {
    pub fn kind(&self, kind: MediaKind) -> &KindPlan {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }

    /// A renegotiation that keeps both tracks goes straight to description building.
    pub fn keeps_all(&self) -> bool {
        self.update && self.audio.action == TrackAction::Keep && self.video.action == TrackAction::Keep
    }

    pub fn needs_capture(&self) -> bool {
        self.audio.action.needs_capture() || self.video.action.needs_capture()
    }
}

/// Local tracks the context sends right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackPresence {
    pub audio: bool,
    pub video: bool,
}

impl TrackPresence {
    pub fn has(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

/// Computes the per-kind actions for one negotiation round.
///
/// `update` is whether a peer connection already exists. The first round is a
/// snapshot of the send flags; later rounds derive add/keep/remove/replace from
/// the request and the tracks in `current`.
pub fn plan_media(
    options: &MediaOptions,
    current: TrackPresence,
    update: bool,
) -> Result<MediaPlan, NegotiationError> {
    let audio = plan_kind(options, MediaKind::Audio, current, update)?;
    let video = plan_kind(options, MediaKind::Video, current, update)?;
    let data = options.data_enabled() || (update && options.add_data);
    Ok(MediaPlan {
        update,
        audio,
        video,
        data,
    })
}

fn plan_kind(
    options: &MediaOptions,
    kind: MediaKind,
    current: TrackPresence,
    update: bool,
) -> Result<KindPlan, NegotiationError> {
    let recv = options.recv_enabled(kind);
    let required = match kind {
        MediaKind::Audio => options.audio_send_required(),
        MediaKind::Video => options.video_send_required(),
    };
    let mut send = options.send_enabled(kind);

    if !update {
        let action = if send { TrackAction::Add } else { TrackAction::None };
        return Ok(KindPlan {
            action,
            send,
            recv,
            required: required && send,
        });
    }

    let has_track = current.has(kind);
    let action = match options.request(kind) {
        Some(Request::Add) => {
            if has_track {
                return Err(NegotiationError::AlreadyPresent(kind));
            }
            send = true;
            TrackAction::Add
        }
        Some(Request::Remove) => {
            send = false;
            if has_track {
                TrackAction::Remove
            } else {
                TrackAction::None
            }
        }
        // Replacing a track that isn't there is an add.
        Some(Request::Replace) => {
            send = true;
            if has_track {
                TrackAction::Replace
            } else {
                TrackAction::Add
            }
        }
        None if send && has_track => TrackAction::Keep,
        None if send => TrackAction::Add,
        None => TrackAction::None,
    };

    Ok(KindPlan {
        action,
        send,
        recv,
        required: required && send,
    })
}
