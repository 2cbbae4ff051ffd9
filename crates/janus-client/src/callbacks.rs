//! Application hooks invoked by sessions and handles.
//!
//! Every hook defaults to a no-op. Hooks run on the client's internal tasks,
//! so they should return quickly and hand heavy work off elsewhere.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::error::JanusError;
use crate::protocol::Jsep;
use crate::webrtc::{IceConnectionState, MediaKind, MediaStream, RemoteTrack};

pub type Hook<T> = Arc<dyn Fn(T) + Send + Sync>;

fn noop<T: 'static>() -> Hook<T> {
    Arc::new(|_: T| {})
}

/// Session-level notifications.
#[derive(Clone)]
pub struct SessionHandlers {
    /// Fatal session failure (lost connection, poll retries exhausted, gateway timeout).
    /// Fires at most once per connection.
    pub on_error: Hook<JanusError>,
    pub on_destroyed: Hook<()>,
}

impl Default for SessionHandlers {
    fn default() -> Self {
        Self {
            on_error: noop(),
            on_destroyed: noop(),
        }
    }
}

impl SessionHandlers {
    pub fn on_error(mut self, hook: impl Fn(JanusError) + Send + Sync + 'static) -> Self {
        self.on_error = Arc::new(hook);
        self
    }

    pub fn on_destroyed(mut self, hook: impl Fn(()) + Send + Sync + 'static) -> Self {
        self.on_destroyed = Arc::new(hook);
        self
    }
}

impl fmt::Debug for SessionHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandlers").finish_non_exhaustive()
    }
}

/// Plugin message pushed by the gateway: `plugindata.data` plus an optional JSEP.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginMessage {
    pub data: Value,
    pub jsep: Option<Jsep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebrtcState {
    pub up: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaState {
    pub kind: MediaKind,
    pub receiving: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlowLink {
    pub uplink: bool,
    pub lost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub label: String,
    pub data: String,
}

/// Per-handle notifications.
#[derive(Clone)]
pub struct HandleCallbacks {
    pub on_message: Hook<PluginMessage>,
    pub on_webrtc_state: Hook<WebrtcState>,
    pub on_media_state: Hook<MediaState>,
    pub on_slow_link: Hook<SlowLink>,
    pub on_ice_state: Hook<IceConnectionState>,
    pub on_local_stream: Hook<Arc<dyn MediaStream>>,
    pub on_remote_track: Hook<RemoteTrack>,
    pub on_data: Hook<DataMessage>,
    pub on_data_open: Hook<String>,
    pub on_cleanup: Hook<()>,
    pub on_detached: Hook<()>,
}

impl Default for HandleCallbacks {
    fn default() -> Self {
        Self {
            on_message: noop(),
            on_webrtc_state: noop(),
            on_media_state: noop(),
            on_slow_link: noop(),
            on_ice_state: noop(),
            on_local_stream: noop(),
            on_remote_track: noop(),
            on_data: noop(),
            on_data_open: noop(),
            on_cleanup: noop(),
            on_detached: noop(),
        }
    }
}

impl HandleCallbacks {
    pub fn on_message(mut self, hook: impl Fn(PluginMessage) + Send + Sync + 'static) -> Self {
        self.on_message = Arc::new(hook);
        self
    }

    pub fn on_webrtc_state(mut self, hook: impl Fn(WebrtcState) + Send + Sync + 'static) -> Self {
        self.on_webrtc_state = Arc::new(hook);
        self
    }

    pub fn on_media_state(mut self, hook: impl Fn(MediaState) + Send + Sync + 'static) -> Self {
        self.on_media_state = Arc::new(hook);
        self
    }

    pub fn on_slow_link(mut self, hook: impl Fn(SlowLink) + Send + Sync + 'static) -> Self {
        self.on_slow_link = Arc::new(hook);
        self
    }

    pub fn on_ice_state(
        mut self,
        hook: impl Fn(IceConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.on_ice_state = Arc::new(hook);
        self
    }

    pub fn on_local_stream(
        mut self,
        hook: impl Fn(Arc<dyn MediaStream>) + Send + Sync + 'static,
    ) -> Self {
        self.on_local_stream = Arc::new(hook);
        self
    }

    pub fn on_remote_track(mut self, hook: impl Fn(RemoteTrack) + Send + Sync + 'static) -> Self {
        self.on_remote_track = Arc::new(hook);
        self
    }

    pub fn on_data(mut self, hook: impl Fn(DataMessage) + Send + Sync + 'static) -> Self {
        self.on_data = Arc::new(hook);
        self
    }

    pub fn on_data_open(mut self, hook: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_data_open = Arc::new(hook);
        self
    }

    pub fn on_cleanup(mut self, hook: impl Fn(()) + Send + Sync + 'static) -> Self {
        self.on_cleanup = Arc::new(hook);
        self
    }

    pub fn on_detached(mut self, hook: impl Fn(()) + Send + Sync + 'static) -> Self {
        self.on_detached = Arc::new(hook);
        self
    }
}

impl fmt::Debug for HandleCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleCallbacks").finish_non_exhaustive()
    }
}
