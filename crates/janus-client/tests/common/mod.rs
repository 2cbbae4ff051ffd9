//! In-process gateway, WebRTC engine and capture doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use janus_client::protocol::Request;
use janus_client::transport::{
    CloseReason, Connector, Transport, TransportEvent, TransportEvents, TransportKind,
};
use janus_client::webrtc::{
    DataChannel, Direction, EngineResult, MediaCapture, MediaConstraints, MediaKind, MediaStream,
    MediaTrack, OfferOptions, PeerConfig, PeerConnection, PeerEvent, WebRtcEngine,
};
use janus_client::{
    CandidateInit, HandleCallbacks, JanusError, JanusResult, Jsep, NegotiationError, Session,
    SessionConfig, SessionHandlers, SessionId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

pub const SERVER: &str = "ws://gateway.test/janus";

pub fn config(servers: impl Into<janus_client::ServerList>) -> SessionConfig {
    SessionConfig::builder(servers)
        .retry_delay(Duration::from_millis(1))
        .build()
        .expect("test config")
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Gives spawned tasks a moment to drain what is queued for them.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

/// Collects every value a callback hook receives.
pub struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Recorder<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Clone + Send + 'static> Recorder<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn hook(&self) -> impl Fn(T) + Send + Sync + 'static {
        let seen = self.0.clone();
        move |value| seen.lock().push(value)
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn items(&self) -> Vec<T> {
        self.0.lock().clone()
    }
}

#[derive(Default)]
struct GatewayState {
    refused: HashSet<String>,
    silent: HashSet<String>,
    create_error: Option<(i64, String)>,
    message_reply: Option<Value>,
    connects: Vec<String>,
    requests: Vec<Value>,
    closes: Vec<Option<CloseReason>>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    next_session: u64,
    next_handle: u64,
}

impl GatewayState {
    fn answer(&mut self, request: &Value) -> Option<Value> {
        let transaction = request["transaction"].clone();
        let session_id = request["session_id"].clone();
        let kind = request["janus"].as_str().unwrap_or_default();
        if self.silent.contains(kind) {
            return None;
        }
        let ack = json!({ "janus": "ack", "session_id": session_id, "transaction": transaction });
        let reply = match kind {
            "create" => match &self.create_error {
                Some((code, reason)) => json!({
                    "janus": "error",
                    "transaction": transaction,
                    "error": { "code": code, "reason": reason },
                }),
                None => {
                    self.next_session += 1;
                    json!({
                        "janus": "success",
                        "transaction": transaction,
                        "data": { "id": 100 + self.next_session },
                    })
                }
            },
            "claim" => json!({
                "janus": "success",
                "transaction": transaction,
                "session_id": session_id,
            }),
            "attach" => {
                self.next_handle += 1;
                json!({
                    "janus": "success",
                    "transaction": transaction,
                    "session_id": session_id,
                    "data": { "id": 1000 + self.next_handle },
                })
            }
            "message" => match &self.message_reply {
                Some(template) => {
                    let mut reply = template.clone();
                    reply["transaction"] = transaction;
                    reply
                }
                None => ack,
            },
            "keepalive" | "trickle" => ack,
            _ => json!({
                "janus": "success",
                "transaction": transaction,
                "session_id": session_id,
            }),
        };
        Some(reply)
    }
}

/// A scripted gateway reachable through its [`Connector`] implementation.
#[derive(Clone, Default)]
pub struct Gateway {
    state: Arc<Mutex<GatewayState>>,
}

impl Gateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse(&self, server: &str) {
        self.state.lock().refused.insert(server.to_string());
    }

    /// Stops replying to requests of `kind`.
    pub fn silence(&self, kind: &str) {
        self.state.lock().silent.insert(kind.to_string());
    }

    pub fn fail_create(&self, code: i64, reason: &str) {
        self.state.lock().create_error = Some((code, reason.to_string()));
    }

    /// Reply template for plugin messages; the transaction is filled in.
    pub fn reply_to_messages(&self, reply: Value) {
        self.state.lock().message_reply = Some(reply);
    }

    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.lock().requests.clone()
    }

    pub fn requests_of(&self, kind: &str) -> Vec<Value> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|request| request["janus"] == kind)
            .cloned()
            .collect()
    }

    pub fn closes(&self) -> Vec<Option<CloseReason>> {
        self.state.lock().closes.clone()
    }

    /// Pushes a message to the most recently connected client.
    pub fn push(&self, message: Value) {
        self.emit(TransportEvent::Message(message));
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(events) = self.state.lock().events.as_ref() {
            let _ = events.send(event);
        }
    }
}

#[async_trait]
impl Connector for Gateway {
    async fn connect(
        &self,
        server: &str,
        _config: &SessionConfig,
    ) -> JanusResult<(Arc<dyn Transport>, TransportEvents)> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock();
            state.connects.push(server.to_string());
            if state.refused.contains(server) {
                return Err(JanusError::Transport(format!("connection refused by {server}")));
            }
            state.events = Some(events_tx.clone());
        }
        let transport = GatewayTransport {
            state: self.state.clone(),
            events: events_tx,
            closed: AtomicBool::new(false),
        };
        Ok((Arc::new(transport), events_rx))
    }
}

struct GatewayTransport {
    state: Arc<Mutex<GatewayState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for GatewayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&self, request: &Request) -> JanusResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JanusError::Transport("socket closed".into()));
        }
        let value = serde_json::to_value(request)?;
        let reply = {
            let mut state = self.state.lock();
            let reply = state.answer(&value);
            state.requests.push(value);
            reply
        };
        if let Some(reply) = reply {
            let _ = self.events.send(TransportEvent::Message(reply));
        }
        Ok(())
    }

    fn start_receiving(&self, _session_id: SessionId) {}

    async fn close(&self, reason: Option<CloseReason>) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().closes.push(reason);
    }
}

pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: &str, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct FakeStream {
    id: String,
    tracks: Vec<Arc<FakeTrack>>,
}

impl FakeStream {
    pub fn new(id: &str, tracks: Vec<Arc<FakeTrack>>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            tracks,
        })
    }
}

impl MediaStream for FakeStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks
            .iter()
            .map(|track| track.clone() as Arc<dyn MediaTrack>)
            .collect()
    }
}

/// Capture provider that hands out fresh tracks for every request.
#[derive(Default)]
pub struct FakeCapture {
    requests: Mutex<Vec<MediaConstraints>>,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
    no_video: AtomicBool,
}

impl FakeCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Simulates a device without a camera.
    pub fn without_video(&self) {
        self.no_video.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().clone()
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().clone()
    }

    pub fn last_track(&self, kind: MediaKind) -> Option<Arc<FakeTrack>> {
        self.tracks
            .lock()
            .iter()
            .rev()
            .find(|track| track.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn capture(&self, constraints: MediaConstraints) -> EngineResult<Arc<dyn MediaStream>> {
        let mut tracks = Vec::new();
        {
            let mut requests = self.requests.lock();
            requests.push(constraints);
            let round = requests.len();
            if constraints.audio {
                tracks.push(FakeTrack::new(&format!("audio-{round}"), MediaKind::Audio));
            }
            if constraints.video && !self.no_video.load(Ordering::SeqCst) {
                tracks.push(FakeTrack::new(&format!("video-{round}"), MediaKind::Video));
            }
        }
        self.tracks.lock().extend(tracks.iter().cloned());
        Ok(FakeStream::new("captured", tracks))
    }
}

pub struct FakeChannel {
    label: String,
    sent: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl FakeChannel {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl DataChannel for FakeChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn send_text(&self, text: &str) -> EngineResult<()> {
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Peer connection that logs every call it receives.
pub struct FakePc {
    pub config: PeerConfig,
    events: mpsc::UnboundedSender<PeerEvent>,
    calls: Mutex<Vec<String>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    local: Mutex<Option<Jsep>>,
    offers: Mutex<u32>,
    closed: AtomicBool,
}

impl FakePc {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<FakeChannel>> {
        self.channels
            .lock()
            .iter()
            .find(|channel| channel.label == label)
            .cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raises an event as if the engine had produced it.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerConnection for FakePc {
    async fn create_offer(&self, options: OfferOptions) -> EngineResult<Jsep> {
        let round = {
            let mut offers = self.offers.lock();
            *offers += 1;
            *offers
        };
        self.record(format!("create_offer:restart={}", options.ice_restart));
        Ok(Jsep::offer(format!("v=0 offer {round}\r\n")))
    }

    async fn create_answer(&self) -> EngineResult<Jsep> {
        self.record("create_answer".into());
        Ok(Jsep::answer("v=0 answer\r\n"))
    }

    async fn set_local_description(&self, jsep: Jsep) -> EngineResult<()> {
        self.record(format!("set_local:{:?}", jsep.sdp_type));
        *self.local.lock() = Some(jsep);
        Ok(())
    }

    async fn set_remote_description(&self, jsep: Jsep) -> EngineResult<()> {
        self.record(format!("set_remote:{:?}", jsep.sdp_type));
        Ok(())
    }

    async fn local_description(&self) -> Option<Jsep> {
        self.local.lock().clone().map(|mut jsep| {
            jsep.sdp.push_str("a=candidate:gathered\r\n");
            jsep
        })
    }

    async fn add_ice_candidate(&self, candidate: Option<CandidateInit>) -> EngineResult<()> {
        match candidate {
            Some(candidate) => self.record(format!("candidate:{}", candidate.candidate)),
            None => self.record("candidate:end".into()),
        }
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> EngineResult<()> {
        self.record(format!("add_track:{}:{}", track.kind(), track.id()));
        Ok(())
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> EngineResult<()> {
        self.record(format!("replace_track:{}:{}", track.kind(), track.id()));
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind) -> EngineResult<()> {
        self.record(format!("remove_track:{kind}"));
        Ok(())
    }

    async fn set_direction(&self, kind: MediaKind, direction: Direction) -> EngineResult<()> {
        self.record(format!("direction:{kind}:{direction}"));
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> EngineResult<Arc<dyn DataChannel>> {
        self.record(format!("data_channel:{label}"));
        let channel = FakeChannel::new(label);
        self.channels.lock().push(channel.clone());
        Ok(channel)
    }

    async fn insert_dtmf(
        &self,
        tones: &str,
        duration: Duration,
        gap: Duration,
    ) -> EngineResult<()> {
        self.record(format!(
            "dtmf:{tones}:{}:{}",
            duration.as_millis(),
            gap.as_millis()
        ));
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.record("close".into());
    }
}

#[derive(Default)]
pub struct FakeEngine {
    pcs: Mutex<Vec<Arc<FakePc>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> usize {
        self.pcs.lock().len()
    }

    pub fn last_pc(&self) -> Arc<FakePc> {
        self.pcs
            .lock()
            .last()
            .cloned()
            .expect("no peer connection created")
    }
}

#[async_trait]
impl WebRtcEngine for FakeEngine {
    async fn create_peer_connection(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> EngineResult<Arc<dyn PeerConnection>> {
        let pc = Arc::new(FakePc {
            config,
            events,
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            offers: Mutex::new(0),
            closed: AtomicBool::new(false),
        });
        self.pcs.lock().push(pc.clone());
        Ok(pc)
    }
}

/// A connected session wired to the fakes above.
pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub engine: Arc<FakeEngine>,
    pub capture: Arc<FakeCapture>,
    pub errors: Recorder<JanusError>,
    pub destroyed: Recorder<()>,
    pub session: Session,
}

impl Harness {
    pub async fn connect() -> Harness {
        let gateway = Gateway::new();
        let engine = FakeEngine::new();
        let capture = FakeCapture::new();
        let errors = Recorder::new();
        let destroyed = Recorder::new();
        let session = Session::builder(config(SERVER))
            .connector(gateway.clone())
            .engine(engine.clone())
            .capture(capture.clone())
            .handlers(
                SessionHandlers::default()
                    .on_error(errors.hook())
                    .on_destroyed(destroyed.hook()),
            )
            .connect()
            .await
            .expect("session connects");
        Harness {
            gateway,
            engine,
            capture,
            errors,
            destroyed,
            session,
        }
    }

    pub async fn attach(&self, callbacks: HandleCallbacks) -> janus_client::Handle {
        self.session
            .attach(janus_client::AttachOptions::new("janus.plugin.echotest").callbacks(callbacks))
            .await
            .expect("attach")
    }
}

pub fn negotiation_failure(err: JanusError) -> NegotiationError {
    match err {
        JanusError::Negotiation(inner) => inner,
        other => panic!("expected a negotiation error, got {other:?}"),
    }
}
