//! [`WebRtcEngine`] over the `webrtc` crate.
//!
//! Local tracks are backed by [`TrackLocalStaticSample`]s (Opus for audio,
//! VP8 for video); the application feeds them through
//! [`RsPeerConnection::sample_track`]. Transceiver directions are expressed
//! through senders: sending attaches a track, `RecvOnly` adds a receive-only
//! transceiver when none exists and `Inactive` detaches the sender's track.
//! DTMF is not available in webrtc-rs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice::network_type::NetworkType;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{
    DataChannel, Direction, EngineResult, IceConnectionState, MediaKind, MediaTrack,
    OfferOptions, PeerConfig, PeerConnection, PeerEvent, RemoteTrack, WebRtcEngine,
};
use crate::config::{BundlePolicy, IceTransportPolicy};
use crate::error::NegotiationError;
use crate::protocol::{CandidateInit, Jsep, SdpType};

const LOCAL_STREAM_ID: &str = "janus-local";

fn engine_error(err: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Engine(err.to_string())
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

fn media_kind(codec: RTPCodecType) -> Option<MediaKind> {
    match codec {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    let state = match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => return None,
    };
    Some(state)
}

fn to_rtc_description(jsep: Jsep) -> EngineResult<RTCSessionDescription> {
    match jsep.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(jsep.sdp).map_err(engine_error),
        SdpType::Answer => RTCSessionDescription::answer(jsep.sdp).map_err(engine_error),
        SdpType::Pranswer => RTCSessionDescription::pranswer(jsep.sdp).map_err(engine_error),
        SdpType::Rollback => Err(NegotiationError::Engine(
            "rollback descriptions are not supported".into(),
        )),
    }
}

fn from_rtc_description(description: RTCSessionDescription) -> EngineResult<Jsep> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(engine_error(format!("unexpected description type {other}"))),
    };
    Ok(Jsep {
        sdp_type,
        sdp: description.sdp,
        trickle: None,
    })
}

fn rtc_configuration(config: &PeerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect(),
        ice_transport_policy: match config.ice_transport_policy {
            IceTransportPolicy::All => RTCIceTransportPolicy::All,
            IceTransportPolicy::Relay => RTCIceTransportPolicy::Relay,
        },
        bundle_policy: match config.bundle_policy {
            BundlePolicy::Balanced => RTCBundlePolicy::Balanced,
            BundlePolicy::MaxCompat => RTCBundlePolicy::MaxCompat,
            BundlePolicy::MaxBundle => RTCBundlePolicy::MaxBundle,
        },
        ..Default::default()
    }
}

/// Builds one webrtc-rs API stack per peer connection.
#[derive(Debug, Default, Clone)]
pub struct RsEngine;

#[async_trait]
impl WebRtcEngine for RsEngine {
    async fn create_peer_connection(
        &self,
        config: PeerConfig,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> EngineResult<Arc<dyn PeerConnection>> {
        let mut media = MediaEngine::default();
        media.register_default_codecs().map_err(engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(engine_error)?;
        let mut settings = SettingEngine::default();
        if !config.ipv6 {
            settings.set_network_types(vec![NetworkType::Udp4, NetworkType::Tcp4]);
        }
        if config.simulcast {
            debug!("simulcast requested, webrtc-rs sends a single encoding");
        }
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .with_setting_engine(settings)
            .build();
        let pc = Arc::new(
            api.new_peer_connection(rtc_configuration(&config))
                .await
                .map_err(engine_error)?,
        );
        wire_peer_events(&pc, &events);
        Ok(Arc::new(RsPeerConnection {
            pc,
            events,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

fn wire_peer_events(pc: &Arc<RTCPeerConnection>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let candidate = match candidate {
                Some(candidate) => match candidate.to_json() {
                    Ok(json) => Some(CandidateInit {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(err) => {
                        warn!(error = %err, "local candidate could not be serialized");
                        return;
                    }
                },
                None => None,
            };
            let _ = tx.send(PeerEvent::IceCandidate(candidate));
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        if let Some(state) = ice_state(state) {
            let _ = tx.send(PeerEvent::IceConnectionState(state));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        if let Some(kind) = media_kind(track.kind()) {
            let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                kind,
                track_id: track.id(),
                stream_id: track.stream_id(),
            }));
        }
        Box::pin(async {})
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            wire_channel_events(&channel, &tx);
            let _ = tx.send(PeerEvent::DataChannel(Arc::new(RsDataChannel { channel })));
        })
    }));
}

fn wire_channel_events(channel: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<PeerEvent>) {
    let label = channel.label().to_string();

    let (tx, open_label) = (events.clone(), label.clone());
    channel.on_open(Box::new(move || {
        let _ = tx.send(PeerEvent::DataChannelOpen(open_label));
        Box::pin(async {})
    }));

    let (tx, close_label) = (events.clone(), label.clone());
    channel.on_close(Box::new(move || {
        let _ = tx.send(PeerEvent::DataChannelClosed(close_label.clone()));
        Box::pin(async {})
    }));

    let tx = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let data = String::from_utf8_lossy(&message.data).into_owned();
        trace!(label = %label, binary = !message.is_string, len = data.len(), "data channel message");
        let _ = tx.send(PeerEvent::DataChannelMessage {
            label: label.clone(),
            data,
        });
        Box::pin(async {})
    }));
}

pub struct RsDataChannel {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RsDataChannel {
    fn label(&self) -> String {
        self.channel.label().to_string()
    }

    async fn send_text(&self, text: &str) -> EngineResult<()> {
        self.channel
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(engine_error)
    }

    async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            debug!(label = %self.channel.label(), error = %err, "data channel close failed");
        }
    }
}

type LocalSender = (Arc<RTCRtpSender>, Arc<TrackLocalStaticSample>);

pub struct RsPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    senders: Mutex<HashMap<MediaKind, LocalSender>>,
}

impl RsPeerConnection {
    /// The sample track currently sending `kind`, for the application to write media into.
    pub fn sample_track(&self, kind: MediaKind) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders.lock().get(&kind).map(|(_, track)| track.clone())
    }

    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn sample_track_for(track: &Arc<dyn MediaTrack>) -> Arc<TrackLocalStaticSample> {
        let mime_type = match track.kind() {
            MediaKind::Audio => MIME_TYPE_OPUS,
            MediaKind::Video => MIME_TYPE_VP8,
        };
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..Default::default()
            },
            track.id(),
            LOCAL_STREAM_ID.to_owned(),
        ))
    }
}

#[async_trait]
impl PeerConnection for RsPeerConnection {
    async fn create_offer(&self, options: OfferOptions) -> EngineResult<Jsep> {
        let offer = self
            .pc
            .create_offer(Some(RTCOfferOptions {
                voice_activity_detection: false,
                ice_restart: options.ice_restart,
            }))
            .await
            .map_err(engine_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> EngineResult<Jsep> {
        let answer = self.pc.create_answer(None).await.map_err(engine_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, jsep: Jsep) -> EngineResult<()> {
        let description = to_rtc_description(jsep)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(engine_error)
    }

    async fn set_remote_description(&self, jsep: Jsep) -> EngineResult<()> {
        let description = to_rtc_description(jsep)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(engine_error)
    }

    async fn local_description(&self) -> Option<Jsep> {
        let description = self.pc.local_description().await?;
        from_rtc_description(description).ok()
    }

    async fn add_ice_candidate(&self, candidate: Option<CandidateInit>) -> EngineResult<()> {
        // An empty candidate string is end-of-candidates.
        let init = match candidate {
            Some(candidate) => RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            },
            None => RTCIceCandidateInit::default(),
        };
        self.pc.add_ice_candidate(init).await.map_err(engine_error)
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> EngineResult<()> {
        let kind = track.kind();
        let local = Self::sample_track_for(&track);
        let sender = self
            .pc
            .add_track(local.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_error)?;
        self.senders.lock().insert(kind, (sender, local));
        Ok(())
    }

    async fn replace_track(&self, track: Arc<dyn MediaTrack>) -> EngineResult<()> {
        let kind = track.kind();
        let existing = self.senders.lock().get(&kind).map(|(sender, _)| sender.clone());
        let Some(sender) = existing else {
            return self.add_track(track).await;
        };
        let local = Self::sample_track_for(&track);
        sender
            .replace_track(Some(local.clone() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(engine_error)?;
        self.senders.lock().insert(kind, (sender, local));
        Ok(())
    }

    async fn remove_track(&self, kind: MediaKind) -> EngineResult<()> {
        let removed = self.senders.lock().remove(&kind);
        if let Some((sender, _)) = removed {
            self.pc.remove_track(&sender).await.map_err(engine_error)?;
        }
        Ok(())
    }

    async fn set_direction(&self, kind: MediaKind, direction: Direction) -> EngineResult<()> {
        match direction {
            Direction::SendRecv | Direction::SendOnly => Ok(()),
            Direction::RecvOnly => {
                let sending = self.senders.lock().contains_key(&kind);
                let transceivers = self.pc.get_transceivers().await;
                let present = transceivers
                    .iter()
                    .any(|transceiver| transceiver.kind() == codec_type(kind));
                if sending {
                    self.remove_track(kind).await?;
                }
                if !present {
                    self.pc
                        .add_transceiver_from_kind(
                            codec_type(kind),
                            Some(RTCRtpTransceiverInit {
                                direction: RTCRtpTransceiverDirection::Recvonly,
                                send_encodings: vec![],
                            }),
                        )
                        .await
                        .map_err(engine_error)?;
                }
                Ok(())
            }
            Direction::Inactive => {
                let existing = self.senders.lock().get(&kind).map(|(sender, _)| sender.clone());
                if let Some(sender) = existing {
                    sender.replace_track(None).await.map_err(engine_error)?;
                }
                Ok(())
            }
        }
    }

    async fn create_data_channel(&self, label: &str) -> EngineResult<Arc<dyn DataChannel>> {
        let channel = self
            .pc
            .create_data_channel(
                label,
                Some(RTCDataChannelInit {
                    ordered: Some(false),
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_error)?;
        wire_channel_events(&channel, &self.events);
        Ok(Arc::new(RsDataChannel { channel }))
    }

    async fn insert_dtmf(
        &self,
        _tones: &str,
        _duration: Duration,
        _gap: Duration,
    ) -> EngineResult<()> {
        Err(NegotiationError::Engine(
            "DTMF is not supported by the webrtc-rs engine".into(),
        ))
    }

    async fn close(&self) {
        if let Err(err) = self.pc.close().await {
            debug!(error = %err, "peer connection close failed");
        }
    }
}
