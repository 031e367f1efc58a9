//! [`PeerConnection`] over the `webrtc` crate
//!
//! Callbacks of `RTCPeerConnection` are forwarded to the orchestrator as
//! [`PeerConnectionEvent`]s. Local tracks are `TrackLocalStaticSample`s the
//! host writes encoded samples into (see [`WebRtcEngine::local_track`]).
//!
//! Each sender carries a single encoding at full resolution; the simulcast
//! layer table is still announced to the SFU by the publisher.

use super::{
    CodecCapability, IceCandidateInit, LocalTrackSpec, MediaKind, PeerConnection,
    PeerConnectionEvent, PeerConnectionFactory, PeerConnectionState, RemoteTrack, SdpType,
    SendEncoding, SessionDescription, SignalingState, TransceiverId, TransceiverInfo,
};
use crate::error::{Error, Result};
use crate::types::IceServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use vidcall_proto::PeerType;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const MIME_TYPE_RED: &str = "audio/red";

/// Codecs registered with every media engine, in default preference order
fn default_codecs() -> Vec<(MediaKind, RTCRtpCodecParameters)> {
    let codec = |mime: &str, clock_rate, channels, fmtp: &str, payload_type| RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime.to_string(),
            clock_rate,
            channels,
            sdp_fmtp_line: fmtp.to_string(),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    };

    vec![
        (
            MediaKind::Audio,
            codec(MIME_TYPE_OPUS, 48_000, 2, "minptime=10;useinbandfec=1", 111),
        ),
        (MediaKind::Audio, codec(MIME_TYPE_RED, 48_000, 2, "111/111", 63)),
        (
            MediaKind::Video,
            codec(
                MIME_TYPE_H264,
                90_000,
                0,
                "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f",
                102,
            ),
        ),
        (MediaKind::Video, codec(MIME_TYPE_VP8, 90_000, 0, "", 96)),
    ]
}

const fn rtp_codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

const fn media_kind(codec_type: RTPCodecType) -> MediaKind {
    match codec_type {
        RTPCodecType::Audio => MediaKind::Audio,
        _ => MediaKind::Video,
    }
}

fn to_capability(params: &RTCRtpCodecParameters) -> CodecCapability {
    CodecCapability {
        mime_type: params.capability.mime_type.clone(),
        clock_rate: params.capability.clock_rate,
        channels: params.capability.channels,
        sdp_fmtp_line: params.capability.sdp_fmtp_line.clone(),
    }
}

const fn peer_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

/// Builds `WebRtcEngine`s sharing one codec table
pub struct WebRtcEngineFactory {
    codecs: Arc<Vec<(MediaKind, RTCRtpCodecParameters)>>,
}

impl Default for WebRtcEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WebRtcEngineFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            codecs: Arc::new(default_codecs()),
        }
    }

    fn build_api(&self) -> Result<API> {
        let mut media_engine = MediaEngine::default();
        for (kind, params) in self.codecs.iter() {
            media_engine.register_codec(params.clone(), rtp_codec_type(*kind))?;
        }

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        role: PeerType,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let api = self.build_api()?;
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        install_callbacks(&pc, role, &events);
        info!(role = %role, ice_servers = ice_servers.len(), "Created peer connection");

        Ok(Arc::new(WebRtcEngine {
            role,
            pc,
            codecs: self.codecs.clone(),
            senders: Mutex::new(Vec::new()),
        }))
    }
}

fn install_callbacks(
    pc: &RTCPeerConnection,
    role: PeerType,
    events: &mpsc::UnboundedSender<PeerConnectionEvent>,
) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            // `None` marks the end of gathering
            let Some(candidate) = candidate else {
                return;
            };
            let json = candidate
                .to_json()
                .map_err(Error::from)
                .and_then(|init| serde_json::to_string(&init).map_err(Error::from));
            match json {
                Ok(candidate) => {
                    let _ = tx.send(PeerConnectionEvent::IceCandidate { role, candidate });
                }
                Err(e) => warn!(role = %role, error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerConnectionEvent::NegotiationNeeded { role });
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let remote = RemoteTrack {
                track_id: track.id(),
                stream_id: track.stream_id(),
                kind: media_kind(track.kind()),
                remote: Some(track),
            };
            debug!(role = %role, stream_id = %remote.stream_id, "Remote track received");
            let _ = tx.send(PeerConnectionEvent::Track {
                role,
                track: remote,
            });
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerConnectionEvent::ConnectionStateChanged {
                role,
                state: peer_connection_state(state),
            });
        })
    }));
}

struct SenderEntry {
    kind: MediaKind,
    transceiver: Arc<RTCRtpTransceiver>,
    track: Option<Arc<TrackLocalStaticSample>>,
}

/// `RTCPeerConnection` behind the [`PeerConnection`] seam
pub struct WebRtcEngine {
    role: PeerType,
    pc: Arc<RTCPeerConnection>,
    codecs: Arc<Vec<(MediaKind, RTCRtpCodecParameters)>>,
    senders: Mutex<Vec<SenderEntry>>,
}

impl WebRtcEngine {
    /// Sample sink of the track currently bound to `transceiver`
    #[must_use]
    pub fn local_track(&self, transceiver: TransceiverId) -> Option<Arc<TrackLocalStaticSample>> {
        self.senders
            .lock()
            .get(transceiver)
            .and_then(|entry| entry.track.clone())
    }

    fn new_local_track(&self, spec: &LocalTrackSpec) -> Result<Arc<TrackLocalStaticSample>> {
        let (_, params) = self
            .codecs
            .iter()
            .find(|(kind, params)| {
                *kind == spec.kind && !params.capability.mime_type.eq_ignore_ascii_case(MIME_TYPE_RED)
            })
            .ok_or_else(|| Error::InvalidState(format!("no {:?} codec registered", spec.kind)))?;

        Ok(Arc::new(TrackLocalStaticSample::new(
            params.capability.clone(),
            spec.track_id.clone(),
            spec.stream_id.clone(),
        )))
    }

    fn transceiver(&self, id: TransceiverId) -> Result<Arc<RTCRtpTransceiver>> {
        self.senders
            .lock()
            .get(id)
            .map(|entry| entry.transceiver.clone())
            .ok_or_else(|| Error::InvalidState(format!("unknown transceiver {id}")))
    }

    fn set_sender_track(&self, id: TransceiverId, track: Option<Arc<TrackLocalStaticSample>>) {
        if let Some(entry) = self.senders.lock().get_mut(id) {
            entry.track = track;
        }
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> SessionDescription {
    let sdp_type = if desc.sdp_type == RTCSdpType::Answer {
        SdpType::Answer
    } else {
        SdpType::Offer
    };
    SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
    };
    Ok(rtc)
}

#[async_trait]
impl PeerConnection for WebRtcEngine {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        Ok(from_rtc_description(offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        Ok(from_rtc_description(answer))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        trace!(role = %self.role, candidate = %candidate.candidate, "Adding remote ICE candidate");
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn restart_ice(&self) -> Result<()> {
        // Credentials are regenerated by the next offer created with `ice_restart`
        debug!(role = %self.role, "ICE restart requested");
        Ok(())
    }

    async fn add_send_transceiver(
        &self,
        track: LocalTrackSpec,
        encodings: &[SendEncoding],
    ) -> Result<TransceiverId> {
        let local = self.new_local_track(&track)?;
        let transceiver = self
            .pc
            .add_transceiver_from_track(
                local.clone() as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        debug!(
            role = %self.role,
            kind = ?track.kind,
            encodings = encodings.len(),
            "Added send transceiver"
        );

        let mut senders = self.senders.lock();
        senders.push(SenderEntry {
            kind: track.kind,
            transceiver,
            track: Some(local),
        });
        Ok(senders.len() - 1)
    }

    async fn replace_sender_track(
        &self,
        transceiver: TransceiverId,
        track: Option<LocalTrackSpec>,
    ) -> Result<()> {
        let rtc_transceiver = self.transceiver(transceiver)?;
        let local = track.as_ref().map(|spec| self.new_local_track(spec)).transpose()?;

        rtc_transceiver
            .sender()
            .await
            .replace_track(
                local
                    .clone()
                    .map(|t| t as Arc<dyn TrackLocal + Send + Sync>),
            )
            .await?;
        self.set_sender_track(transceiver, local);
        Ok(())
    }

    async fn remove_sender_track(&self, transceiver: TransceiverId) -> Result<()> {
        // Detach only; the sender stays usable for a later replacement
        self.replace_sender_track(transceiver, None).await
    }

    async fn set_codec_preferences(
        &self,
        transceiver: TransceiverId,
        codecs: Vec<CodecCapability>,
    ) -> Result<()> {
        let params: Vec<RTCRtpCodecParameters> = codecs
            .iter()
            .filter_map(|wanted| {
                self.codecs.iter().find_map(|(_, params)| {
                    (to_capability(params) == *wanted).then(|| params.clone())
                })
            })
            .collect();

        self.transceiver(transceiver)?
            .set_codec_preferences(params)
            .await?;
        Ok(())
    }

    fn codec_capabilities(&self, kind: MediaKind) -> Vec<CodecCapability> {
        self.codecs
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, params)| to_capability(params))
            .collect()
    }

    async fn transceivers(&self) -> Vec<TransceiverInfo> {
        let entries: Vec<_> = self
            .senders
            .lock()
            .iter()
            .enumerate()
            .map(|(id, entry)| {
                (
                    id,
                    entry.kind,
                    entry.transceiver.clone(),
                    entry.track.as_ref().map(|t| t.id().to_string()),
                )
            })
            .collect();

        entries
            .into_iter()
            .map(|(id, kind, transceiver, track_id)| TransceiverInfo {
                id,
                kind,
                mid: transceiver.mid().map(|mid| mid.to_string()),
                track_id,
            })
            .collect()
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}
