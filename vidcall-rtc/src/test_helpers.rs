//! In-memory fakes of the peer connection, its factory and the SFU channel

use crate::error::{Error, Result};
use crate::peer::{
    CodecCapability, IceCandidateInit, LocalTrackSpec, MediaKind, PeerConnection,
    PeerConnectionEvent, PeerConnectionFactory, RemoteTrack, SdpType, SendEncoding,
    SessionDescription, SignalingState, TransceiverId, TransceiverInfo,
};
use crate::types::{CallInfo, IceServer, OwnCapability};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use vidcall_proto::events::{IceTrickle, SfuError};
use vidcall_proto::models::{CallState, ParticipantInfo};
use vidcall_proto::signal::{
    IceRestartRequest, JoinRequest, LeaveCallRequest, SendAnswerRequest, SetPublisherRequest,
    SetPublisherResponse, UpdateMuteStatesRequest, UpdateSubscriptionsRequest,
};
use vidcall_proto::{CallCid, PeerType, SessionId, SfuEvent, TrackType, UserId};

pub fn candidate(candidate: &str) -> IceCandidateInit {
    IceCandidateInit {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn call_info(cid: &str) -> CallInfo {
    CallInfo {
        cid: CallCid::from(cid),
        local_user_id: UserId::from("local-user"),
        sfu_url: "wss://sfu.test/ws".to_string(),
        sfu_token: "token".to_string(),
        ice_servers: vec![IceServer {
            urls: vec!["stun:stun.test:3478".to_string()],
            username: String::new(),
            credential: String::new(),
        }],
        own_capabilities: vec![OwnCapability::SendAudio, OwnCapability::SendVideo],
    }
}

pub fn participant(session: &str, tracks: &[TrackType]) -> ParticipantInfo {
    ParticipantInfo {
        user_id: UserId::from(format!("user-{session}")),
        session_id: SessionId::from(session),
        name: session.to_string(),
        track_lookup_prefix: format!("prefix-{session}"),
        published_tracks: tracks.to_vec(),
        joined_at_ms: 1_700_000_000_000,
        is_speaking: false,
        is_dominant_speaker: false,
        audio_level: 0.0,
    }
}

fn codec(mime_type: &str, clock_rate: u32, channels: u16) -> CodecCapability {
    CodecCapability {
        mime_type: mime_type.to_string(),
        clock_rate,
        channels,
        sdp_fmtp_line: String::new(),
    }
}

/// Every call made on a [`FakePeerConnection`], in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PcCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddIceCandidate(String),
    RestartIce,
    AddTransceiver {
        kind: MediaKind,
        track_id: String,
        rids: Vec<String>,
    },
    ReplaceTrack {
        transceiver: TransceiverId,
        track_id: Option<String>,
    },
    RemoveTrack(TransceiverId),
    SetCodecPreferences {
        transceiver: TransceiverId,
        mime_types: Vec<String>,
    },
    Close,
}

/// Holds one fake operation until released
#[derive(Clone, Default)]
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Gate {
    async fn pass(slot: &Mutex<Option<Self>>) {
        let gate = slot.lock().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
    }

    fn arm(slot: &Mutex<Option<Self>>) -> Self {
        let gate = Self::default();
        *slot.lock() = Some(gate.clone());
        gate
    }
}

#[derive(Default)]
struct Gates {
    set_local: Mutex<Option<Gate>>,
    set_remote: Mutex<Option<Gate>>,
    add_candidate: Mutex<Option<Gate>>,
}

struct FakeState {
    calls: Vec<PcCall>,
    applied: Vec<String>,
    rejected: HashSet<String>,
    transceivers: Vec<(TransceiverInfo, Option<LocalTrackSpec>)>,
    audio_codecs: Vec<CodecCapability>,
    video_codecs: Vec<CodecCapability>,
    signaling: SignalingState,
    offers: u32,
}

pub struct FakePeerConnection {
    role: PeerType,
    state: Mutex<FakeState>,
    gates: Gates,
    events: Option<mpsc::UnboundedSender<PeerConnectionEvent>>,
}

impl FakePeerConnection {
    pub fn new(role: PeerType) -> Self {
        Self::build(role, None)
    }

    pub fn with_events(role: PeerType, events: mpsc::UnboundedSender<PeerConnectionEvent>) -> Self {
        Self::build(role, Some(events))
    }

    fn build(role: PeerType, events: Option<mpsc::UnboundedSender<PeerConnectionEvent>>) -> Self {
        Self {
            role,
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                applied: Vec::new(),
                rejected: HashSet::new(),
                transceivers: Vec::new(),
                audio_codecs: vec![codec("audio/opus", 48_000, 2), codec("audio/red", 48_000, 2)],
                video_codecs: vec![codec("video/H264", 90_000, 0), codec("video/VP8", 90_000, 0)],
                signaling: SignalingState::Stable,
                offers: 0,
            }),
            gates: Gates::default(),
            events,
        }
    }

    pub const fn role(&self) -> PeerType {
        self.role
    }

    pub fn calls(&self) -> Vec<PcCall> {
        self.state.lock().calls.clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied.clone()
    }

    /// Make `add_ice_candidate` fail for this candidate string
    pub fn reject_candidate(&self, candidate: &str) {
        self.state.lock().rejected.insert(candidate.to_string());
    }

    pub fn gate_set_remote(&self) -> Gate {
        Gate::arm(&self.gates.set_remote)
    }

    pub fn gate_set_local(&self) -> Gate {
        Gate::arm(&self.gates.set_local)
    }

    /// Hold the next `add_ice_candidate` after it is recorded
    pub fn gate_add_candidate(&self) -> Gate {
        Gate::arm(&self.gates.add_candidate)
    }

    pub fn transceiver_count(&self) -> usize {
        self.state.lock().transceivers.len()
    }

    pub fn set_video_codecs(&self, mime_types: &[&str]) {
        self.state.lock().video_codecs = mime_types
            .iter()
            .map(|mime| codec(mime, 90_000, 0))
            .collect();
    }

    /// Give every transceiver its index as mid, as negotiation would
    pub fn assign_mids(&self) {
        for (info, _) in &mut self.state.lock().transceivers {
            info.mid = Some(info.id.to_string());
        }
    }

    pub fn clear_mid(&self, transceiver: TransceiverId) {
        if let Some((info, _)) = self.state.lock().transceivers.get_mut(transceiver) {
            info.mid = None;
        }
    }

    /// Fire a callback as the engine would
    pub fn emit(&self, event: PeerConnectionEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub fn emit_track(&self, stream_id: &str, kind: MediaKind) {
        self.emit(PeerConnectionEvent::Track {
            role: self.role,
            track: RemoteTrack {
                track_id: format!("remote-{stream_id}"),
                stream_id: stream_id.to_string(),
                kind,
                remote: None,
            },
        });
    }

    fn record(&self, call: PcCall) {
        self.state.lock().calls.push(call);
    }

    fn offer_sdp(state: &FakeState) -> String {
        let mut sdp = format!(
            "v=0\r\no=- 4611731400430051336 {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            state.offers
        );
        sdp.push_str("m=audio 9 UDP/TLS/RTP/SAVPF 111 63\r\n");
        sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
        sdp.push_str("a=fmtp:111 minptime=10;useinbandfec=1\r\n");
        sdp.push_str("a=rtpmap:63 red/48000/2\r\n");
        for (_, track) in &state.transceivers {
            if let Some(track) = track {
                sdp.push_str(&format!("a=msid:{} {}\r\n", track.stream_id, track.track_id));
            }
        }
        sdp
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.calls.push(PcCall::CreateOffer { ice_restart });
        state.offers += 1;
        Ok(SessionDescription::offer(Self::offer_sdp(&state)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(PcCall::CreateAnswer);
        Ok(SessionDescription::answer("v=0\r\ns=answer\r\n"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(PcCall::SetLocal(desc.sdp_type));
        Gate::pass(&self.gates.set_local).await;

        let mut state = self.state.lock();
        state.signaling = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveLocalOffer,
            SdpType::Answer => SignalingState::Stable,
        };
        for (info, _) in &mut state.transceivers {
            if info.mid.is_none() {
                info.mid = Some(info.id.to_string());
            }
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.record(PcCall::SetRemote(desc.sdp_type));
        Gate::pass(&self.gates.set_remote).await;

        self.state.lock().signaling = match desc.sdp_type {
            SdpType::Offer => SignalingState::HaveRemoteOffer,
            SdpType::Answer => SignalingState::Stable,
        };
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.record(PcCall::AddIceCandidate(candidate.candidate.clone()));
        Gate::pass(&self.gates.add_candidate).await;

        let mut state = self.state.lock();
        if state.rejected.contains(&candidate.candidate) {
            return Err(Error::Negotiation(format!(
                "candidate rejected: {}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate.candidate);
        Ok(())
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn restart_ice(&self) -> Result<()> {
        self.record(PcCall::RestartIce);
        Ok(())
    }

    async fn add_send_transceiver(
        &self,
        track: LocalTrackSpec,
        encodings: &[SendEncoding],
    ) -> Result<TransceiverId> {
        let id = {
            let mut state = self.state.lock();
            state.calls.push(PcCall::AddTransceiver {
                kind: track.kind,
                track_id: track.track_id.clone(),
                rids: encodings.iter().map(|e| e.rid.clone()).collect(),
            });
            let id = state.transceivers.len();
            state.transceivers.push((
                TransceiverInfo {
                    id,
                    kind: track.kind,
                    mid: None,
                    track_id: Some(track.track_id.clone()),
                },
                Some(track),
            ));
            id
        };
        self.emit(PeerConnectionEvent::NegotiationNeeded { role: self.role });
        Ok(id)
    }

    async fn replace_sender_track(
        &self,
        transceiver: TransceiverId,
        track: Option<LocalTrackSpec>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(PcCall::ReplaceTrack {
            transceiver,
            track_id: track.as_ref().map(|t| t.track_id.clone()),
        });
        let Some((info, slot)) = state.transceivers.get_mut(transceiver) else {
            return Err(Error::InvalidState(format!("unknown transceiver {transceiver}")));
        };
        info.track_id = track.as_ref().map(|t| t.track_id.clone());
        *slot = track;
        Ok(())
    }

    async fn remove_sender_track(&self, transceiver: TransceiverId) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(PcCall::RemoveTrack(transceiver));
        if let Some((info, slot)) = state.transceivers.get_mut(transceiver) {
            info.track_id = None;
            *slot = None;
        }
        Ok(())
    }

    async fn set_codec_preferences(
        &self,
        transceiver: TransceiverId,
        codecs: Vec<CodecCapability>,
    ) -> Result<()> {
        self.record(PcCall::SetCodecPreferences {
            transceiver,
            mime_types: codecs.into_iter().map(|c| c.mime_type).collect(),
        });
        Ok(())
    }

    fn codec_capabilities(&self, kind: MediaKind) -> Vec<CodecCapability> {
        let state = self.state.lock();
        match kind {
            MediaKind::Audio => state.audio_codecs.clone(),
            MediaKind::Video => state.video_codecs.clone(),
        }
    }

    async fn transceivers(&self) -> Vec<TransceiverInfo> {
        self.state
            .lock()
            .transceivers
            .iter()
            .map(|(info, _)| info.clone())
            .collect()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(PcCall::Close);
        state.signaling = SignalingState::Closed;
        Ok(())
    }
}

/// Hands out [`FakePeerConnection`]s and keeps them for inspection
#[derive(Default)]
pub struct FakeFactory {
    created: Mutex<Vec<Arc<FakePeerConnection>>>,
    create_gates: Mutex<Vec<(PeerType, Gate)>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self, role: PeerType) -> Vec<Arc<FakePeerConnection>> {
        self.created
            .lock()
            .iter()
            .filter(|pc| pc.role() == role)
            .cloned()
            .collect()
    }

    pub fn last(&self, role: PeerType) -> Option<Arc<FakePeerConnection>> {
        self.connections(role).pop()
    }

    /// Hold the next `create` for `role` until released
    pub fn gate_create(&self, role: PeerType) -> Gate {
        let gate = Gate::default();
        self.create_gates.lock().push((role, gate.clone()));
        gate
    }
}

#[async_trait]
impl PeerConnectionFactory for FakeFactory {
    async fn create(
        &self,
        role: PeerType,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let gate = {
            let mut gates = self.create_gates.lock();
            gates
                .iter()
                .position(|(r, _)| *r == role)
                .map(|at| gates.remove(at).1)
        };
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let pc = Arc::new(FakePeerConnection::with_events(role, events));
        self.created.lock().push(pc.clone());
        Ok(pc)
    }
}

/// Every request sent through [`FakeSignaling`], in order
#[derive(Debug, Clone, PartialEq)]
pub enum SignalCall {
    Connect(JoinRequest),
    SetPublisher(SetPublisherRequest),
    SendAnswer(SendAnswerRequest),
    UpdateSubscriptions(UpdateSubscriptionsRequest),
    IceTrickle(IceTrickle),
    UpdateMuteStates(UpdateMuteStatesRequest),
    IceRestart(IceRestartRequest),
    Leave(LeaveCallRequest),
    Disconnect,
}

/// SFU stand-in: records requests and lets tests push events
#[derive(Default)]
pub struct FakeSignaling {
    calls: Mutex<Vec<SignalCall>>,
    events: Mutex<Option<mpsc::UnboundedSender<SfuEvent>>>,
    auto_join: Mutex<Option<CallState>>,
    join_error: Mutex<Option<SfuError>>,
    publisher_answer: Mutex<Option<String>>,
    fail_ice_restart: Mutex<bool>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every connect with a `JoinResponse` carrying `call_state`
    pub fn auto_join(call_state: CallState) -> Self {
        let signaling = Self::default();
        *signaling.auto_join.lock() = Some(call_state);
        signaling
    }

    /// Answer later connects with a `JoinResponse` carrying `call_state`
    pub fn join_with(&self, call_state: CallState) {
        *self.auto_join.lock() = Some(call_state);
    }

    /// Answer the next connect with an SFU error instead of a join
    pub fn reject_join(&self, error: SfuError) {
        *self.join_error.lock() = Some(error);
    }

    /// Replace the SDP returned by `set_publisher`
    pub fn set_publisher_answer(&self, sdp: &str) {
        *self.publisher_answer.lock() = Some(sdp.to_string());
    }

    pub fn fail_ice_restart(&self) {
        *self.fail_ice_restart.lock() = true;
    }

    /// Deliver a push event on the current channel
    pub fn push(&self, event: SfuEvent) {
        if let Some(tx) = self.events.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn calls(&self) -> Vec<SignalCall> {
        self.calls.lock().clone()
    }

    pub fn subscription_updates(&self) -> Vec<UpdateSubscriptionsRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SignalCall::UpdateSubscriptions(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn trickles(&self) -> Vec<IceTrickle> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SignalCall::IceTrickle(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn answers(&self) -> Vec<SendAnswerRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SignalCall::SendAnswer(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    pub fn publisher_requests(&self) -> Vec<SetPublisherRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SignalCall::SetPublisher(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn mute_updates(&self) -> Vec<UpdateMuteStatesRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                SignalCall::UpdateMuteStates(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: SignalCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl crate::signaling::SfuSignaling for FakeSignaling {
    async fn connect(&self, request: JoinRequest) -> Result<mpsc::UnboundedReceiver<SfuEvent>> {
        self.record(SignalCall::Connect(request));
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(error) = self.join_error.lock().take() {
            let _ = tx.send(SfuEvent::Error(error));
        } else if let Some(call_state) = self.auto_join.lock().clone() {
            let _ = tx.send(SfuEvent::JoinResponse(vidcall_proto::events::JoinResponse {
                call_state,
            }));
        }
        *self.events.lock() = Some(tx);
        Ok(rx)
    }

    async fn set_publisher(&self, request: SetPublisherRequest) -> Result<SetPublisherResponse> {
        self.record(SignalCall::SetPublisher(request));
        let answer = self.publisher_answer.lock().clone();
        Ok(SetPublisherResponse {
            sdp: answer.unwrap_or_else(|| "v=0\r\ns=publisher-answer\r\n".to_string()),
            ice_restart: false,
        })
    }

    async fn send_answer(&self, request: SendAnswerRequest) -> Result<()> {
        self.record(SignalCall::SendAnswer(request));
        Ok(())
    }

    async fn update_subscriptions(&self, request: UpdateSubscriptionsRequest) -> Result<()> {
        self.record(SignalCall::UpdateSubscriptions(request));
        Ok(())
    }

    async fn ice_trickle(&self, trickle: IceTrickle) -> Result<()> {
        self.record(SignalCall::IceTrickle(trickle));
        Ok(())
    }

    async fn update_mute_states(&self, request: UpdateMuteStatesRequest) -> Result<()> {
        self.record(SignalCall::UpdateMuteStates(request));
        Ok(())
    }

    async fn ice_restart(&self, request: IceRestartRequest) -> Result<()> {
        self.record(SignalCall::IceRestart(request));
        if *self.fail_ice_restart.lock() {
            return Err(Error::Signaling("ice restart rejected".to_string()));
        }
        Ok(())
    }

    async fn leave(&self, request: LeaveCallRequest) -> Result<()> {
        self.record(SignalCall::Leave(request));
        Ok(())
    }

    async fn disconnect(&self) {
        self.record(SignalCall::Disconnect);
        *self.events.lock() = None;
    }
}
