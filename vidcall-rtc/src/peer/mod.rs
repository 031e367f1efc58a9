//! Peer connections to the SFU
//!
//! A session keeps two independent connections:
//! - **Publisher**: send-only, owns the local audio/video tracks and their
//!   simulcast encodings
//! - **Subscriber**: receive-only, renegotiated by SFU offers
//!
//! [`PeerConnection`] is the generic primitive (implemented over `webrtc` by
//! [`engine::WebRtcEngine`]); [`PeerConnectionSession`] adds the ordering
//! rules on top of it. Primitive callbacks are delivered as
//! [`PeerConnectionEvent`]s on one typed channel per orchestrator.

pub mod engine;
pub mod publisher;
mod session;

pub use publisher::{Publisher, PublisherSettings};
pub use session::PeerConnectionSession;

use crate::error::Result;
use crate::types::IceServer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use vidcall_proto::PeerType;
use webrtc::track::track_remote::TrackRemote;

/// Index of a transceiver inside one peer connection
pub type TransceiverId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in its JSON `RTCIceCandidateInit` form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Codec as offered by the media engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    pub channels: u16,
    pub sdp_fmtp_line: String,
}

impl CodecCapability {
    /// `audio/red` matches `red`, case-insensitively
    #[must_use]
    pub fn matches(&self, codec: &str) -> bool {
        self.mime_type
            .rsplit('/')
            .next()
            .is_some_and(|name| name.eq_ignore_ascii_case(codec))
    }
}

/// Local track to be sent on a transceiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrackSpec {
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_id: String,
}

/// One simulcast encoding of a sender
#[derive(Debug, Clone, PartialEq)]
pub struct SendEncoding {
    pub rid: String,
    pub max_bitrate: u32,
    pub max_framerate: Option<u32>,
    pub scale_resolution_down_by: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub id: TransceiverId,
    pub kind: MediaKind,
    /// Unset until the transceiver has been negotiated
    pub mid: Option<String>,
    pub track_id: Option<String>,
}

/// Track received on the subscriber connection
#[derive(Clone)]
pub struct RemoteTrack {
    pub track_id: String,
    /// `<trackLookupPrefix>:<TRACK_TYPE_...>`
    pub stream_id: String,
    pub kind: MediaKind,
    /// Media handle, absent for connections that carry no RTP
    pub remote: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("track_id", &self.track_id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Callback fired by a peer connection
#[derive(Debug, Clone)]
pub enum PeerConnectionEvent {
    /// Locally gathered candidate, JSON encoded
    IceCandidate { role: PeerType, candidate: String },
    NegotiationNeeded { role: PeerType },
    Track { role: PeerType, track: RemoteTrack },
    ConnectionStateChanged {
        role: PeerType,
        state: PeerConnectionState,
    },
}

/// Generic peer-connection primitive
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()>;

    fn signaling_state(&self) -> SignalingState;

    /// Ask for renegotiation with fresh ICE credentials
    async fn restart_ice(&self) -> Result<()>;

    /// Add a send-only transceiver carrying `track`
    async fn add_send_transceiver(
        &self,
        track: LocalTrackSpec,
        encodings: &[SendEncoding],
    ) -> Result<TransceiverId>;

    /// Swap the sender's track without touching the transceiver. `None`
    /// leaves the sender idle.
    async fn replace_sender_track(
        &self,
        transceiver: TransceiverId,
        track: Option<LocalTrackSpec>,
    ) -> Result<()>;

    async fn remove_sender_track(&self, transceiver: TransceiverId) -> Result<()>;

    async fn set_codec_preferences(
        &self,
        transceiver: TransceiverId,
        codecs: Vec<CodecCapability>,
    ) -> Result<()>;

    fn codec_capabilities(&self, kind: MediaKind) -> Vec<CodecCapability>;

    async fn transceivers(&self) -> Vec<TransceiverInfo>;

    async fn close(&self) -> Result<()>;
}

/// Creates primitives wired to the orchestrator's event channel
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        role: PeerType,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerConnectionEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
