//! Events pushed by the SFU over the signaling channel

use crate::ids::{CallCid, SessionId, UserId};
use crate::models::{CallState, ParticipantInfo, PeerType, Pin, TrackType};
use serde::{Deserialize, Serialize};

/// Join confirmation carrying the initial call snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinResponse {
    #[serde(default)]
    pub call_state: CallState,
}

/// Renegotiation offer for the subscriber connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberOffer {
    #[serde(default)]
    pub ice_restart: bool,
    pub sdp: String,
}

/// Remote ICE candidate, serialized as JSON `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceTrickle {
    pub peer_type: PeerType,
    pub ice_candidate: String,
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPublished {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub track_type: TrackType,
    /// Full participant snapshot, sent by newer SFU versions
    #[serde(default)]
    pub participant: Option<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackUnpublished {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub track_type: TrackType,
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub participant: Option<ParticipantInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantJoined {
    #[serde(default)]
    pub call_cid: Option<CallCid>,
    pub participant: ParticipantInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantLeft {
    #[serde(default)]
    pub call_cid: Option<CallCid>,
    pub participant: ParticipantInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DominantSpeakerChanged {
    pub user_id: UserId,
    pub session_id: SessionId,
}

/// Full replacement of the server pin set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinsChanged {
    pub pins: Vec<Pin>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub should_retry: bool,
}

/// The SFU is shutting down and asks clients to migrate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoAway {
    #[serde(default)]
    pub reason: String,
}

/// Every event the SFU can push, in receipt order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SfuEvent {
    JoinResponse(JoinResponse),
    SubscriberOffer(SubscriberOffer),
    IceTrickle(IceTrickle),
    TrackPublished(TrackPublished),
    TrackUnpublished(TrackUnpublished),
    ParticipantJoined(ParticipantJoined),
    ParticipantLeft(ParticipantLeft),
    DominantSpeakerChanged(DominantSpeakerChanged),
    PinsChanged(PinsChanged),
    Error(SfuError),
    GoAway(GoAway),
    CallEnded,
}

impl SfuEvent {
    /// Short name for logging
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::JoinResponse(_) => "join_response",
            Self::SubscriberOffer(_) => "subscriber_offer",
            Self::IceTrickle(_) => "ice_trickle",
            Self::TrackPublished(_) => "track_published",
            Self::TrackUnpublished(_) => "track_unpublished",
            Self::ParticipantJoined(_) => "participant_joined",
            Self::ParticipantLeft(_) => "participant_left",
            Self::DominantSpeakerChanged(_) => "dominant_speaker_changed",
            Self::PinsChanged(_) => "pins_changed",
            Self::Error(_) => "error",
            Self::GoAway(_) => "go_away",
            Self::CallEnded => "call_ended",
        }
    }
}
