//! RPC requests sent to the SFU and their responses

use crate::ids::SessionId;
use crate::models::{PeerType, TrackInfo, TrackMuteState, TrackSubscriptionDetails};
use serde::{Deserialize, Serialize};

/// Opens the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub session_id: SessionId,
    /// Offer generated by the subscriber, used by the SFU to size its answer
    pub subscriber_sdp: String,
    pub sfu_url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPublisherRequest {
    pub sdp: String,
    pub session_id: SessionId,
    pub tracks: Vec<TrackInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPublisherResponse {
    pub sdp: String,
    #[serde(default)]
    pub ice_restart: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendAnswerRequest {
    pub peer_type: PeerType,
    pub sdp: String,
    pub session_id: SessionId,
}

/// Always the complete desired set; the SFU drops anything not listed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSubscriptionsRequest {
    pub session_id: SessionId,
    pub tracks: Vec<TrackSubscriptionDetails>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMuteStatesRequest {
    pub session_id: SessionId,
    pub mute_states: Vec<TrackMuteState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceRestartRequest {
    pub session_id: SessionId,
    pub peer_type: PeerType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveCallRequest {
    pub session_id: SessionId,
    #[serde(default)]
    pub reason: String,
}
