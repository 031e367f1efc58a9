//! Payloads shared by events and RPC calls

use crate::ids::{SessionId, TrackId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two peer connections a message refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerType {
    /// Sends local media to the SFU
    Publisher,
    /// Receives forwarded media from the SFU
    Subscriber,
}

impl fmt::Display for PeerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Kind of media track a participant can publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    Audio,
    Video,
    ScreenShare,
    ScreenShareAudio,
}

impl TrackType {
    pub const ALL: [Self; 4] = [
        Self::Audio,
        Self::Video,
        Self::ScreenShare,
        Self::ScreenShareAudio,
    ];

    /// Name used by the SFU inside remote stream ids (`<prefix>:TRACK_TYPE_VIDEO`)
    #[must_use]
    pub const fn stream_key(&self) -> &'static str {
        match self {
            Self::Audio => "TRACK_TYPE_AUDIO",
            Self::Video => "TRACK_TYPE_VIDEO",
            Self::ScreenShare => "TRACK_TYPE_SCREEN_SHARE",
            Self::ScreenShareAudio => "TRACK_TYPE_SCREEN_SHARE_AUDIO",
        }
    }

    /// Parse a stream key, ignoring ASCII case
    #[must_use]
    pub fn from_stream_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.stream_key().eq_ignore_ascii_case(key))
    }

    /// Whether the track carries pictures, so a requested dimension applies
    #[must_use]
    pub const fn is_video(&self) -> bool {
        matches!(self, Self::Video | Self::ScreenShare)
    }
}

/// Width x height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoDimension {
    pub width: u32,
    pub height: u32,
}

impl VideoDimension {
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for VideoDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Simulcast quality of one published layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoQuality {
    LowUnspecified,
    Mid,
    High,
}

/// One simulcast layer announced to the SFU in `SetPublisher`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    pub rid: String,
    pub video_dimension: VideoDimension,
    pub bitrate: u32,
    pub fps: u32,
    pub quality: VideoQuality,
}

/// A track the publisher is about to send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub track_id: TrackId,
    pub track_type: TrackType,
    pub mid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub layers: Vec<VideoLayer>,
}

/// One entry of the desired subscription set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSubscriptionDetails {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub track_type: TrackType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<VideoDimension>,
}

/// Participant snapshot as the SFU reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub session_id: SessionId,
    #[serde(default)]
    pub name: String,
    pub track_lookup_prefix: String,
    #[serde(default)]
    pub published_tracks: Vec<TrackType>,
    /// Unix epoch milliseconds
    #[serde(default)]
    pub joined_at_ms: i64,
    #[serde(default)]
    pub is_speaking: bool,
    #[serde(default)]
    pub is_dominant_speaker: bool,
    #[serde(default)]
    pub audio_level: f32,
}

/// Server-side pin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pin {
    pub user_id: UserId,
    pub session_id: SessionId,
}

/// Call snapshot delivered with the join confirmation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallState {
    #[serde(default)]
    pub participants: Vec<ParticipantInfo>,
    #[serde(default)]
    pub pins: Vec<Pin>,
}

/// Mute flag for one published track type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackMuteState {
    pub track_type: TrackType,
    pub muted: bool,
}
