//! Session-level types shared by the orchestrator and its collaborators

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use vidcall_proto::{CallCid, SessionId, TrackType, UserId, VideoDimension};

/// Video resolution in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoResolution {
    pub width: u32,
    pub height: u32,
}

impl VideoResolution {
    /// Smallest publish target that keeps the quarter simulcast layer above
    /// what hardware encoders accept (704x576 -> 352x288 -> 176x144)
    pub const MINIMUM_SAFE_TARGET: Self = Self::new(704, 576);

    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Scale both sides down by `factor`, truncating
    #[must_use]
    pub fn scaled_down(&self, factor: f64) -> Self {
        let factor = if factor > 0.0 { factor } else { 1.0 };
        Self {
            width: (f64::from(self.width) / factor) as u32,
            height: (f64::from(self.height) / factor) as u32,
        }
    }
}

impl From<VideoResolution> for VideoDimension {
    fn from(res: VideoResolution) -> Self {
        Self::new(res.width, res.height)
    }
}

impl fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Lifecycle state of the media session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallingState {
    Unknown,
    Idle,
    Ringing,
    Joining,
    Joined,
    Left,
    Reconnecting,
    Migrating,
    ReconnectingFailed,
    Offline,
}

impl CallingState {
    /// Whether a session exists that `stop` has to tear down
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Joining | Self::Joined | Self::Reconnecting | Self::Migrating
        )
    }
}

impl fmt::Display for CallingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Permission the coordinator granted to the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OwnCapability {
    SendAudio,
    SendVideo,
    Screenshare,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Call metadata the coordinator hands over at join time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInfo {
    pub cid: CallCid,
    pub local_user_id: UserId,
    pub sfu_url: String,
    pub sfu_token: String,
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub own_capabilities: Vec<OwnCapability>,
}

impl CallInfo {
    #[must_use]
    pub fn can_publish(&self) -> bool {
        self.own_capabilities
            .iter()
            .any(|c| matches!(c, OwnCapability::SendAudio | OwnCapability::SendVideo))
    }
}

/// Notification emitted to the host application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CallingStateChanged {
        from: CallingState,
        to: CallingState,
    },
    ParticipantJoined(SessionId),
    ParticipantLeft(SessionId),
    TrackAdded {
        session_id: SessionId,
        track_type: TrackType,
    },
    TrackEnabledChanged {
        session_id: SessionId,
        track_type: TrackType,
        enabled: bool,
    },
    PinnedParticipantsChanged(Vec<SessionId>),
    SortedParticipantsChanged(Vec<SessionId>),
    DominantSpeakerChanged {
        current: Option<SessionId>,
        previous: Option<SessionId>,
    },
    SfuError {
        code: i32,
        message: String,
        should_retry: bool,
    },
    GoAway {
        reason: String,
    },
    /// The host went longer than the grace window without pumping
    PumpStalled {
        elapsed: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scaled_down_truncates() {
        let res = VideoResolution::new(1280, 720);
        assert_eq!(res.scaled_down(4.0), VideoResolution::new(320, 180));
        assert_eq!(
            VideoResolution::new(1001, 501).scaled_down(2.0),
            VideoResolution::new(500, 250)
        );
        assert_eq!(res.scaled_down(0.0), res);
    }

    #[test]
    fn test_active_states() {
        assert!(CallingState::Joined.is_active());
        assert!(CallingState::Joining.is_active());
        assert!(!CallingState::Idle.is_active());
        assert!(!CallingState::Offline.is_active());
        assert!(!CallingState::ReconnectingFailed.is_active());
    }
}
