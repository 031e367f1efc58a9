//! Debounced track subscription updates
//!
//! Roster and resolution changes only mark the subscription set dirty. The
//! orchestrator's pump asks [`TrackSubscriptionCoordinator::try_begin`] on
//! every tick whether an update may go out, and always sends the complete
//! desired set built by [`desired_subscriptions`].

use crate::participants::ParticipantSessionState;
use crate::types::VideoResolution;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use vidcall_proto::models::TrackSubscriptionDetails;
use vidcall_proto::{SessionId, TrackType};

/// Dirty flag, single-flight guard and debounce window for subscription RPCs
#[derive(Debug)]
pub struct TrackSubscriptionCoordinator {
    debounce: Duration,
    /// Set by `request`, cleared when an update starts
    dirty_since: Option<Instant>,
    in_progress: bool,
    last_sent: Option<Instant>,
}

impl TrackSubscriptionCoordinator {
    #[must_use]
    pub const fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            dirty_since: None,
            in_progress: false,
            last_sent: None,
        }
    }

    /// Mark the desired set as changed. Repeated calls keep the first
    /// timestamp so a steady stream of changes cannot postpone the update.
    pub fn request(&mut self, now: Instant) {
        if self.dirty_since.is_none() {
            self.dirty_since = Some(now);
        }
    }

    #[must_use]
    pub const fn is_requested(&self) -> bool {
        self.dirty_since.is_some()
    }

    #[must_use]
    pub const fn is_in_progress(&self) -> bool {
        self.in_progress
    }

    /// Returns `true` when an update should be sent now. The caller must
    /// call [`complete`](Self::complete) once the RPC finishes.
    pub fn try_begin(&mut self, now: Instant) -> bool {
        let Some(dirty_since) = self.dirty_since else {
            return false;
        };
        if self.in_progress || now.duration_since(dirty_since) < self.debounce {
            return false;
        }
        if let Some(last_sent) = self.last_sent {
            if now.duration_since(last_sent) < self.debounce {
                return false;
            }
        }

        self.dirty_since = None;
        self.in_progress = true;
        self.last_sent = Some(now);
        true
    }

    /// Finish the in-flight update. Requests made meanwhile stay pending.
    pub fn complete(&mut self) {
        self.in_progress = false;
    }

    pub fn reset(&mut self) {
        self.dirty_since = None;
        self.in_progress = false;
        self.last_sent = None;
    }
}

/// Full subscription set for every remote participant
///
/// Audio and video are always requested; screen share tracks only while the
/// participant publishes them. Video-bearing tracks carry the requested size:
/// the per-participant override, or `default_resolution`.
#[must_use]
pub fn desired_subscriptions(
    participants: &ParticipantSessionState,
    overrides: &HashMap<SessionId, VideoResolution>,
    default_resolution: VideoResolution,
) -> Vec<TrackSubscriptionDetails> {
    let mut tracks = Vec::new();

    for participant in participants.remote() {
        let resolution = overrides
            .get(&participant.session_id)
            .copied()
            .unwrap_or(default_resolution);

        for track_type in TrackType::ALL {
            let always = matches!(track_type, TrackType::Audio | TrackType::Video);
            if !always && !participant.is_track_enabled(track_type) {
                continue;
            }

            tracks.push(TrackSubscriptionDetails {
                user_id: participant.user_id.clone(),
                session_id: participant.session_id.clone(),
                track_type,
                dimension: track_type.is_video().then(|| resolution.into()),
            });
        }
    }

    tracks
}

#[cfg(test)]
mod tests {
    use super::*;
    use vidcall_proto::models::ParticipantInfo;
    use vidcall_proto::{UserId, VideoDimension};

    const DEBOUNCE: Duration = Duration::from_millis(100);

    fn info(session: &str, tracks: &[TrackType]) -> ParticipantInfo {
        ParticipantInfo {
            user_id: UserId::from(format!("user-{session}")),
            session_id: SessionId::from(session),
            name: String::new(),
            track_lookup_prefix: format!("prefix-{session}"),
            published_tracks: tracks.to_vec(),
            joined_at_ms: 0,
            is_speaking: false,
            is_dominant_speaker: false,
            audio_level: 0.0,
        }
    }

    #[test]
    fn test_burst_inside_window_fires_once() {
        let start = Instant::now();
        let mut coordinator = TrackSubscriptionCoordinator::new(DEBOUNCE);

        for i in 0..10 {
            coordinator.request(start + Duration::from_millis(i * 5));
            assert!(!coordinator.try_begin(start + Duration::from_millis(i * 5)));
        }

        assert!(coordinator.try_begin(start + DEBOUNCE));
        assert!(!coordinator.is_requested());
        assert!(!coordinator.try_begin(start + DEBOUNCE * 5));
    }

    #[test]
    fn test_request_during_flight_is_sent_after_completion() {
        let start = Instant::now();
        let mut coordinator = TrackSubscriptionCoordinator::new(DEBOUNCE);

        coordinator.request(start);
        assert!(coordinator.try_begin(start + DEBOUNCE));

        coordinator.request(start + DEBOUNCE * 2);
        // Single flight
        assert!(!coordinator.try_begin(start + DEBOUNCE * 4));

        coordinator.complete();
        assert!(coordinator.is_requested());
        assert!(coordinator.try_begin(start + DEBOUNCE * 4));
    }

    #[test]
    fn test_spacing_from_previous_send() {
        let start = Instant::now();
        let mut coordinator = TrackSubscriptionCoordinator::new(DEBOUNCE);

        coordinator.request(start);
        assert!(coordinator.try_begin(start + DEBOUNCE));
        coordinator.complete();

        // Dirty long enough, but the previous send was too recent
        coordinator.request(start + DEBOUNCE);
        assert!(!coordinator.try_begin(start + DEBOUNCE + DEBOUNCE / 2));
        assert!(coordinator.try_begin(start + DEBOUNCE * 2));
    }

    #[test]
    fn test_reset_drops_pending_request() {
        let start = Instant::now();
        let mut coordinator = TrackSubscriptionCoordinator::new(DEBOUNCE);
        coordinator.request(start);
        coordinator.reset();
        assert!(!coordinator.try_begin(start + DEBOUNCE * 10));
    }

    #[test]
    fn test_desired_set_excludes_local_and_sizes_video() {
        let mut participants = ParticipantSessionState::new();
        participants.reset(Some(SessionId::from("me")));
        participants.upsert(&info("me", &[TrackType::Audio, TrackType::Video]));
        participants.upsert(&info("a", &[]));
        participants.upsert(&info("b", &[TrackType::ScreenShare]));

        let mut overrides = HashMap::new();
        overrides.insert(SessionId::from("b"), VideoResolution::new(320, 240));

        let set = desired_subscriptions(&participants, &overrides, VideoResolution::new(1280, 720));

        assert!(set.iter().all(|t| t.session_id.as_str() != "me"));
        let summary: Vec<_> = set
            .iter()
            .map(|t| (t.session_id.as_str(), t.track_type, t.dimension))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a", TrackType::Audio, None),
                ("a", TrackType::Video, Some(VideoDimension::new(1280, 720))),
                ("b", TrackType::Audio, None),
                ("b", TrackType::Video, Some(VideoDimension::new(320, 240))),
                ("b", TrackType::ScreenShare, Some(VideoDimension::new(320, 240))),
            ]
        );
    }
}
