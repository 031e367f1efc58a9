//! Participant roster and derived UI views
//!
//! Holds every participant the SFU reported for the active session, keyed by
//! session id, plus:
//! - Local pins (most recent first) and server pins (replaced per broadcast)
//! - The effective pinned view: server pins, then local pins
//! - A sorted view: pinned, screen sharing, dominant speaker, video on,
//!   audio on, earliest joined
//! - Current and previous dominant speaker
//!
//! Only the orchestrator writes to this state.

use crate::peer::RemoteTrack;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use vidcall_proto::models::{CallState, ParticipantInfo, Pin};
use vidcall_proto::{SessionId, TrackType, UserId};

/// One call member as seen by this client
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub name: String,
    /// Prefix of the stream ids the SFU uses for this participant's tracks
    pub track_lookup_prefix: String,
    pub joined_at: DateTime<Utc>,
    pub is_local: bool,
    pub is_speaking: bool,
    pub is_dominant_speaker: bool,
    pub is_pinned: bool,
    published: BTreeSet<TrackType>,
    tracks: BTreeMap<TrackType, RemoteTrack>,
}

impl Participant {
    fn from_info(info: &ParticipantInfo, is_local: bool) -> Self {
        Self {
            user_id: info.user_id.clone(),
            session_id: info.session_id.clone(),
            name: info.name.clone(),
            track_lookup_prefix: info.track_lookup_prefix.clone(),
            joined_at: DateTime::from_timestamp_millis(info.joined_at_ms).unwrap_or_default(),
            is_local,
            is_speaking: info.is_speaking,
            is_dominant_speaker: false,
            is_pinned: false,
            published: info.published_tracks.iter().copied().collect(),
            tracks: BTreeMap::new(),
        }
    }

    /// Refresh server-owned fields, keeping attached tracks and view flags.
    /// The dominant speaker flag follows
    /// [`ParticipantSessionState::set_dominant_speaker`] only.
    fn apply_info(&mut self, info: &ParticipantInfo) {
        self.user_id = info.user_id.clone();
        self.name = info.name.clone();
        self.track_lookup_prefix = info.track_lookup_prefix.clone();
        self.is_speaking = info.is_speaking;
        self.published = info.published_tracks.iter().copied().collect();
    }

    #[must_use]
    pub fn is_track_enabled(&self, track_type: TrackType) -> bool {
        self.published.contains(&track_type)
    }

    #[must_use]
    pub fn is_audio_enabled(&self) -> bool {
        self.is_track_enabled(TrackType::Audio)
    }

    #[must_use]
    pub fn is_video_enabled(&self) -> bool {
        self.is_track_enabled(TrackType::Video)
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.is_track_enabled(TrackType::ScreenShare)
    }

    pub fn published_tracks(&self) -> impl Iterator<Item = TrackType> + '_ {
        self.published.iter().copied()
    }

    #[must_use]
    pub fn track(&self, track_type: TrackType) -> Option<&RemoteTrack> {
        self.tracks.get(&track_type)
    }
}

/// Sort order used for the participant grid
fn compare_participants(a: &Participant, b: &Participant) -> Ordering {
    // `true` first for every flag
    b.is_pinned
        .cmp(&a.is_pinned)
        .then_with(|| b.is_screen_sharing().cmp(&a.is_screen_sharing()))
        .then_with(|| b.is_dominant_speaker.cmp(&a.is_dominant_speaker))
        .then_with(|| b.is_video_enabled().cmp(&a.is_video_enabled()))
        .then_with(|| b.is_audio_enabled().cmp(&a.is_audio_enabled()))
        .then_with(|| a.joined_at.cmp(&b.joined_at))
}

/// Which derived views changed during a [`ParticipantSessionState::recompute`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewChanges {
    pub pinned: bool,
    pub sorted: bool,
}

/// Current and previous dominant speaker after a change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DominantSpeakerChange {
    pub current: Option<SessionId>,
    pub previous: Option<SessionId>,
}

#[derive(Debug, Default)]
pub struct ParticipantSessionState {
    local_session_id: Option<SessionId>,
    roster: IndexMap<SessionId, Participant>,
    local_pins: VecDeque<SessionId>,
    server_pins: Vec<SessionId>,
    dominant_speaker: Option<SessionId>,
    previous_dominant_speaker: Option<SessionId>,
    pinned_view: Vec<SessionId>,
    sorted_view: Vec<SessionId>,
}

impl ParticipantSessionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and remember which session id is ours
    pub fn reset(&mut self, local_session_id: Option<SessionId>) {
        *self = Self {
            local_session_id,
            ..Self::default()
        };
    }

    #[must_use]
    pub const fn local_session_id(&self) -> Option<&SessionId> {
        self.local_session_id.as_ref()
    }

    #[must_use]
    pub fn is_local(&self, session_id: &SessionId) -> bool {
        self.local_session_id.as_ref() == Some(session_id)
    }

    /// Replace the roster and server pins with a join snapshot. Local pins
    /// survive when the pinned participant is still present.
    ///
    /// A participant flagged as dominant speaker in the snapshot becomes the
    /// dominant speaker; the change is returned.
    pub fn load_snapshot(&mut self, call_state: &CallState) -> Option<DominantSpeakerChange> {
        self.roster.clear();
        for info in &call_state.participants {
            self.upsert(info);
        }
        self.local_pins.retain(|id| self.roster.contains_key(id));
        self.set_server_pins(&call_state.pins);

        if self
            .dominant_speaker
            .as_ref()
            .is_some_and(|id| !self.roster.contains_key(id))
        {
            self.previous_dominant_speaker = self.dominant_speaker.take();
        }
        let change = call_state
            .participants
            .iter()
            .find(|info| info.is_dominant_speaker)
            .and_then(|info| self.set_dominant_speaker(&info.session_id));
        self.refresh_dominant_flags();
        change
    }

    /// Insert or refresh a participant. Returns `true` when it was new.
    pub fn upsert(&mut self, info: &ParticipantInfo) -> bool {
        if let Some(existing) = self.roster.get_mut(&info.session_id) {
            existing.apply_info(info);
            return false;
        }

        let is_local = self.is_local(&info.session_id);
        self.roster
            .insert(info.session_id.clone(), Participant::from_info(info, is_local));
        true
    }

    /// Remove a participant along with its pins
    pub fn remove(&mut self, session_id: &SessionId) -> Option<Participant> {
        let removed = self.roster.shift_remove(session_id)?;
        self.local_pins.retain(|id| id != session_id);
        self.server_pins.retain(|id| id != session_id);
        if self.dominant_speaker.as_ref() == Some(session_id) {
            self.previous_dominant_speaker = self.dominant_speaker.take();
        }
        Some(removed)
    }

    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<&Participant> {
        self.roster.get(session_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values()
    }

    pub fn remote(&self) -> impl Iterator<Item = &Participant> {
        self.roster.values().filter(|p| !p.is_local)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roster.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    /// Participant whose stream ids start with `prefix`
    #[must_use]
    pub fn find_by_track_prefix(&self, prefix: &str) -> Option<&Participant> {
        self.roster
            .values()
            .find(|p| p.track_lookup_prefix == prefix)
    }

    /// Set the published flag of one track. Returns `true` when the flag
    /// changed; unknown participants are ignored.
    pub fn set_track_enabled(
        &mut self,
        session_id: &SessionId,
        track_type: TrackType,
        enabled: bool,
    ) -> bool {
        let Some(participant) = self.roster.get_mut(session_id) else {
            return false;
        };

        if enabled {
            participant.published.insert(track_type)
        } else {
            participant.tracks.remove(&track_type);
            participant.published.remove(&track_type)
        }
    }

    /// Bind a received media track. Returns `false` for unknown participants.
    pub fn attach_track(
        &mut self,
        session_id: &SessionId,
        track_type: TrackType,
        track: RemoteTrack,
    ) -> bool {
        match self.roster.get_mut(session_id) {
            Some(participant) => {
                participant.tracks.insert(track_type, track);
                true
            }
            None => false,
        }
    }

    /// Pin on this client only; re-pinning moves the participant to the front
    pub fn pin_locally(&mut self, session_id: SessionId) {
        self.local_pins.retain(|id| *id != session_id);
        self.local_pins.push_front(session_id);
    }

    pub fn unpin_locally(&mut self, session_id: &SessionId) -> bool {
        let before = self.local_pins.len();
        self.local_pins.retain(|id| id != session_id);
        before != self.local_pins.len()
    }

    pub fn set_server_pins(&mut self, pins: &[Pin]) {
        self.server_pins = pins.iter().map(|p| p.session_id.clone()).collect();
    }

    #[must_use]
    pub fn is_pinned_locally(&self, session_id: &SessionId) -> bool {
        self.local_pins.contains(session_id)
    }

    #[must_use]
    pub fn is_pinned_remotely(&self, session_id: &SessionId) -> bool {
        self.server_pins.contains(session_id)
    }

    /// Returns the change when `session_id` differs from the current speaker
    pub fn set_dominant_speaker(&mut self, session_id: &SessionId) -> Option<DominantSpeakerChange> {
        let current = self
            .roster
            .contains_key(session_id)
            .then(|| session_id.clone());

        if current == self.dominant_speaker {
            return None;
        }

        self.previous_dominant_speaker = std::mem::replace(&mut self.dominant_speaker, current);
        self.refresh_dominant_flags();

        Some(DominantSpeakerChange {
            current: self.dominant_speaker.clone(),
            previous: self.previous_dominant_speaker.clone(),
        })
    }

    fn refresh_dominant_flags(&mut self) {
        for participant in self.roster.values_mut() {
            participant.is_dominant_speaker =
                self.dominant_speaker.as_ref() == Some(&participant.session_id);
        }
    }

    #[must_use]
    pub const fn dominant_speaker(&self) -> Option<&SessionId> {
        self.dominant_speaker.as_ref()
    }

    #[must_use]
    pub const fn previous_dominant_speaker(&self) -> Option<&SessionId> {
        self.previous_dominant_speaker.as_ref()
    }

    /// Effective pinned view as of the last [`recompute`](Self::recompute)
    #[must_use]
    pub fn pinned(&self) -> &[SessionId] {
        &self.pinned_view
    }

    /// Sorted view as of the last [`recompute`](Self::recompute)
    #[must_use]
    pub fn sorted(&self) -> &[SessionId] {
        &self.sorted_view
    }

    /// Rebuild the pinned and sorted views and report which of them changed
    pub fn recompute(&mut self) -> ViewChanges {
        let mut pinned: Vec<SessionId> = Vec::with_capacity(self.server_pins.len() + self.local_pins.len());
        for id in self.server_pins.iter().chain(self.local_pins.iter()) {
            if self.roster.contains_key(id) && !pinned.contains(id) {
                pinned.push(id.clone());
            }
        }

        for participant in self.roster.values_mut() {
            participant.is_pinned = pinned.contains(&participant.session_id);
        }

        let mut ordered: Vec<&Participant> = self.roster.values().collect();
        ordered.sort_by(|a, b| compare_participants(a, b));
        let sorted: Vec<SessionId> = ordered.into_iter().map(|p| p.session_id.clone()).collect();

        let changes = ViewChanges {
            pinned: pinned != self.pinned_view,
            sorted: sorted != self.sorted_view,
        };
        self.pinned_view = pinned;
        self.sorted_view = sorted;
        changes
    }
}
