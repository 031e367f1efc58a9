//! Publisher negotiation and local media changes

use super::{log_failure, ActiveSession, MediaSessionOrchestrator, Pumped};
use crate::error::{Error, Result};
use crate::media::MediaInputState;
use crate::peer::{Publisher, SessionDescription};
use crate::sdp;
use std::sync::Arc;
use tracing::{debug, info};
use vidcall_proto::models::TrackMuteState;
use vidcall_proto::signal::{SetPublisherRequest, UpdateMuteStatesRequest};
use vidcall_proto::{PeerType, SessionId, TrackType};

impl MediaSessionOrchestrator {
    /// Run negotiation rounds until no trigger is left. Returns the outcome of
    /// the last round; a call while a round is running only schedules another.
    pub(super) async fn negotiate_publisher(
        &self,
        publisher: &Arc<Publisher>,
        session_id: &SessionId,
    ) -> Result<()> {
        let session = publisher.session();
        if !session.begin_negotiation() {
            return Ok(());
        }

        loop {
            let result = self.negotiation_round(publisher, session_id).await;
            if let Err(e) = &result {
                log_failure("negotiate publisher", PeerType::Publisher, e);
            }
            if !session.finish_negotiation() {
                return result;
            }
        }
    }

    async fn negotiation_round(&self, publisher: &Publisher, session_id: &SessionId) -> Result<()> {
        let session = publisher.session();
        let ice_restart = session.take_ice_restart();

        let offer = session.create_offer(ice_restart).await?;
        // RED is forced through codec preferences, only DTX is patched in
        let sdp = sdp::modify_sdp(&offer.sdp, false, self.config.audio.enable_dtx).into_owned();
        session
            .set_local_description(SessionDescription::offer(sdp.clone()))
            .await?;

        let tracks = publisher.track_infos(&sdp).await?;
        debug!(
            session_id = %session_id,
            ice_restart,
            tracks = tracks.len(),
            "Sending publisher offer"
        );
        let response = self
            .signaling
            .set_publisher(SetPublisherRequest {
                sdp,
                session_id: session_id.clone(),
                tracks,
            })
            .await?;
        session.ensure_live()?;
        if response.sdp.trim().is_empty() {
            return Err(Error::Negotiation(
                "SFU returned an empty publisher answer".to_string(),
            ));
        }

        session
            .set_remote_description(SessionDescription::answer(response.sdp))
            .await?;

        if response.ice_restart {
            info!(session_id = %session_id, "SFU requested a publisher ICE restart");
            session.restart_ice().await?;
            // Folded into the running round, replayed once it finishes
            session.begin_negotiation();
        }
        Ok(())
    }

    /// Bring the publisher in line with the current media input
    pub(super) async fn apply_media_input(&self, pumped: &mut Pumped) {
        let input = pumped.media_rx.borrow_and_update().clone();
        let previous = std::mem::replace(&mut pumped.applied_input, input.clone());

        let Some(active) = self.active_session() else {
            return;
        };
        let Some(publisher) = active.publisher.clone() else {
            return;
        };

        if previous.audio != input.audio || previous.audio_enabled != input.audio_enabled {
            if let Err(e) = publisher.replace_audio_track(&input).await {
                log_failure("replace audio track", PeerType::Publisher, &e);
            }
        }
        if previous.video != input.video || previous.video_enabled != input.video_enabled {
            if let Err(e) = publisher.replace_video_track(&input).await {
                log_failure("replace video track", PeerType::Publisher, &e);
            }
        }

        if previous.audio_enabled != input.audio_enabled
            || previous.video_enabled != input.video_enabled
        {
            self.send_mute_states(&active, &input).await;
        }
    }

    /// The SFU changed what our own participant publishes
    pub(super) async fn set_local_track_published(
        &self,
        pumped: &mut Pumped,
        track_type: TrackType,
        published: bool,
    ) {
        match track_type {
            TrackType::Audio => self.media.set_audio_enabled(published),
            TrackType::Video => self.media.set_video_enabled(published),
            other => {
                debug!(track_type = ?other, published, "Ignoring local screen share change");
                return;
            }
        }
        self.apply_media_input(pumped).await;
    }

    async fn send_mute_states(&self, active: &ActiveSession, input: &MediaInputState) {
        let request = UpdateMuteStatesRequest {
            session_id: active.session_id.clone(),
            mute_states: vec![
                TrackMuteState {
                    track_type: TrackType::Audio,
                    muted: !input.audio_enabled,
                },
                TrackMuteState {
                    track_type: TrackType::Video,
                    muted: !input.video_enabled,
                },
            ],
        };

        if let Err(e) = self.signaling.update_mute_states(request).await {
            log_failure("update mute states", PeerType::Publisher, &e);
        }
    }
}
