//! Inbound SFU events and peer connection callbacks

use super::{log_failure, ActiveSession, MediaSessionOrchestrator, Pumped};
use crate::error::Result;
use crate::peer::{
    IceCandidateInit, PeerConnectionEvent, PeerConnectionState, RemoteTrack, SessionDescription,
};
use crate::types::{CallingState, SessionEvent};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vidcall_proto::events::{
    DominantSpeakerChanged, IceTrickle, JoinResponse, ParticipantJoined, ParticipantLeft,
    PinsChanged, SubscriberOffer, TrackPublished, TrackUnpublished,
};
use vidcall_proto::signal::SendAnswerRequest;
use vidcall_proto::{CallCid, PeerType, SessionId, SfuEvent, TrackType};

impl MediaSessionOrchestrator {
    pub(super) async fn handle_sfu_event(&self, pumped: &mut Pumped, event: SfuEvent) {
        let Some(active) = self.active_session() else {
            debug!(event = event.name(), "No active session, dropping SFU event");
            return;
        };
        debug!(session_id = %active.session_id, event = event.name(), "SFU event");

        match event {
            SfuEvent::JoinResponse(response) => self.on_join_response(&active, response).await,
            SfuEvent::SubscriberOffer(offer) => self.on_subscriber_offer(&active, offer).await,
            SfuEvent::IceTrickle(trickle) => self.on_remote_ice(&active, trickle).await,
            SfuEvent::TrackPublished(published) => {
                self.on_track_published(pumped, published).await;
            }
            SfuEvent::TrackUnpublished(unpublished) => {
                self.on_track_unpublished(pumped, unpublished).await;
            }
            SfuEvent::ParticipantJoined(joined) => self.on_participant_joined(&active, joined),
            SfuEvent::ParticipantLeft(left) => self.on_participant_left(&active, left),
            SfuEvent::DominantSpeakerChanged(change) => self.on_dominant_speaker(change),
            SfuEvent::PinsChanged(pins) => self.on_pins_changed(&pins),
            SfuEvent::Error(err) => {
                error!(
                    session_id = %active.session_id,
                    code = err.code,
                    message = %err.message,
                    should_retry = err.should_retry,
                    "SFU reported an error"
                );
                self.emit(SessionEvent::SfuError {
                    code: err.code,
                    message: err.message,
                    should_retry: err.should_retry,
                });
            }
            SfuEvent::GoAway(go_away) => {
                warn!(session_id = %active.session_id, reason = %go_away.reason, "SFU asked to migrate");
                {
                    let mut inner = self.inner.lock();
                    self.transition(&mut inner, CallingState::Migrating);
                }
                self.emit(SessionEvent::GoAway {
                    reason: go_away.reason,
                });
            }
            SfuEvent::CallEnded => {
                info!(session_id = %active.session_id, "Call ended by the SFU");
                self.end_session(pumped, CallingState::Left).await;
            }
        }
    }

    async fn on_join_response(&self, active: &ActiveSession, response: JoinResponse) {
        let pending = {
            let mut inner = self.inner.lock();
            let Some(current) = inner
                .active
                .as_mut()
                .filter(|a| a.session_id == active.session_id)
            else {
                return;
            };
            current.joined = true;

            if let Some(change) = inner.participants.load_snapshot(&response.call_state) {
                self.emit(SessionEvent::DominantSpeakerChanged {
                    current: change.current,
                    previous: change.previous,
                });
            }
            self.publish_view_changes(&mut inner);
            self.transition(&mut inner, CallingState::Joined);
            std::mem::take(&mut inner.pending_outbound_ice)
        };

        info!(
            session_id = %active.session_id,
            participants = response.call_state.participants.len(),
            queued_candidates = pending.len(),
            "Joined call"
        );

        for trickle in pending {
            self.send_trickle(trickle).await;
        }
    }

    /// SFU-driven renegotiation of the subscriber
    async fn on_subscriber_offer(&self, active: &ActiveSession, offer: SubscriberOffer) {
        debug!(
            session_id = %active.session_id,
            ice_restart = offer.ice_restart,
            "Subscriber offer received"
        );

        let result: Result<()> = async {
            let subscriber = &active.subscriber;
            subscriber
                .set_remote_description(SessionDescription::offer(offer.sdp))
                .await?;
            let answer = subscriber.create_answer().await?;
            subscriber.set_local_description(answer.clone()).await?;
            subscriber.ensure_live()?;

            self.signaling
                .send_answer(SendAnswerRequest {
                    peer_type: PeerType::Subscriber,
                    sdp: answer.sdp,
                    session_id: active.session_id.clone(),
                })
                .await
        }
        .await;

        if let Err(e) = result {
            log_failure("answer subscriber offer", PeerType::Subscriber, &e);
        }
    }

    async fn on_remote_ice(&self, active: &ActiveSession, trickle: IceTrickle) {
        let candidate: IceCandidateInit = match serde_json::from_str(&trickle.ice_candidate) {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(peer_type = %trickle.peer_type, error = %e, "Malformed ICE candidate from SFU");
                return;
            }
        };

        let session = match trickle.peer_type {
            PeerType::Subscriber => active.subscriber.clone(),
            PeerType::Publisher => match &active.publisher {
                Some(publisher) => publisher.session().clone(),
                None => {
                    debug!("ICE candidate for a publisher that does not exist, dropping");
                    return;
                }
            },
        };

        if let Err(e) = session.add_ice_candidate(candidate).await {
            log_failure("add remote ICE candidate", trickle.peer_type, &e);
        }
    }

    async fn on_track_published(&self, pumped: &mut Pumped, event: TrackPublished) {
        if self.is_local_session(&event.session_id) {
            self.set_local_track_published(pumped, event.track_type, true)
                .await;
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(info) = &event.participant {
            if inner.participants.upsert(info) {
                self.emit(SessionEvent::ParticipantJoined(info.session_id.clone()));
            }
        }
        if inner
            .participants
            .set_track_enabled(&event.session_id, event.track_type, true)
        {
            self.emit(SessionEvent::TrackEnabledChanged {
                session_id: event.session_id.clone(),
                track_type: event.track_type,
                enabled: true,
            });
            inner.subscriptions.request(Instant::now());
        }
        self.publish_view_changes(&mut inner);
    }

    async fn on_track_unpublished(&self, pumped: &mut Pumped, event: TrackUnpublished) {
        if self.is_local_session(&event.session_id) {
            self.set_local_track_published(pumped, event.track_type, false)
                .await;
            return;
        }

        let mut inner = self.inner.lock();
        // Unknown participants are ignored; the roster may not be synced yet
        if inner.participants.get(&event.session_id).is_none() {
            debug!(session_id = %event.session_id, "Track unpublished for unknown participant");
            return;
        }
        if let Some(info) = &event.participant {
            inner.participants.upsert(info);
        }
        if inner
            .participants
            .set_track_enabled(&event.session_id, event.track_type, false)
        {
            debug!(
                session_id = %event.session_id,
                track_type = ?event.track_type,
                cause = %event.cause,
                "Track unpublished"
            );
            self.emit(SessionEvent::TrackEnabledChanged {
                session_id: event.session_id.clone(),
                track_type: event.track_type,
                enabled: false,
            });
        }
        inner.subscriptions.request(Instant::now());
        self.publish_view_changes(&mut inner);
    }

    fn on_participant_joined(&self, active: &ActiveSession, event: ParticipantJoined) {
        if !Self::is_same_call(active, event.call_cid.as_ref()) {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.participants.upsert(&event.participant) {
            info!(
                session_id = %event.participant.session_id,
                user_id = %event.participant.user_id,
                "Participant joined"
            );
            self.emit(SessionEvent::ParticipantJoined(
                event.participant.session_id.clone(),
            ));
        }
        inner.subscriptions.request(Instant::now());
        self.publish_view_changes(&mut inner);
    }

    fn on_participant_left(&self, active: &ActiveSession, event: ParticipantLeft) {
        if !Self::is_same_call(active, event.call_cid.as_ref()) {
            return;
        }

        let session_id = &event.participant.session_id;
        let mut inner = self.inner.lock();
        inner.resolution_overrides.remove(session_id);
        if inner.participants.remove(session_id).is_some() {
            info!(session_id = %session_id, "Participant left");
            self.emit(SessionEvent::ParticipantLeft(session_id.clone()));
        }
        inner.subscriptions.request(Instant::now());
        self.publish_view_changes(&mut inner);
    }

    fn on_dominant_speaker(&self, event: DominantSpeakerChanged) {
        let mut inner = self.inner.lock();
        if let Some(change) = inner.participants.set_dominant_speaker(&event.session_id) {
            self.emit(SessionEvent::DominantSpeakerChanged {
                current: change.current,
                previous: change.previous,
            });
            self.publish_view_changes(&mut inner);
        }
    }

    fn on_pins_changed(&self, event: &PinsChanged) {
        let mut inner = self.inner.lock();
        inner.participants.set_server_pins(&event.pins);
        self.publish_view_changes(&mut inner);
    }

    fn is_same_call(active: &ActiveSession, call_cid: Option<&CallCid>) -> bool {
        match call_cid {
            Some(cid) if *cid != active.call.cid => {
                warn!(
                    expected = %active.call.cid,
                    received = %cid,
                    "Participant event for another call, ignoring"
                );
                false
            }
            _ => true,
        }
    }

    fn is_local_session(&self, session_id: &SessionId) -> bool {
        self.inner.lock().participants.is_local(session_id)
    }

    pub(super) async fn handle_peer_event(&self, event: PeerConnectionEvent) {
        let Some(active) = self.active_session() else {
            return;
        };

        match event {
            PeerConnectionEvent::IceCandidate { role, candidate } => {
                let trickle = IceTrickle {
                    peer_type: role,
                    ice_candidate: candidate,
                    session_id: active.session_id.clone(),
                };
                let send_now = {
                    let mut inner = self.inner.lock();
                    if inner.active.as_ref().is_some_and(|a| a.joined) {
                        true
                    } else {
                        inner.pending_outbound_ice.push(trickle.clone());
                        false
                    }
                };
                if send_now {
                    self.send_trickle(trickle).await;
                }
            }
            PeerConnectionEvent::NegotiationNeeded { role } => match role {
                PeerType::Publisher => {
                    if let Some(publisher) = &active.publisher {
                        // Failures are logged per round
                        let _ = self.negotiate_publisher(publisher, &active.session_id).await;
                    }
                }
                PeerType::Subscriber => {
                    debug!("Subscriber negotiation is driven by the SFU, ignoring");
                }
            },
            PeerConnectionEvent::Track { role, track } => {
                if role == PeerType::Subscriber {
                    self.on_remote_track(track);
                }
            }
            PeerConnectionEvent::ConnectionStateChanged { role, state } => {
                if state == PeerConnectionState::Failed {
                    warn!(session_id = %active.session_id, role = %role, "Peer connection failed");
                } else {
                    info!(session_id = %active.session_id, role = %role, state = %state, "Peer connection state changed");
                }
            }
        }
    }

    /// Bind a subscriber track to its participant via the stream id
    /// `<trackLookupPrefix>:<TRACK_TYPE_...>`
    fn on_remote_track(&self, track: RemoteTrack) {
        let Some((prefix, key)) = track.stream_id.rsplit_once(':') else {
            warn!(stream_id = %track.stream_id, "Remote track with unexpected stream id");
            return;
        };
        let Some(track_type) = TrackType::from_stream_key(key) else {
            warn!(stream_id = %track.stream_id, "Remote track with unknown track type");
            return;
        };

        let mut inner = self.inner.lock();
        let Some(session_id) = inner
            .participants
            .find_by_track_prefix(prefix)
            .map(|p| p.session_id.clone())
        else {
            warn!(prefix, "Remote track for unknown participant");
            return;
        };

        if inner
            .participants
            .attach_track(&session_id, track_type, track)
        {
            debug!(session_id = %session_id, track_type = ?track_type, "Remote track attached");
            self.emit(SessionEvent::TrackAdded {
                session_id,
                track_type,
            });
        }
    }

    async fn send_trickle(&self, trickle: IceTrickle) {
        let peer_type = trickle.peer_type;
        if let Err(e) = self.signaling.ice_trickle(trickle).await {
            warn!(peer_type = %peer_type, error = %e, "Failed to send ICE candidate");
        }
    }
}
