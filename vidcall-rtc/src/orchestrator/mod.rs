//! Media session orchestration
//!
//! [`MediaSessionOrchestrator`] owns one media session at a time: the
//! subscriber and publisher connections, the SFU channel and the participant
//! state. Everything inbound goes through [`pump`](MediaSessionOrchestrator::pump):
//!
//! - SFU push events, strictly in receipt order
//! - Peer connection callbacks (local ICE, renegotiation, remote tracks)
//! - Media input changes
//! - The debounced subscription update
//!
//! The host calls `pump` from its tick loop. Operations that await the SFU or
//! a peer connection suspend the pump call, never block the thread.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Joining -> Joined -> Left | Offline | ReconnectingFailed
//!                      |  ^
//!                      v  |
//!                Reconnecting / Migrating
//! ```

mod handlers;
mod publishing;

use crate::config::MediaSessionConfig;
use crate::error::{Error, Result};
use crate::media::{MediaInputProvider, MediaInputState};
use crate::participants::{Participant, ParticipantSessionState};
use crate::peer::{
    PeerConnectionEvent, PeerConnectionFactory, PeerConnectionSession, Publisher,
    PublisherSettings,
};
use crate::signaling::SfuSignaling;
use crate::subscription::{desired_subscriptions, TrackSubscriptionCoordinator};
use crate::types::{CallInfo, CallingState, SessionEvent, VideoResolution};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;
use vidcall_proto::events::IceTrickle;
use vidcall_proto::signal::{
    IceRestartRequest, JoinRequest, LeaveCallRequest, UpdateSubscriptionsRequest,
};
use vidcall_proto::{PeerType, SessionId, SfuEvent};

/// Connections and metadata of the session being joined or joined
#[derive(Clone)]
struct ActiveSession {
    session_id: SessionId,
    call: Arc<CallInfo>,
    cancel: CancellationToken,
    subscriber: Arc<PeerConnectionSession>,
    publisher: Option<Arc<Publisher>>,
    /// Set by the join confirmation; outbound ICE is queued until then
    joined: bool,
}

impl ActiveSession {
    fn dispose(&self) {
        self.cancel.cancel();
        self.subscriber.dispose();
        if let Some(publisher) = &self.publisher {
            publisher.session().dispose();
        }
    }

    async fn close(&self) {
        self.subscriber.close().await;
        if let Some(publisher) = &self.publisher {
            publisher.session().close().await;
        }
    }
}

/// State only touched in short synchronous sections
struct Inner {
    state: CallingState,
    active: Option<ActiveSession>,
    participants: ParticipantSessionState,
    resolution_overrides: HashMap<SessionId, VideoResolution>,
    subscriptions: TrackSubscriptionCoordinator,
    pending_outbound_ice: Vec<IceTrickle>,
    last_pump: Option<Instant>,
    /// Join in progress, cancelled by `stop` before `active` exists
    joining: Option<(SessionId, CancellationToken)>,
}

/// Inbound queues, drained by one pump at a time
struct Pumped {
    sfu_rx: Option<(SessionId, mpsc::UnboundedReceiver<SfuEvent>)>,
    peer_rx: mpsc::UnboundedReceiver<PeerConnectionEvent>,
    media_rx: watch::Receiver<MediaInputState>,
    applied_input: MediaInputState,
}

pub struct MediaSessionOrchestrator {
    config: MediaSessionConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    signaling: Arc<dyn SfuSignaling>,
    media: MediaInputProvider,
    events_tx: broadcast::Sender<SessionEvent>,
    peer_tx: mpsc::UnboundedSender<PeerConnectionEvent>,
    inner: Mutex<Inner>,
    pumped: tokio::sync::Mutex<Pumped>,
}

impl MediaSessionOrchestrator {
    #[must_use]
    pub fn new(
        config: MediaSessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        signaling: Arc<dyn SfuSignaling>,
        media: MediaInputProvider,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(config.session.event_capacity.max(1));
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let media_rx = media.subscribe();
        let applied_input = media_rx.borrow().clone();
        let subscriptions = TrackSubscriptionCoordinator::new(config.subscription_debounce());

        Self {
            config,
            factory,
            signaling,
            media,
            events_tx,
            peer_tx,
            inner: Mutex::new(Inner {
                state: CallingState::Idle,
                active: None,
                participants: ParticipantSessionState::new(),
                resolution_overrides: HashMap::new(),
                subscriptions,
                pending_outbound_ice: Vec::new(),
                last_pump: None,
                joining: None,
            }),
            pumped: tokio::sync::Mutex::new(Pumped {
                sfu_rx: None,
                peer_rx,
                media_rx,
                applied_input,
            }),
        }
    }

    /// Session notifications for the host
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    #[must_use]
    pub const fn config(&self) -> &MediaSessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn media(&self) -> &MediaInputProvider {
        &self.media
    }

    #[must_use]
    pub fn calling_state(&self) -> CallingState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|a| a.session_id.clone())
    }

    /// Participants in sorted-view order
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        let inner = self.inner.lock();
        inner
            .participants
            .sorted()
            .iter()
            .filter_map(|id| inner.participants.get(id).cloned())
            .collect()
    }

    #[must_use]
    pub fn participant(&self, session_id: &SessionId) -> Option<Participant> {
        self.inner.lock().participants.get(session_id).cloned()
    }

    #[must_use]
    pub fn pinned_participants(&self) -> Vec<SessionId> {
        self.inner.lock().participants.pinned().to_vec()
    }

    #[must_use]
    pub fn sorted_participants(&self) -> Vec<SessionId> {
        self.inner.lock().participants.sorted().to_vec()
    }

    #[must_use]
    pub fn dominant_speaker(&self) -> Option<SessionId> {
        self.inner.lock().participants.dominant_speaker().cloned()
    }

    /// Join `call` under a fresh session id
    ///
    /// Completes once the SFU confirms the join, or fails after the join
    /// timeout, on `cancel`, or when [`stop`](Self::stop) runs meanwhile.
    pub async fn start(&self, call: CallInfo, cancel: CancellationToken) -> Result<SessionId> {
        let session_id = SessionId::new(Uuid::new_v4().to_string());
        let cancel = cancel.child_token();
        {
            let mut inner = self.inner.lock();
            if inner.active.is_some() || inner.joining.is_some() || inner.state.is_active() {
                return Err(Error::InvalidState(format!(
                    "a media session is already active ({})",
                    inner.state
                )));
            }
            inner.participants.reset(Some(session_id.clone()));
            inner.resolution_overrides.clear();
            inner.subscriptions.reset();
            inner.pending_outbound_ice.clear();
            inner.last_pump = None;
            inner.joining = Some((session_id.clone(), cancel.clone()));
            self.transition(&mut inner, CallingState::Joining);
        }

        info!(session_id = %session_id, call_cid = %call.cid, sfu_url = %call.sfu_url, "Starting media session");

        let mut pumped = self.pumped.lock().await;
        pumped.sfu_rx = None;
        while pumped.peer_rx.try_recv().is_ok() {}

        let call = Arc::new(call);
        let timeout = self.config.join_timeout();

        let joined = tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(
                timeout,
                self.join(&mut pumped, session_id.clone(), call.clone(), cancel.clone()),
            ) => result.unwrap_or(Err(Error::JoinTimeout(timeout))),
        };

        if let Err(e) = joined {
            if matches!(e, Error::Cancelled) {
                info!(session_id = %session_id, "Join cancelled");
            } else {
                error!(session_id = %session_id, error = %e, "Failed to join media session");
            }
            let active = {
                let mut inner = self.inner.lock();
                let owned = Self::finish_joining(&mut inner, &session_id);
                let active = if inner
                    .active
                    .as_ref()
                    .is_some_and(|a| a.session_id == session_id)
                {
                    inner.active.take()
                } else {
                    None
                };
                // Otherwise `stop` already tore the session down
                if owned || active.is_some() {
                    inner.pending_outbound_ice.clear();
                    self.transition(&mut inner, CallingState::Offline);
                }
                active
            };
            if let Some(active) = active {
                active.dispose();
                active.close().await;
            }
            self.signaling.disconnect().await;
            return Err(e);
        }
        Self::finish_joining(&mut self.inner.lock(), &session_id);

        if call.can_publish() {
            self.create_publisher(&mut pumped, &session_id, &call).await;
        }
        self.send_subscriptions_now().await;

        if !self.is_joined(&session_id) {
            info!(session_id = %session_id, "Session stopped while starting");
            return Err(Error::Cancelled);
        }
        Ok(session_id)
    }

    /// Clear the joining slot if it still belongs to `session_id`
    fn finish_joining(inner: &mut Inner, session_id: &SessionId) -> bool {
        if inner.joining.as_ref().is_some_and(|(id, _)| id == session_id) {
            inner.joining = None;
            true
        } else {
            false
        }
    }

    /// Subscriber, SFU channel, then wait for the join confirmation
    async fn join(
        &self,
        pumped: &mut Pumped,
        session_id: SessionId,
        call: Arc<CallInfo>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let pc = self
            .factory
            .create(PeerType::Subscriber, &call.ice_servers, self.peer_tx.clone())
            .await?;
        let subscriber = Arc::new(PeerConnectionSession::new(PeerType::Subscriber, pc));
        if cancel.is_cancelled() {
            subscriber.close().await;
            return Err(Error::Cancelled);
        }

        let offer = match subscriber.create_offer(false).await {
            Ok(offer) if !cancel.is_cancelled() => offer,
            result => {
                subscriber.close().await;
                return Err(result.err().unwrap_or(Error::Cancelled));
            }
        };

        let installed = {
            let mut inner = self.inner.lock();
            let installed = !cancel.is_cancelled();
            if installed {
                inner.active = Some(ActiveSession {
                    session_id: session_id.clone(),
                    call: call.clone(),
                    cancel: cancel.clone(),
                    subscriber: subscriber.clone(),
                    publisher: None,
                    joined: false,
                });
            }
            installed
        };
        if !installed {
            subscriber.close().await;
            return Err(Error::Cancelled);
        }

        let mut rx = self
            .signaling
            .connect(JoinRequest {
                session_id: session_id.clone(),
                subscriber_sdp: offer.sdp,
                sfu_url: call.sfu_url.clone(),
                token: call.sfu_token.clone(),
            })
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Local candidates gathered meanwhile are queued until the join lands
        while !self.is_joined(&session_id) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            tokio::select! {
                event = rx.recv() => match event {
                    Some(SfuEvent::Error(err)) if !err.should_retry => {
                        self.handle_sfu_event(pumped, SfuEvent::Error(err.clone())).await;
                        return Err(err.into());
                    }
                    Some(event) => self.handle_sfu_event(pumped, event).await,
                    None => {
                        return Err(Error::Signaling(
                            "signaling channel closed before join".to_string(),
                        ));
                    }
                },
                Some(event) = pumped.peer_rx.recv() => self.handle_peer_event(event).await,
            }
        }

        pumped.sfu_rx = Some((session_id, rx));
        Ok(())
    }

    async fn create_publisher(&self, pumped: &mut Pumped, session_id: &SessionId, call: &CallInfo) {
        let pc = match self
            .factory
            .create(PeerType::Publisher, &call.ice_servers, self.peer_tx.clone())
            .await
        {
            Ok(pc) => pc,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to create publisher connection");
                return;
            }
        };

        let session = Arc::new(PeerConnectionSession::new(PeerType::Publisher, pc));
        let publisher = Arc::new(Publisher::new(
            session.clone(),
            PublisherSettings::from(&self.config),
        ));

        let attached = {
            let mut inner = self.inner.lock();
            match inner.active.as_mut() {
                Some(active) if active.session_id == *session_id => {
                    active.publisher = Some(publisher.clone());
                    true
                }
                _ => false,
            }
        };
        if !attached {
            debug!(session_id = %session_id, "Session gone, discarding publisher");
            session.close().await;
            return;
        }

        let input = pumped.media_rx.borrow_and_update().clone();
        pumped.applied_input = input.clone();
        if let Err(e) = publisher.init_tracks(&input).await {
            log_failure("init publisher tracks", PeerType::Publisher, &e);
        }
        info!(session_id = %session_id, "Publisher created");
    }

    /// Leave the call and tear everything down. Safe without a session.
    pub async fn stop(&self) {
        let (active, joining) = {
            let mut inner = self.inner.lock();
            let active = inner.active.take();
            let joining = inner.joining.take();
            Self::clear_session_state(&mut inner);
            (active, joining)
        };

        if let Some((session_id, cancel)) = joining {
            info!(session_id = %session_id, "Cancelling join in progress");
            cancel.cancel();
        }
        if let Some(active) = &active {
            info!(session_id = %active.session_id, "Stopping media session");
            active.dispose();
            if active.joined {
                let leave = LeaveCallRequest {
                    session_id: active.session_id.clone(),
                    reason: "client stopped".to_string(),
                };
                if let Err(e) = self.signaling.leave(leave).await {
                    warn!(session_id = %active.session_id, error = %e, "Failed to send leave request");
                }
            }
            active.close().await;
        }
        self.signaling.disconnect().await;

        if let Ok(mut pumped) = self.pumped.try_lock() {
            pumped.sfu_rx = None;
            while pumped.peer_rx.try_recv().is_ok() {}
        }

        let mut inner = self.inner.lock();
        self.transition(&mut inner, CallingState::Offline);
    }

    /// Tear down after the SFU ended the call
    async fn end_session(&self, pumped: &mut Pumped, state: CallingState) {
        let active = {
            let mut inner = self.inner.lock();
            let active = inner.active.take();
            Self::clear_session_state(&mut inner);
            self.transition(&mut inner, state);
            active
        };
        pumped.sfu_rx = None;

        if let Some(active) = active {
            active.dispose();
            active.close().await;
        }
        self.signaling.disconnect().await;
    }

    fn clear_session_state(inner: &mut Inner) {
        inner.participants.reset(None);
        inner.resolution_overrides.clear();
        inner.subscriptions.reset();
        inner.pending_outbound_ice.clear();
        inner.last_pump = None;
    }

    /// Restart ICE on both connections, keeping the session id
    pub async fn reconnect(&self) -> Result<()> {
        let _pumped = self.pumped.lock().await;
        let active = {
            let mut inner = self.inner.lock();
            let Some(active) = inner.active.clone().filter(|a| a.joined) else {
                return Err(Error::InvalidState("no joined session to reconnect".to_string()));
            };
            self.transition(&mut inner, CallingState::Reconnecting);
            active
        };
        info!(session_id = %active.session_id, "Reconnecting media session");

        let result = self.restart_ice(&active).await;

        let mut inner = self.inner.lock();
        if !inner
            .active
            .as_ref()
            .is_some_and(|a| a.session_id == active.session_id)
        {
            // Stopped meanwhile
            return Ok(());
        }
        match result {
            Ok(()) => {
                self.transition(&mut inner, CallingState::Joined);
                Ok(())
            }
            Err(e) if e.is_disposed() => Ok(()),
            Err(e) => {
                error!(session_id = %active.session_id, error = %e, "Reconnect failed");
                self.transition(&mut inner, CallingState::ReconnectingFailed);
                Err(e)
            }
        }
    }

    async fn restart_ice(&self, active: &ActiveSession) -> Result<()> {
        if let Some(publisher) = &active.publisher {
            publisher.session().restart_ice().await?;
            self.negotiate_publisher(publisher, &active.session_id)
                .await?;
        }

        // Subscriber offers come from the SFU
        active.subscriber.ensure_live()?;
        self.signaling
            .ice_restart(IceRestartRequest {
                session_id: active.session_id.clone(),
                peer_type: PeerType::Subscriber,
            })
            .await
    }

    /// Drain every inbound queue once
    ///
    /// Returns immediately when another pump or a join currently holds the
    /// queues.
    pub async fn pump(&self) {
        self.check_pump_interval();

        let Ok(mut pumped) = self.pumped.try_lock() else {
            trace!("Pump busy, skipping tick");
            return;
        };

        let current = self.session_id();
        loop {
            let received = match pumped.sfu_rx.as_mut() {
                None => break,
                // Channel of a session that is gone
                Some((id, _)) if current.as_ref() != Some(&*id) => {
                    Err(mpsc::error::TryRecvError::Disconnected)
                }
                Some((_, rx)) => rx.try_recv(),
            };

            match received {
                Ok(event) => self.handle_sfu_event(&mut pumped, event).await,
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if let Some(id) = &current {
                        warn!(session_id = %id, "Signaling channel closed");
                    }
                    pumped.sfu_rx = None;
                    break;
                }
            }
        }

        while let Ok(event) = pumped.peer_rx.try_recv() {
            self.handle_peer_event(event).await;
        }

        if pumped.media_rx.has_changed().unwrap_or(false) {
            self.apply_media_input(&mut pumped).await;
        }

        self.tick_subscriptions().await;
    }

    fn check_pump_interval(&self) {
        let now = Instant::now();
        let grace = self.config.pump_grace();
        let stalled = {
            let mut inner = self.inner.lock();
            let previous = inner.last_pump.replace(now);
            previous
                .map(|p| now.duration_since(p))
                .filter(|elapsed| *elapsed > grace && inner.active.is_some())
        };

        if let Some(elapsed) = stalled {
            warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                grace_ms = grace.as_millis() as u64,
                "Pump was not called within the grace window"
            );
            self.emit(SessionEvent::PumpStalled { elapsed });
        }
    }

    /// Store a per-participant video size and mark subscriptions dirty
    pub fn update_requested_video_resolution(
        &self,
        session_id: SessionId,
        resolution: VideoResolution,
    ) {
        let mut inner = self.inner.lock();
        debug!(session_id = %session_id, resolution = %resolution, "Requested video resolution");
        inner.resolution_overrides.insert(session_id, resolution);
        inner.subscriptions.request(Instant::now());
    }

    pub fn pin_locally(&self, session_id: SessionId) {
        let mut inner = self.inner.lock();
        inner.participants.pin_locally(session_id);
        self.publish_view_changes(&mut inner);
    }

    pub fn unpin_locally(&self, session_id: &SessionId) {
        let mut inner = self.inner.lock();
        if inner.participants.unpin_locally(session_id) {
            self.publish_view_changes(&mut inner);
        }
    }

    pub async fn set_publisher_audio_enabled(&self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
        let mut pumped = self.pumped.lock().await;
        self.apply_media_input(&mut pumped).await;
    }

    pub async fn set_publisher_video_enabled(&self, enabled: bool) {
        self.media.set_video_enabled(enabled);
        let mut pumped = self.pumped.lock().await;
        self.apply_media_input(&mut pumped).await;
    }

    fn is_joined(&self, session_id: &SessionId) -> bool {
        self.inner
            .lock()
            .active
            .as_ref()
            .is_some_and(|a| a.session_id == *session_id && a.joined)
    }

    fn active_session(&self) -> Option<ActiveSession> {
        self.inner.lock().active.clone()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    fn transition(&self, inner: &mut Inner, to: CallingState) {
        let from = std::mem::replace(&mut inner.state, to);
        if from != to {
            info!(from = %from, to = %to, "Calling state changed");
            self.emit(SessionEvent::CallingStateChanged { from, to });
        }
    }

    fn publish_view_changes(&self, inner: &mut Inner) {
        let changes = inner.participants.recompute();
        if changes.pinned {
            self.emit(SessionEvent::PinnedParticipantsChanged(
                inner.participants.pinned().to_vec(),
            ));
        }
        if changes.sorted {
            self.emit(SessionEvent::SortedParticipantsChanged(
                inner.participants.sorted().to_vec(),
            ));
        }
    }

    fn subscription_request(&self, inner: &Inner) -> Option<UpdateSubscriptionsRequest> {
        let active = inner.active.as_ref().filter(|a| a.joined)?;
        Some(UpdateSubscriptionsRequest {
            session_id: active.session_id.clone(),
            tracks: desired_subscriptions(
                &inner.participants,
                &inner.resolution_overrides,
                self.config.video.default_participant_resolution,
            ),
        })
    }

    async fn send_subscriptions_now(&self) {
        let request = {
            let inner = self.inner.lock();
            self.subscription_request(&inner)
        };
        if let Some(request) = request {
            self.send_subscriptions(request).await;
        }
    }

    async fn tick_subscriptions(&self) {
        let request = {
            let mut inner = self.inner.lock();
            let joined = inner.active.as_ref().is_some_and(|a| a.joined);
            if joined && inner.subscriptions.try_begin(Instant::now()) {
                self.subscription_request(&inner)
            } else {
                None
            }
        };

        if let Some(request) = request {
            self.send_subscriptions(request).await;
            self.inner.lock().subscriptions.complete();
        }
    }

    async fn send_subscriptions(&self, request: UpdateSubscriptionsRequest) {
        let session_id = request.session_id.clone();
        let count = request.tracks.len();
        match self.signaling.update_subscriptions(request).await {
            Ok(()) => debug!(session_id = %session_id, tracks = count, "Track subscriptions updated"),
            Err(e) => error!(session_id = %session_id, error = %e, "Failed to update track subscriptions"),
        }
    }
}

/// Disposal races are expected during teardown; everything else is reported
fn log_failure(operation: &str, role: PeerType, error: &Error) {
    if error.is_disposed() {
        debug!(operation, role = %role, "Connection disposed during operation, abandoning");
    } else {
        error!(operation, role = %role, error = %error, "Peer connection operation failed");
    }
}
