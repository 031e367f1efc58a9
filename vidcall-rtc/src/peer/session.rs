use super::{IceCandidateInit, PeerConnection, SessionDescription, SignalingState};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vidcall_proto::PeerType;

#[derive(Debug, Default)]
struct IceQueue {
    /// Set once a remote description is applied and the backlog drained
    remote_description_applied: bool,
    pending: VecDeque<IceCandidateInit>,
}

#[derive(Debug, Default)]
struct NegotiationFlags {
    in_flight: bool,
    requested_again: bool,
}

/// One peer connection plus the ordering rules the SFU relies on
///
/// - Remote ICE candidates are buffered until a remote description exists,
///   then applied in receipt order.
/// - Negotiation is single-flight: a trigger during an active round is
///   remembered and replayed once.
/// - After [`dispose`](Self::dispose) every in-flight operation fails with
///   [`Error::DisposedDuringOperation`] at its next suspend point.
pub struct PeerConnectionSession {
    role: PeerType,
    pc: Arc<dyn PeerConnection>,
    ice: Mutex<IceQueue>,
    negotiation: Mutex<NegotiationFlags>,
    ice_restart_requested: AtomicBool,
    disposed: CancellationToken,
}

impl PeerConnectionSession {
    #[must_use]
    pub fn new(role: PeerType, pc: Arc<dyn PeerConnection>) -> Self {
        Self {
            role,
            pc,
            ice: Mutex::new(IceQueue::default()),
            negotiation: Mutex::new(NegotiationFlags::default()),
            ice_restart_requested: AtomicBool::new(false),
            disposed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn role(&self) -> PeerType {
        self.role
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.pc
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Fails when the session was disposed
    pub fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::DisposedDuringOperation)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.pc.signaling_state()
    }

    #[must_use]
    pub fn pending_ice_candidates(&self) -> usize {
        self.ice.lock().pending.len()
    }

    pub async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        self.ensure_live()?;
        let offer = self.pc.create_offer(ice_restart).await?;
        self.ensure_live()?;
        Ok(offer)
    }

    pub async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_live()?;
        let answer = self.pc.create_answer().await?;
        self.ensure_live()?;
        Ok(answer)
    }

    pub async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_live()?;
        self.pc.set_local_description(desc).await?;
        self.ensure_live()
    }

    /// Apply the remote description, then drain buffered candidates FIFO.
    /// A candidate that fails to apply is logged and skipped.
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_live()?;
        self.pc.set_remote_description(desc).await?;
        self.ensure_live()?;

        loop {
            let next = {
                let mut ice = self.ice.lock();
                match ice.pending.pop_front() {
                    Some(candidate) => candidate,
                    None => {
                        ice.remote_description_applied = true;
                        break;
                    }
                }
            };

            if let Err(e) = self.pc.add_ice_candidate(next).await {
                warn!(role = %self.role, error = %e, "Failed to apply buffered ICE candidate");
            }
            self.ensure_live()?;
        }

        Ok(())
    }

    /// Apply `candidate` now, or buffer it until a remote description exists
    pub async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<()> {
        self.ensure_live()?;

        {
            let mut ice = self.ice.lock();
            if !ice.remote_description_applied || !ice.pending.is_empty() {
                trace!(role = %self.role, queued = ice.pending.len() + 1, "Buffering ICE candidate");
                ice.pending.push_back(candidate);
                return Ok(());
            }
        }

        self.pc.add_ice_candidate(candidate).await?;
        self.ensure_live()
    }

    /// Restart ICE on the next offer created by this session
    pub async fn restart_ice(&self) -> Result<()> {
        self.ensure_live()?;
        self.ice_restart_requested.store(true, Ordering::SeqCst);
        self.pc.restart_ice().await?;
        self.ensure_live()
    }

    /// Consume a pending ICE restart request
    pub fn take_ice_restart(&self) -> bool {
        self.ice_restart_requested.swap(false, Ordering::SeqCst)
    }

    /// Returns `false` when a round is already running; the caller's trigger
    /// is folded into that round.
    pub fn begin_negotiation(&self) -> bool {
        let mut flags = self.negotiation.lock();
        if flags.in_flight {
            flags.requested_again = true;
            debug!(role = %self.role, "Negotiation already in flight, coalescing");
            return false;
        }
        flags.in_flight = true;
        true
    }

    /// Ends a round. Returns `true` when another round must run.
    pub fn finish_negotiation(&self) -> bool {
        let mut flags = self.negotiation.lock();
        if flags.requested_again && !self.is_disposed() {
            flags.requested_again = false;
            return true;
        }
        flags.in_flight = false;
        flags.requested_again = false;
        false
    }

    /// Mark disposed. In-flight operations abandon at their next check.
    pub fn dispose(&self) {
        self.disposed.cancel();
        self.ice.lock().pending.clear();
    }

    /// Dispose and close the underlying connection
    pub async fn close(&self) {
        self.dispose();
        if let Err(e) = self.pc.close().await {
            warn!(role = %self.role, error = %e, "Failed to close peer connection");
        }
    }
}
