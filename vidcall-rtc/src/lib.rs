//! vidcall media session layer
//!
//! Client-side orchestration of a video call against a Selective Forwarding
//! Unit: one publisher connection sending local media, one subscriber
//! connection receiving everyone else, and the SFU signaling that ties them
//! together.
//!
//! ## Architecture
//!
//! - **`MediaSessionOrchestrator`**: session state machine, owns everything below
//! - **`PeerConnectionSession`**: one peer connection with ICE buffering and
//!   single-flight negotiation; `Publisher` adds local tracks and simulcast
//! - **`TrackSubscriptionCoordinator`**: debounced, full-set subscription updates
//! - **`ParticipantSessionState`**: roster, pins and the sorted grid order
//! - **`sdp`**: RED/DTX rewriting of local offers
//!
//! ## Features
//!
//! - Event-driven join with timeout and cancellation
//! - Trickle ICE in both directions, ordered and never applied early
//! - Simulcast publishing (quarter, half, full) with a safe resolution floor
//! - Codec forcing (RED audio, preferred video codec) with graceful fallback
//! - Reconnect by ICE restart, SFU migration and call-ended handling
//!
//! ## Usage
//!
//! ```rust,ignore
//! use vidcall_rtc::{MediaSessionConfig, MediaSessionOrchestrator, MediaInputProvider};
//! use vidcall_rtc::peer::engine::WebRtcEngineFactory;
//!
//! let config = MediaSessionConfig::load(Some("vidcall.toml"))?;
//! vidcall_rtc::logging::init_logging(&config.logging)?;
//!
//! let orchestrator = MediaSessionOrchestrator::new(
//!     config,
//!     Arc::new(WebRtcEngineFactory::new()),
//!     signaling, // your SfuSignaling transport
//!     MediaInputProvider::default(),
//! );
//! let session_id = orchestrator.start(call, CancellationToken::new()).await?;
//! loop {
//!     orchestrator.pump().await;
//!     tokio::time::sleep(Duration::from_millis(16)).await;
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod participants;
pub mod peer;
pub mod sdp;
pub mod signaling;
pub mod subscription;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use config::MediaSessionConfig;
pub use error::{Error, Result};
pub use media::{MediaInputProvider, MediaInputState};
pub use orchestrator::MediaSessionOrchestrator;
pub use participants::{Participant, ParticipantSessionState};
pub use peer::{PeerConnectionSession, Publisher};
pub use signaling::SfuSignaling;
pub use subscription::TrackSubscriptionCoordinator;
pub use types::{CallInfo, CallingState, SessionEvent, VideoResolution};
