//! vidcall SFU signaling messages
//!
//! Typed messages exchanged with the Selective Forwarding Unit over the
//! signaling channel:
//!
//! - **`events`**: server-pushed events (`JoinResponse`, `SubscriberOffer`, ...)
//! - **`signal`**: RPC requests and responses (`SetPublisher`, `SendAnswer`, ...)
//! - **`models`**: shared payloads (participants, tracks, simulcast layers)
//! - **`ids`**: string identifiers
//!
//! The byte-level codec belongs to the transport; everything here is plain
//! `serde` data.

pub mod events;
pub mod ids;
pub mod models;
pub mod signal;

pub use events::SfuEvent;
pub use ids::{CallCid, SessionId, TrackId, UserId};
pub use models::{PeerType, TrackType, VideoDimension, VideoQuality};
