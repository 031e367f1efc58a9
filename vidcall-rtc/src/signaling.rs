//! SFU signaling channel interface
//!
//! The transport (WebSocket, gRPC, ...) is owned by the host. This layer only
//! needs the typed RPCs below plus one ordered stream of push events, handed
//! out by [`SfuSignaling::connect`].

use crate::error::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use vidcall_proto::events::IceTrickle;
use vidcall_proto::signal::{
    IceRestartRequest, JoinRequest, LeaveCallRequest, SendAnswerRequest, SetPublisherRequest,
    SetPublisherResponse, UpdateMuteStatesRequest, UpdateSubscriptionsRequest,
};
use vidcall_proto::SfuEvent;

/// Bidirectional channel to one SFU
///
/// Push events must be delivered on the returned receiver in the order the
/// SFU sent them. RPC failures are returned as-is; retries belong to the
/// implementation.
#[async_trait]
pub trait SfuSignaling: Send + Sync {
    /// Open the channel and send the join request
    async fn connect(&self, request: JoinRequest) -> Result<mpsc::UnboundedReceiver<SfuEvent>>;

    async fn set_publisher(&self, request: SetPublisherRequest) -> Result<SetPublisherResponse>;

    async fn send_answer(&self, request: SendAnswerRequest) -> Result<()>;

    async fn update_subscriptions(&self, request: UpdateSubscriptionsRequest) -> Result<()>;

    async fn ice_trickle(&self, trickle: IceTrickle) -> Result<()>;

    async fn update_mute_states(&self, request: UpdateMuteStatesRequest) -> Result<()>;

    async fn ice_restart(&self, request: IceRestartRequest) -> Result<()>;

    async fn leave(&self, request: LeaveCallRequest) -> Result<()>;

    /// Close the channel. Must be safe to call when not connected.
    async fn disconnect(&self);
}
