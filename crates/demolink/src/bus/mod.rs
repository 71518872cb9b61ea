//! Messaging bus abstraction.
//!
//! The bus itself (broker, wire format, sockets) is an external capability.
//! This module defines what demolink needs from it:
//!
//! - **Transport**: attach/detach subscriptions and publish payloads by channel name
//! - **EventLoop**: one task per process that runs subscription handlers in order
//! - **LocalTransport**: in-process transport for single-process setups and tests

mod event_loop;
mod local;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bridge::frame::Frame;

pub use event_loop::{BusClient, EventLoop, Publisher, Subscription};
pub use local::LocalTransport;

/// Unique identifier for one subscription on a bus client.
///
/// Channel names are reused across workload launches, so deliveries are
/// attributed to the subscription that received them, never to the name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed message body carried on a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Int(i64),
    Image(Arc<Frame>),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Int(_) => "int",
            Self::Image(_) => "image",
        }
    }
}

/// A payload received on behalf of a specific subscription.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subscription: SubscriptionId,
    pub channel: String,
    pub payload: Payload,
}

pub type DeliverySink = mpsc::UnboundedSender<Delivery>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("no tokio runtime available to host the event loop")]
    NoRuntime,
    #[error("bus client is shut down")]
    Closed,
    #[error("failed to attach to channel {channel}: {reason}")]
    Attach { channel: String, reason: String },
    #[error("failed to publish on channel {channel}: {reason}")]
    Publish { channel: String, reason: String },
}

/// Pub/sub transport used by a [`BusClient`].
///
/// `attach`/`detach` are called from subscription handlers on the event loop
/// and must not block. `publish` is only called from worker tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Start delivering messages published on `channel` to `sink`, tagged with `subscription`.
    fn attach(
        &self,
        channel: &str,
        subscription: SubscriptionId,
        sink: DeliverySink,
    ) -> Result<(), BusError>;

    /// Stop delivering to `subscription`. Unknown ids are ignored.
    fn detach(&self, subscription: SubscriptionId);

    async fn publish(&self, channel: &str, payload: Payload) -> Result<(), BusError>;
}
