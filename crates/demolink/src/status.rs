//! Status views for the supervisor and bridge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::protocol::ChannelPair;

/// Status of the single workload slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    /// No instance running
    #[default]
    Idle,
    /// Engine confirmed the launch
    Running,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSnapshot {
    pub status: WorkloadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Pair republished on every start of an image.
    pub channels: ChannelPair,
}

/// Consumer-side connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BridgeState {
    /// No negotiated channels; result frames are dropped.
    #[default]
    Disconnected,
    /// Result channel bound; frames flow once `ready` is set.
    Bound { ready: bool },
}

impl BridgeState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Bound { ready: true })
    }
}
