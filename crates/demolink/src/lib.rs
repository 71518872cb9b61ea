//! demolink: container supervisor and frame/command bridge for GPU demo workloads.
//!
//! Two cooperating endpoints share a pub/sub bus:
//! - [`WorkloadSupervisor`] keeps at most one demo container running and
//!   announces the channel pair it was launched with
//! - [`FrameBridge`] lives in the UI process, queues outbound commands and
//!   buffers the latest camera and result frames

pub mod bridge;
pub mod bus;
pub mod config;
mod context;
pub mod engine;
pub mod logging;
mod shutdown;
pub mod status;
mod supervisor;

#[cfg(test)]
mod test_support;

pub use bridge::frame::Frame;
pub use bridge::protocol::{ChannelPair, ControlCommand, ControlOp, ProtocolError};
pub use bridge::queue::Destination;
pub use bridge::{FrameBridge, FrameSelector};
pub use bus::{BusClient, BusError, LocalTransport, Payload, Transport};
pub use config::{BridgeConfig, ChannelNames, SupervisorConfig};
pub use context::BusContext;
pub use engine::{ContainerEngine, DockerCli, EngineError};
pub use shutdown::wait_for_signal;
pub use status::{BridgeState, SupervisorSnapshot, WorkloadStatus};
pub use supervisor::{WorkloadDescriptor, WorkloadSupervisor};

/// Crate version from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
