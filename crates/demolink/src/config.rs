//! Supervisor and bridge configuration.
//!
//! Builder-style structs with defaults. `from_env()` overlays `DEMOLINK_*`
//! environment variables; there is no configuration file.

use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::protocol::ChannelPair;
use crate::engine::AcceleratorRequest;

/// Well-known channel names shared by both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNames {
    pub commands_in: String,
    pub commands_out: String,
    pub camera: String,
    pub ready: String,
    pub stopped: String,
}

impl Default for ChannelNames {
    fn default() -> Self {
        Self {
            commands_in: "commandsIn".to_string(),
            commands_out: "commandsOut".to_string(),
            camera: "cameraPassthrough".to_string(),
            ready: "containerReady".to_string(),
            stopped: "containerStopped".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub channels: ChannelNames,
    /// Pair announced for every launch.
    pub negotiated: ChannelPair,
    /// Transport endpoint bind-mounted into each workload.
    pub transport_endpoint: PathBuf,
    pub accelerator: AcceleratorRequest,
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            channels: ChannelNames::default(),
            negotiated: ChannelPair::default(),
            transport_endpoint: PathBuf::from("/tmp/echo.sock"),
            accelerator: AcceleratorRequest::default(),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl SupervisorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `DEMOLINK_ENDPOINT`, `DEMOLINK_POLL_MS`,
    /// `DEMOLINK_RESULT_CHANNEL` and `DEMOLINK_COMMAND_CHANNEL`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(path) = env_string("DEMOLINK_ENDPOINT") {
            config.transport_endpoint = PathBuf::from(path);
        }
        if let Some(interval) = env_millis("DEMOLINK_POLL_MS") {
            config.poll_interval = interval;
        }
        if let Some(result) = env_string("DEMOLINK_RESULT_CHANNEL") {
            config.negotiated.result = result;
        }
        if let Some(command) = env_string("DEMOLINK_COMMAND_CHANNEL") {
            config.negotiated.command = command;
        }
        config
    }

    pub fn with_channels(mut self, channels: ChannelNames) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_negotiated(mut self, pair: ChannelPair) -> Self {
        self.negotiated = pair;
        self
    }

    pub fn with_transport_endpoint(mut self, path: impl Into<PathBuf>) -> Self {
        self.transport_endpoint = path.into();
        self
    }

    pub fn with_accelerator(mut self, accelerator: AcceleratorRequest) -> Self {
        self.accelerator = accelerator;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub channels: ChannelNames,
    pub drain_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channels: ChannelNames::default(),
            drain_interval: Duration::from_millis(20),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `DEMOLINK_DRAIN_MS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(interval) = env_millis("DEMOLINK_DRAIN_MS") {
            config.drain_interval = interval;
        }
        config
    }

    pub fn with_channels(mut self, channels: ChannelNames) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }
}

/// `DOCKER_BIN` override for the docker executable.
pub fn docker_binary() -> PathBuf {
    env_string("DOCKER_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("docker"))
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = env_string(key)?;
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Some(Duration::from_millis(ms)),
        _ => {
            tracing::warn!(%key, value = %raw, "Ignoring invalid interval, using default");
            None
        }
    }
}
