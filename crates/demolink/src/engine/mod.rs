//! Container engine interface.
//!
//! The supervisor only needs three things from an engine: enumerate images,
//! launch one with an accelerator reservation, stop a running instance.
//! [`DockerCli`] drives the `docker` command line; tests use an in-memory fake.

mod docker;

use std::path::PathBuf;

use async_trait::async_trait;

pub use docker::DockerCli;

/// An image known to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub tags: Vec<String>,
}

impl ImageInfo {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// First image carrying `tag`.
pub fn find_image<'a>(images: &'a [ImageInfo], tag: &str) -> Option<&'a ImageInfo> {
    images.iter().find(|image| image.has_tag(tag))
}

/// Engine-assigned identifier of a running instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle(String);

impl InstanceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exclusive accelerator reservation for a launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceleratorRequest {
    pub driver: String,
    pub count: u32,
    pub capabilities: Vec<String>,
}

impl Default for AcceleratorRequest {
    fn default() -> Self {
        Self {
            driver: "nvidia".to_string(),
            count: 1,
            capabilities: vec!["gpu".to_string()],
        }
    }
}

/// Host path shared into the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl BindMount {
    /// Same path on both sides, read-write.
    pub fn shared(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            target: path,
            read_only: false,
        }
    }
}

/// Everything the engine needs to start one workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    /// Arguments handed to the image entrypoint.
    pub args: Vec<String>,
    pub accelerator: Option<AcceleratorRequest>,
    /// Remove the instance once it exits.
    pub auto_remove: bool,
    pub mounts: Vec<BindMount>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to invoke engine: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected engine output: {0}")]
    Output(String),
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn list_images(&self) -> Result<Vec<ImageInfo>, EngineError>;

    /// Start an instance. No timeout is applied; a hung launch blocks only the caller.
    async fn run(&self, spec: &LaunchSpec) -> Result<InstanceHandle, EngineError>;

    /// Ask a running instance to terminate gracefully.
    async fn stop(&self, instance: &InstanceHandle) -> Result<(), EngineError>;
}
