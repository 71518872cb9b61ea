//! `ContainerEngine` backed by the docker command line.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    AcceleratorRequest, BindMount, ContainerEngine, EngineError, ImageInfo, InstanceHandle,
    LaunchSpec,
};

const IMAGE_FORMAT: &str = "{{.ID}}\t{{.Repository}}:{{.Tag}}";

pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Honour `DOCKER_BIN`, falling back to `docker` on `PATH`.
    pub fn from_env() -> Self {
        Self::new(crate::config::docker_binary())
    }

    async fn exec(&self, args: &[String]) -> Result<String, EngineError> {
        let command = format!("{} {}", self.binary.display(), args.join(" "));
        tracing::debug!(%command, "Invoking docker");

        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn list_images(&self) -> Result<Vec<ImageInfo>, EngineError> {
        let args = vec![
            "images".to_string(),
            "--no-trunc".to_string(),
            "--format".to_string(),
            IMAGE_FORMAT.to_string(),
        ];
        let stdout = self.exec(&args).await?;
        Ok(parse_image_listing(&stdout))
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<InstanceHandle, EngineError> {
        let stdout = self.exec(&run_args(spec)).await?;
        // `docker run --detach` prints the container id, possibly after pull progress.
        let id = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| !line.is_empty())
            .ok_or_else(|| EngineError::Output("docker run printed no container id".to_string()))?;
        Ok(InstanceHandle::new(id))
    }

    async fn stop(&self, instance: &InstanceHandle) -> Result<(), EngineError> {
        self.exec(&["stop".to_string(), instance.to_string()])
            .await
            .map(|_| ())
    }
}

/// Parse `docker images --format "{{.ID}}\t{{.Repository}}:{{.Tag}}"` output.
///
/// One line per tag; lines sharing an id are merged. Dangling `<none>` tags are skipped.
fn parse_image_listing(stdout: &str) -> Vec<ImageInfo> {
    let mut images: Vec<ImageInfo> = Vec::new();

    for line in stdout.lines() {
        let Some((id, tag)) = line.trim().split_once('\t') else {
            continue;
        };
        let tag = tag.trim();
        let tag = (!tag.contains("<none>")).then(|| tag.to_string());

        match images.iter_mut().find(|image| image.id == id) {
            Some(image) => image.tags.extend(tag),
            None => images.push(ImageInfo {
                id: id.to_string(),
                tags: tag.into_iter().collect(),
            }),
        }
    }

    images
}

fn run_args(spec: &LaunchSpec) -> Vec<String> {
    let mut args = vec!["run".to_string(), "--detach".to_string()];

    if spec.auto_remove {
        args.push("--rm".to_string());
    }

    if let Some(accelerator) = &spec.accelerator {
        args.push("--gpus".to_string());
        args.push(gpu_option(accelerator));
    }

    for mount in &spec.mounts {
        args.push("--volume".to_string());
        args.push(volume_option(mount));
    }

    args.push(spec.image_id.clone());
    args.extend(spec.args.iter().cloned());
    args
}

fn gpu_option(request: &AcceleratorRequest) -> String {
    let mut fields = vec![
        format!("driver={}", request.driver),
        format!("count={}", request.count),
    ];
    match request.capabilities.as_slice() {
        [] => {}
        [single] => fields.push(format!("capabilities={single}")),
        many => fields.push(format!("\"capabilities={}\"", many.join(","))),
    }
    fields.join(",")
}

fn volume_option(mount: &BindMount) -> String {
    let mode = if mount.read_only { "ro" } else { "rw" };
    format!(
        "{}:{}:{}",
        mount.source.display(),
        mount.target.display(),
        mode
    )
}
