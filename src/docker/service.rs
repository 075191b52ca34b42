use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use super::types::{ContainerHandle, HostConfig, ImageConfig, ImageMetadata, OutputSink};

/// Errors reported by a container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("unexpected daemon response: {0}")]
    Protocol(String),

    /// A recipe step exited non-zero while the image was being built.
    #[error("build step exited with code {code}: {detail}")]
    StepFailed { code: i64, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }

    /// Exit status of the failed build step, if this is a step failure.
    pub fn step_exit_code(&self) -> Option<i64> {
        match self {
            RuntimeError::StepFailed { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Image operations on a container daemon.
pub trait ImageService: Send + Sync {
    /// Build the image `tag` from the build context in `context_dir`,
    /// streaming build output to `output`.
    fn build(&self, tag: &str, context_dir: &Path, output: &OutputSink)
    -> Result<(), RuntimeError>;

    /// Fails with [`RuntimeError::NotFound`] if the image is absent.
    fn inspect(&self, reference: &str) -> Result<ImageMetadata, RuntimeError>;

    fn pull(&self, reference: &str) -> Result<(), RuntimeError>;

    fn remove(&self, reference: &str) -> Result<(), RuntimeError>;
}

/// Container lifecycle operations on a container daemon.
///
/// Implementations must be safe to share between concurrent builds; each
/// build only ever touches the handles it created.
pub trait ContainerService: Send + Sync {
    fn create(&self, config: &ImageConfig) -> Result<ContainerHandle, RuntimeError>;

    fn start(&self, handle: &ContainerHandle, host: &HostConfig) -> Result<(), RuntimeError>;

    /// Begin streaming the container's stdout/stderr to `output`. Returns once
    /// streaming is set up, not when the stream ends.
    fn attach(&self, handle: &ContainerHandle, output: &OutputSink) -> Result<(), RuntimeError>;

    /// Block until the container exits and return its exit status.
    fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError>;

    /// Stop the container. Succeeds if it already exited.
    fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError>;

    fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;
}
