// In-memory Container/Image Services. They record every call so tests can
// assert on what a build asked the daemon to do.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::service::{ContainerService, ImageService, RuntimeError};
use super::types::{ContainerHandle, HostConfig, ImageConfig, ImageMetadata, OutputLine, OutputSink};

/// Exit status reported by a blocked `wait` once the container is stopped.
pub const STOPPED_EXIT_CODE: i64 = 137;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerOp {
    Create,
    Start,
    Attach,
    Wait,
    Stop,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageOp {
    Build,
    Pull,
    Remove,
}

#[derive(Debug, Default)]
struct ContainerState {
    created: Vec<(ContainerHandle, ImageConfig)>,
    started: HashMap<ContainerHandle, HostConfig>,
    attached: Vec<ContainerHandle>,
    waited: Vec<ContainerHandle>,
    stopped: Vec<ContainerHandle>,
    removed: Vec<ContainerHandle>,
    released: HashSet<ContainerHandle>,
    failures: HashMap<ContainerOp, String>,
    exit_code: i64,
    output: Vec<OutputLine>,
    block_wait: bool,
    run_count: usize,
}

/// Deterministic [`ContainerService`] double.
#[derive(Debug, Default)]
pub struct FakeContainerService {
    state: Mutex<ContainerState>,
    released: Condvar,
}

impl FakeContainerService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit status returned by `wait`. Defaults to 0.
    pub fn with_exit_code(self, code: i64) -> Self {
        self.lock().exit_code = code;
        self
    }

    /// Lines sent to the sink on `attach`.
    pub fn with_output<I: IntoIterator<Item = OutputLine>>(self, lines: I) -> Self {
        self.lock().output = lines.into_iter().collect();
        self
    }

    /// Make `op` fail with a daemon error carrying `message`.
    pub fn failing(self, op: ContainerOp, message: impl Into<String>) -> Self {
        self.lock().failures.insert(op, message.into());
        self
    }

    /// Make `wait` block until the container is stopped or removed, like a
    /// build that never finishes on its own.
    pub fn with_blocking_wait(self) -> Self {
        self.lock().block_wait = true;
        self
    }

    pub fn created(&self) -> Vec<(ContainerHandle, ImageConfig)> {
        self.lock().created.clone()
    }

    pub fn started(&self, handle: &ContainerHandle) -> Option<HostConfig> {
        self.lock().started.get(handle).copied()
    }

    pub fn attached(&self) -> Vec<ContainerHandle> {
        self.lock().attached.clone()
    }

    pub fn waited(&self) -> Vec<ContainerHandle> {
        self.lock().waited.clone()
    }

    pub fn stopped(&self) -> Vec<ContainerHandle> {
        self.lock().stopped.clone()
    }

    pub fn removed(&self) -> Vec<ContainerHandle> {
        self.lock().removed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn check<Op: Eq + std::hash::Hash>(
    failures: &HashMap<Op, String>,
    op: Op,
) -> Result<(), RuntimeError> {
    match failures.get(&op) {
        Some(message) => Err(RuntimeError::Daemon(message.clone())),
        None => Ok(()),
    }
}

impl ContainerService for FakeContainerService {
    fn create(&self, config: &ImageConfig) -> Result<ContainerHandle, RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ContainerOp::Create)?;

        let handle = ContainerHandle::new(format!("run-{}", state.run_count));
        state.run_count += 1;
        state.created.push((handle.clone(), config.clone()));
        Ok(handle)
    }

    fn start(&self, handle: &ContainerHandle, host: &HostConfig) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ContainerOp::Start)?;
        state.started.insert(handle.clone(), *host);
        Ok(())
    }

    fn attach(&self, handle: &ContainerHandle, output: &OutputSink) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ContainerOp::Attach)?;
        state.attached.push(handle.clone());
        for line in &state.output {
            let _ = output.send(line.clone());
        }
        Ok(())
    }

    fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ContainerOp::Wait)?;
        state.waited.push(handle.clone());

        if !state.block_wait {
            return Ok(state.exit_code);
        }
        while !state.released.contains(handle) {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
        Ok(STOPPED_EXIT_CODE)
    }

    fn stop(&self, handle: &ContainerHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ContainerOp::Stop)?;
        state.stopped.push(handle.clone());
        state.released.insert(handle.clone());
        self.released.notify_all();
        Ok(())
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ContainerOp::Remove)?;
        state.removed.push(handle.clone());
        state.released.insert(handle.clone());
        self.released.notify_all();
        Ok(())
    }
}

/// An image built through [`FakeImageService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub tag: String,
    /// Contents of the build context's `Dockerfile`.
    pub recipe: String,
}

#[derive(Debug, Default)]
struct ImageState {
    images: HashMap<String, ImageMetadata>,
    inspected: Vec<String>,
    pulled: Vec<String>,
    removed: Vec<String>,
    built: Vec<BuiltImage>,
    failures: HashMap<ImageOp, String>,
    build_output: Vec<OutputLine>,
    failing_step: Option<i64>,
}

/// Deterministic [`ImageService`] double.
#[derive(Debug, Default)]
pub struct FakeImageService {
    state: Mutex<ImageState>,
}

impl FakeImageService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `reference` known to `inspect`.
    pub fn with_image(self, reference: impl Into<String>) -> Self {
        let reference = reference.into();
        let meta = ImageMetadata {
            id: format!("sha256:{reference}"),
            repo_tags: vec![reference.clone()],
            ..ImageMetadata::default()
        };
        self.lock().images.insert(reference, meta);
        self
    }

    pub fn failing(self, op: ImageOp, message: impl Into<String>) -> Self {
        self.lock().failures.insert(op, message.into());
        self
    }

    /// Lines sent to the sink on `build`.
    pub fn with_build_output<I: IntoIterator<Item = OutputLine>>(self, lines: I) -> Self {
        self.lock().build_output = lines.into_iter().collect();
        self
    }

    /// Make `build` fail as if a `RUN` step exited with `code`, after
    /// sending the build output.
    pub fn with_failing_step(self, code: i64) -> Self {
        self.lock().failing_step = Some(code);
        self
    }

    pub fn built(&self) -> Vec<BuiltImage> {
        self.lock().built.clone()
    }

    pub fn inspected(&self) -> Vec<String> {
        self.lock().inspected.clone()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.lock().pulled.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ImageState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ImageService for FakeImageService {
    fn build(
        &self,
        tag: &str,
        context_dir: &Path,
        output: &OutputSink,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ImageOp::Build)?;

        let recipe = std::fs::read_to_string(context_dir.join("Dockerfile"))?;
        for line in &state.build_output {
            let _ = output.send(line.clone());
        }
        if let Some(code) = state.failing_step {
            return Err(RuntimeError::StepFailed {
                code,
                detail: format!("returned a non-zero code: {code}"),
            });
        }
        state.built.push(BuiltImage {
            tag: tag.to_string(),
            recipe,
        });
        state.images.insert(
            tag.to_string(),
            ImageMetadata {
                id: format!("sha256:{tag}"),
                repo_tags: vec![tag.to_string()],
                ..ImageMetadata::default()
            },
        );
        Ok(())
    }

    fn inspect(&self, reference: &str) -> Result<ImageMetadata, RuntimeError> {
        let mut state = self.lock();
        state.inspected.push(reference.to_string());
        state
            .images
            .get(reference)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("no such image: {reference}")))
    }

    fn pull(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ImageOp::Pull)?;
        state.pulled.push(reference.to_string());
        state.images.insert(
            reference.to_string(),
            ImageMetadata {
                id: format!("sha256:{reference}"),
                ..ImageMetadata::default()
            },
        );
        Ok(())
    }

    fn remove(&self, reference: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        check(&state.failures, ImageOp::Remove)?;
        state.removed.push(reference.to_string());
        state.images.remove(reference);
        Ok(())
    }
}
