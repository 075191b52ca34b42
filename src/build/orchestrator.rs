use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::docker::{
    CancelToken, ContainerHandle, ContainerService, HostConfig, ImageService, OutputLine,
    OutputSink, RuntimeError,
};
use crate::recipe::{self, Recipe};
use crate::repo::Repo;

use super::context::BuildContext;
use super::types::{
    BuildError, BuildEvent, BuildInput, BuildOptions, BuildReport, BuildState, LifecycleStage,
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long to keep draining output after teardown.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// Drives one build from recipe to teardown.
///
/// An orchestrator is single-use: [`run`](Self::run) consumes it. Construct
/// a fresh one per build; the services may be shared between orchestrators.
pub struct Orchestrator {
    images: Arc<dyn ImageService>,
    containers: Arc<dyn ContainerService>,
    options: BuildOptions,
    events: Option<Sender<BuildEvent>>,
    state: BuildState,
    log: String,
    warnings: Vec<String>,
}

/// Facts about a container that ran to completion.
struct Completed {
    handle: ContainerHandle,
    privileged: bool,
    exit_code: i64,
}

impl Orchestrator {
    pub fn new(images: Arc<dyn ImageService>, containers: Arc<dyn ContainerService>) -> Self {
        Self {
            images,
            containers,
            options: BuildOptions::default(),
            events: None,
            state: BuildState::Idle,
            log: String::new(),
            warnings: Vec::new(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    /// Stream [`BuildEvent`]s to `events` while the build runs.
    pub fn with_events(mut self, events: Sender<BuildEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the build.
    ///
    /// `Ok` means the container ran to completion; check
    /// [`BuildReport::succeeded`] for the script's verdict. `Err` means the
    /// build system itself failed. Any container created along the way has
    /// been stopped and removed by the time this returns.
    pub fn run(mut self, input: &BuildInput, cancel: &CancelToken) -> Result<BuildReport, BuildError> {
        let started = Instant::now();
        let result = self.drive(input, cancel, started);

        match &result {
            Ok(report) if report.succeeded() => {
                info!(container = %report.container, "build succeeded");
                self.transition(BuildState::Succeeded);
            }
            Ok(report) => {
                info!(container = %report.container, exit_code = report.exit_code, "build script failed");
                self.transition(BuildState::Failed);
            }
            Err(e) if e.exit_code().is_some() => {
                info!(error = %e, "build script failed during image build");
                self.transition(BuildState::Failed);
            }
            Err(e) => {
                warn!(error = %e, kind = ?e.kind(), "build errored");
                self.transition(BuildState::Failed);
            }
        }
        result
    }

    fn drive(
        &mut self,
        input: &BuildInput,
        cancel: &CancelToken,
        started: Instant,
    ) -> Result<BuildReport, BuildError> {
        let recipe = recipe::generate(&input.repo, &input.script, &input.env)?;
        self.transition(BuildState::RecipeGenerated);
        check_cancelled(cancel)?;

        let (out_tx, out_rx) = mpsc::channel();
        let tag = self.options.image_tag();
        if let Err(e) = self.build_image(&tag, &recipe, input, &out_tx, &out_rx) {
            drop(out_tx);
            self.finish_output(out_rx);
            self.write_log();
            return Err(e);
        }
        self.transition(BuildState::ImageBuilt);

        let outcome = self.run_container(&tag, &input.repo, cancel, &out_tx, &out_rx);

        if !self.options.keep_image {
            if let Err(e) = self.images.remove(&tag) {
                self.warn(format!("failed to remove image {tag}: {e}"));
            }
        }
        drop(out_tx);
        self.finish_output(out_rx);
        self.write_log();

        let completed = outcome?;
        Ok(BuildReport {
            container: completed.handle,
            image: tag,
            privileged: completed.privileged,
            exit_code: completed.exit_code,
            log: std::mem::take(&mut self.log),
            recipe: recipe.render(),
            warnings: std::mem::take(&mut self.warnings),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn build_image(
        &mut self,
        tag: &str,
        recipe: &Recipe,
        input: &BuildInput,
        out_tx: &OutputSink,
        out_rx: &Receiver<OutputLine>,
    ) -> Result<(), BuildError> {
        self.ensure_base_image(&input.script.image)?;

        let context = BuildContext::materialize(recipe, input.source_dir.as_deref())
            .map_err(BuildError::Context)?;
        debug!(tag, context = %context.path().display(), "building image");

        let built = self.images.build(tag, context.path(), out_tx);
        self.drain_output(out_rx);
        built.map_err(|source| match source.step_exit_code() {
            Some(exit_code) => BuildError::StepFailed {
                tag: tag.to_string(),
                exit_code,
                source,
            },
            None => BuildError::ImageBuild {
                tag: tag.to_string(),
                source,
            },
        })
    }

    /// Pull the base image unless the daemon already has it.
    fn ensure_base_image(&mut self, image: &str) -> Result<(), BuildError> {
        match self.images.inspect(image) {
            Ok(meta) => {
                debug!(image, id = %meta.id, "base image present");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!(image, "pulling base image");
                self.images.pull(image).map_err(|source| BuildError::BaseImage {
                    image: image.to_string(),
                    source,
                })
            }
            Err(source) => Err(BuildError::BaseImage {
                image: image.to_string(),
                source,
            }),
        }
    }

    fn run_container(
        &mut self,
        tag: &str,
        repo: &Repo,
        cancel: &CancelToken,
        out_tx: &OutputSink,
        out_rx: &Receiver<OutputLine>,
    ) -> Result<Completed, BuildError> {
        check_cancelled(cancel)?;

        let privileged = repo.should_run_privileged();
        info!(
            privileged,
            owner_opt_in = repo.privileged,
            pull_request = repo.pull_request_id().unwrap_or_default(),
            "privilege decision"
        );

        let config = self.options.image_config(tag);
        let handle = self
            .containers
            .create(&config)
            .map_err(|source| BuildError::Container {
                stage: LifecycleStage::Create,
                handle: None,
                source,
            })?;
        let guard = ContainerGuard::new(
            Arc::clone(&self.containers),
            handle.clone(),
            self.options.stop_timeout,
        );
        self.transition(BuildState::ContainerCreated);

        let exit = self.run_guarded(&handle, privileged, cancel, out_tx, out_rx);

        for warning in guard.release() {
            self.warn(warning);
        }
        self.transition(BuildState::TornDown);

        exit.map(|exit_code| Completed {
            handle,
            privileged,
            exit_code,
        })
    }

    /// Start, attach and wait. The caller tears the container down whatever
    /// this returns.
    fn run_guarded(
        &mut self,
        handle: &ContainerHandle,
        privileged: bool,
        cancel: &CancelToken,
        out_tx: &OutputSink,
        out_rx: &Receiver<OutputLine>,
    ) -> Result<i64, BuildError> {
        check_cancelled(cancel)?;

        self.containers
            .start(handle, &HostConfig { privileged })
            .map_err(|source| lifecycle_error(LifecycleStage::Start, handle, source))?;
        self.transition(BuildState::ContainerStarted);

        if let Err(e) = self.containers.attach(handle, out_tx) {
            self.warn(format!("failed to attach to container {handle}: {e}"));
        }
        self.transition(BuildState::Attached);

        let exit_code = self.wait(handle, cancel, out_rx)?;
        self.transition(BuildState::Waited);
        Ok(exit_code)
    }

    /// Wait for the container on a helper thread so cancellation and the
    /// time limit can interrupt it. An interrupted wait is abandoned; the
    /// teardown that follows stops the container and releases it.
    fn wait(
        &mut self,
        handle: &ContainerHandle,
        cancel: &CancelToken,
        out_rx: &Receiver<OutputLine>,
    ) -> Result<i64, BuildError> {
        let (tx, rx) = mpsc::channel();
        let containers = Arc::clone(&self.containers);
        let waited = handle.clone();
        std::thread::spawn(move || {
            let _ = tx.send(containers.wait(&waited));
        });

        let deadline = self.options.timeout.map(|limit| (Instant::now() + limit, limit));
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(result) => {
                    self.drain_output(out_rx);
                    return result
                        .map_err(|source| lifecycle_error(LifecycleStage::Wait, handle, source));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(lifecycle_error(
                        LifecycleStage::Wait,
                        handle,
                        RuntimeError::Protocol("wait ended without a result".into()),
                    ));
                }
            }

            self.drain_output(out_rx);
            if cancel.is_cancelled() {
                info!(container = %handle, "build cancelled while waiting");
                return Err(BuildError::Cancelled);
            }
            if let Some((at, limit)) = deadline {
                if Instant::now() >= at {
                    warn!(container = %handle, limit_secs = limit.as_secs(), "build timed out");
                    return Err(BuildError::TimedOut(limit));
                }
            }
        }
    }

    fn transition(&mut self, next: BuildState) {
        debug!(from = %self.state, to = %next, "build state");
        self.state = next;
        self.emit(BuildEvent::StateChanged(next));
    }

    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.emit(BuildEvent::Warning(message.clone()));
        self.warnings.push(message);
    }

    fn emit(&self, event: BuildEvent) {
        if let Some(tx) = &self.events {
            // Receiver may be dropped; ignore send errors.
            let _ = tx.send(event);
        }
    }

    fn record(&mut self, line: OutputLine) {
        self.log.push_str(line.text());
        self.log.push('\n');
        self.emit(BuildEvent::Log(line));
    }

    fn drain_output(&mut self, rx: &Receiver<OutputLine>) {
        while let Ok(line) = rx.try_recv() {
            self.record(line);
        }
    }

    /// Collect output still in flight after teardown.
    fn finish_output(&mut self, rx: Receiver<OutputLine>) {
        while let Ok(line) = rx.recv_timeout(OUTPUT_GRACE) {
            self.record(line);
        }
    }

    fn write_log(&mut self) {
        let Some(path) = self.options.log_path.clone() else {
            return;
        };
        if let Err(e) = std::fs::write(&path, &self.log) {
            self.warn(format!("failed to write build log to {}: {e}", path.display()));
        }
    }
}

/// Owns a created container and guarantees it is stopped and removed.
///
/// [`release`](Self::release) tears down and reports failures; dropping an
/// unreleased guard tears down and logs them.
struct ContainerGuard {
    containers: Arc<dyn ContainerService>,
    handle: ContainerHandle,
    stop_timeout: Duration,
    released: bool,
}

impl ContainerGuard {
    fn new(
        containers: Arc<dyn ContainerService>,
        handle: ContainerHandle,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            containers,
            handle,
            stop_timeout,
            released: false,
        }
    }

    fn release(mut self) -> Vec<String> {
        self.released = true;
        self.teardown()
    }

    fn teardown(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        debug!(container = %self.handle, "tearing down container");
        if let Err(e) = self.containers.stop(&self.handle, self.stop_timeout) {
            warnings.push(format!("failed to stop container {}: {e}", self.handle));
        }
        if let Err(e) = self.containers.remove(&self.handle) {
            warnings.push(format!("failed to remove container {}: {e}", self.handle));
        }
        warnings
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.released {
            for warning in self.teardown() {
                warn!("{warning}");
            }
        }
    }
}

fn check_cancelled(cancel: &CancelToken) -> Result<(), BuildError> {
    if cancel.is_cancelled() {
        Err(BuildError::Cancelled)
    } else {
        Ok(())
    }
}

fn lifecycle_error(
    stage: LifecycleStage,
    handle: &ContainerHandle,
    source: RuntimeError,
) -> BuildError {
    BuildError::Container {
        stage,
        handle: Some(handle.clone()),
        source,
    }
}

/// Run a build on a background thread.
///
/// Returns a receiver that streams [`BuildEvent`]s. The final event is
/// always either `Completed` or `Aborted`.
pub fn spawn_build(
    orchestrator: Orchestrator,
    input: BuildInput,
    cancel: CancelToken,
) -> Receiver<BuildEvent> {
    let (tx, rx) = mpsc::channel();
    let orchestrator = orchestrator.with_events(tx.clone());
    std::thread::spawn(move || {
        let event = match orchestrator.run(&input, &cancel) {
            Ok(report) => BuildEvent::Completed(report),
            Err(e) => BuildEvent::Aborted(e),
        };
        let _ = tx.send(event);
    });
    rx
}
