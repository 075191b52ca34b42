use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::docker::{ContainerHandle, ImageConfig, OutputLine, RuntimeError};
use crate::recipe::RecipeError;
use crate::repo::{EnvVars, Repo};
use crate::script::BuildScript;

/// Everything one build needs.
#[derive(Debug, Clone)]
pub struct BuildInput {
    pub repo: Repo,
    pub script: BuildScript,
    /// Computed environment (commit hash, build number, ...).
    pub env: EnvVars,
    /// Checked-out source tree. An empty tree is used when unset.
    pub source_dir: Option<PathBuf>,
}

impl BuildInput {
    pub fn new(repo: Repo, script: BuildScript) -> Self {
        Self {
            repo,
            script,
            env: EnvVars::new(),
            source_dir: None,
        }
    }

    pub fn with_env(mut self, env: EnvVars) -> Self {
        self.env = env;
        self
    }

    pub fn with_source_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.source_dir = Some(dir.into());
        self
    }
}

/// Orchestrator settings shared by every build of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOptions {
    pub image_prefix: String,
    /// Upper bound on the wait for the container. `None` waits forever.
    pub timeout: Option<Duration>,
    pub stop_timeout: Duration,
    pub keep_image: bool,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Vec<String>,
    pub log_path: Option<PathBuf>,
}

impl BuildOptions {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let entrypoint = cfg
            .entrypoint
            .as_deref()
            .map(shell_words::split)
            .transpose()
            .context("invalid entrypoint override")?;
        let cmd = cfg
            .command
            .as_deref()
            .map(shell_words::split)
            .transpose()
            .context("invalid command override")?
            .unwrap_or_default();

        Ok(Self {
            image_prefix: cfg.image_prefix.clone(),
            timeout: cfg.build_timeout(),
            stop_timeout: cfg.stop_timeout(),
            keep_image: cfg.keep_image,
            entrypoint,
            cmd,
            log_path: cfg.log_path.clone(),
        })
    }

    /// A fresh, unique tag for a per-build image.
    pub fn image_tag(&self) -> String {
        let prefix = self.image_prefix.trim().to_ascii_lowercase();
        let prefix = if prefix.is_empty() { "shipyard" } else { prefix.as_str() };
        format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
    }

    /// Container configuration for the image `tag`, with the base overrides.
    pub fn image_config(&self, tag: &str) -> ImageConfig {
        ImageConfig {
            image: tag.to_string(),
            entrypoint: self.entrypoint.clone(),
            cmd: self.cmd.clone(),
        }
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        let cfg = Config::default();
        Self {
            image_prefix: cfg.image_prefix.clone(),
            timeout: cfg.build_timeout(),
            stop_timeout: cfg.stop_timeout(),
            keep_image: cfg.keep_image,
            entrypoint: None,
            cmd: Vec::new(),
            log_path: None,
        }
    }
}

/// Orchestrator state. Linear, with every path from `ContainerCreated` on
/// passing through `TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildState {
    Idle,
    RecipeGenerated,
    ImageBuilt,
    ContainerCreated,
    ContainerStarted,
    Attached,
    Waited,
    TornDown,
    Succeeded,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildState::Idle => "idle",
            BuildState::RecipeGenerated => "recipe-generated",
            BuildState::ImageBuilt => "image-built",
            BuildState::ContainerCreated => "container-created",
            BuildState::ContainerStarted => "container-started",
            BuildState::Attached => "attached",
            BuildState::Waited => "waited",
            BuildState::TornDown => "torn-down",
            BuildState::Succeeded => "succeeded",
            BuildState::Failed => "failed",
        }
    }
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container lifecycle call that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Create,
    Start,
    Wait,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecycleStage::Create => "create",
            LifecycleStage::Start => "start",
            LifecycleStage::Wait => "wait",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Configuration,
    /// A script step failed while the image was built.
    Script,
    ImageBuild,
    ContainerLifecycle,
    Interrupted,
}

/// The build ended without a container run.
///
/// Every variant but [`BuildError::StepFailed`] means the build system failed.
/// `StepFailed` is the script's own failure, caught while its commands ran as
/// image build steps; a script that fails inside the container is reported
/// through [`BuildReport::succeeded`] instead.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build configuration: {0}")]
    Config(#[from] RecipeError),

    #[error("failed to prepare build context: {0}")]
    Context(#[source] std::io::Error),

    #[error("base image {image} unavailable: {source}")]
    BaseImage {
        image: String,
        #[source]
        source: RuntimeError,
    },

    #[error("build step of image {tag} exited with code {exit_code}")]
    StepFailed {
        tag: String,
        exit_code: i64,
        #[source]
        source: RuntimeError,
    },

    #[error("image build {tag} failed: {source}")]
    ImageBuild {
        tag: String,
        #[source]
        source: RuntimeError,
    },

    #[error("container {stage} failed: {source}")]
    Container {
        stage: LifecycleStage,
        handle: Option<ContainerHandle>,
        #[source]
        source: RuntimeError,
    },

    #[error("build exceeded the {}s time limit", .0.as_secs())]
    TimedOut(Duration),

    #[error("build cancelled")]
    Cancelled,
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BuildError::Config(_) => ErrorKind::Configuration,
            BuildError::StepFailed { .. } => ErrorKind::Script,
            BuildError::Context(_) | BuildError::BaseImage { .. } | BuildError::ImageBuild { .. } => {
                ErrorKind::ImageBuild
            }
            BuildError::Container { .. } => ErrorKind::ContainerLifecycle,
            BuildError::TimedOut(_) | BuildError::Cancelled => ErrorKind::Interrupted,
        }
    }

    /// Exit status of the failed script step, for script failures.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            BuildError::StepFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Result of a build whose container ran to completion.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub container: ContainerHandle,
    pub image: String,
    pub privileged: bool,
    pub exit_code: i64,
    pub log: String,
    pub recipe: String,
    /// Non-fatal problems: attach and teardown failures.
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

impl BuildReport {
    /// The exit status is the authoritative success signal.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    pub fn status(&self) -> BuildState {
        if self.succeeded() {
            BuildState::Succeeded
        } else {
            BuildState::Failed
        }
    }
}

/// Events streamed while a build runs.
#[derive(Debug)]
pub enum BuildEvent {
    StateChanged(BuildState),
    Log(OutputLine),
    Warning(String),
    Completed(BuildReport),
    Aborted(BuildError),
}
