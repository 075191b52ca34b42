// Task-item contract: the unit of work a queue hands to a build worker.
// Scheduling, retries and persistence belong to whatever sits behind
// `TaskQueue`; this module only defines the item and an in-process channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::build::{BuildError, BuildInput, BuildOptions, BuildReport, Orchestrator};
use crate::docker::{CancelToken, ContainerService, ImageService};
use crate::repo::{EnvVars, Repo};
use crate::script::BuildScript;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    pub branch: String,
    #[serde(default)]
    pub author: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub number: u64,
    /// Short identifier of the build, used in log fields.
    #[serde(default)]
    pub slug: String,
}

/// One queued build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTask {
    pub repo: Repo,
    pub commit: Commit,
    pub build: BuildInfo,
    pub script: BuildScript,
    /// Checked-out source tree, when the queue has already fetched it.
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
}

impl BuildTask {
    /// Environment computed from the commit and build metadata.
    pub fn environment(&self) -> EnvVars {
        let mut env = EnvVars::new()
            .with("DRONE_COMMIT", &self.commit.hash)
            .with("DRONE_BRANCH", &self.commit.branch)
            .with("DRONE_BUILD_NUMBER", self.build.number.to_string());
        if let Some(pr) = self.repo.pull_request_id() {
            env.insert("DRONE_PR", pr);
        }
        env
    }

    pub fn into_input(self) -> BuildInput {
        let env = self.environment();
        let input = BuildInput::new(self.repo, self.script).with_env(env);
        match self.source_dir {
            Some(dir) => input.with_source_dir(dir),
            None => input,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task queue is closed")]
    Closed,
}

/// Accepts build tasks for later execution.
pub trait TaskQueue {
    fn add(&self, task: BuildTask) -> Result<(), QueueError>;
}

/// In-process queue backed by an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: Sender<BuildTask>,
}

impl ChannelQueue {
    /// Returns the queue and the receiving end a [`Worker`] drains.
    pub fn new() -> (Self, Receiver<BuildTask>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl TaskQueue for ChannelQueue {
    fn add(&self, task: BuildTask) -> Result<(), QueueError> {
        self.tx.send(task).map_err(|_| QueueError::Closed)
    }
}

/// Outcome of one task processed by a [`Worker`].
#[derive(Debug)]
pub struct TaskOutcome {
    pub build: BuildInfo,
    pub result: Result<BuildReport, BuildError>,
}

/// Runs queued tasks one after another, each on a fresh [`Orchestrator`].
pub struct Worker {
    images: Arc<dyn ImageService>,
    containers: Arc<dyn ContainerService>,
    options: BuildOptions,
    cancel: CancelToken,
}

impl Worker {
    pub fn new(
        images: Arc<dyn ImageService>,
        containers: Arc<dyn ContainerService>,
        options: BuildOptions,
    ) -> Self {
        Self {
            images,
            containers,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Token that cancels the running build and stops the worker loop.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn process(&self, task: BuildTask) -> TaskOutcome {
        let build = task.build.clone();
        info!(
            build = build.number,
            slug = %build.slug,
            repo = %task.repo.location,
            origin = task.repo.classify_origin().as_str(),
            commit = %task.commit.hash,
            "starting build"
        );

        let result = Orchestrator::new(Arc::clone(&self.images), Arc::clone(&self.containers))
            .with_options(self.options.clone())
            .run(&task.into_input(), &self.cancel);

        match &result {
            Ok(report) => info!(
                build = build.number,
                exit_code = report.exit_code,
                duration_ms = report.duration_ms,
                "build finished"
            ),
            Err(e) => match e.exit_code() {
                Some(exit_code) => info!(build = build.number, exit_code, "build step failed"),
                None => warn!(build = build.number, error = %e, "build errored"),
            },
        }
        TaskOutcome { build, result }
    }

    /// Drain `tasks` until every sender is dropped or the worker is cancelled.
    pub fn run(&self, tasks: Receiver<BuildTask>) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::new();
        for task in tasks {
            if self.cancel.is_cancelled() {
                info!(build = task.build.number, "worker cancelled, dropping task");
                break;
            }
            outcomes.push(self.process(task));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{FakeContainerService, FakeImageService};

    fn task(number: u64) -> BuildTask {
        BuildTask {
            repo: Repo::new("git://github.com/drone/drone").with_privileged(true),
            commit: Commit {
                hash: "d34db33f".into(),
                branch: "master".into(),
                author: "octocat".into(),
            },
            build: BuildInfo {
                number,
                slug: format!("build-{number}"),
            },
            script: BuildScript::new("some-image").with_commands(["make"]),
            source_dir: None,
        }
    }

    #[test]
    fn environment_carries_commit_and_build() {
        let env = task(42).environment();
        let pairs: Vec<_> = env.iter().collect();
        assert_eq!(
            pairs,
            vec![
                ("DRONE_COMMIT", "d34db33f"),
                ("DRONE_BRANCH", "master"),
                ("DRONE_BUILD_NUMBER", "42"),
            ]
        );
    }

    #[test]
    fn environment_includes_pull_request() {
        let mut t = task(1);
        t.repo = t.repo.with_pull_request("17");
        assert_eq!(t.environment().get("DRONE_PR"), Some("17"));
    }

    #[test]
    fn closed_queue_rejects_tasks() {
        let (queue, rx) = ChannelQueue::new();
        drop(rx);
        assert_eq!(queue.add(task(1)), Err(QueueError::Closed));
    }

    #[test]
    fn worker_builds_each_task_in_its_own_container() {
        let images = Arc::new(FakeImageService::new().with_image("some-image"));
        let containers = Arc::new(FakeContainerService::new());
        let worker = Worker::new(images.clone(), containers.clone(), BuildOptions::default());

        let (queue, rx) = ChannelQueue::new();
        queue.add(task(1)).unwrap();
        queue.add(task(2)).unwrap();
        drop(queue);

        let outcomes = worker.run(rx);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.as_ref().is_ok_and(|r| r.succeeded())));
        assert_eq!(containers.created().len(), 2);
        assert_eq!(containers.removed().len(), 2);

        let recipe = &images.built()[1].recipe;
        assert!(recipe.contains("ENV DRONE_BUILD_NUMBER 2\n"));
        assert!(recipe.contains("ENV DRONE_PRIVILEGED true\n"));
    }

    #[test]
    fn cancelled_worker_stops_draining() {
        let images = Arc::new(FakeImageService::new().with_image("some-image"));
        let containers = Arc::new(FakeContainerService::new());
        let worker = Worker::new(images, containers.clone(), BuildOptions::default());
        worker.cancel_token().cancel();

        let (queue, rx) = ChannelQueue::new();
        queue.add(task(1)).unwrap();
        drop(queue);

        assert!(worker.run(rx).is_empty());
        assert!(containers.created().is_empty());
    }

    #[test]
    fn task_deserializes_from_yaml() {
        let raw = "\
repo:
  location: git://github.com/drone/drone
  working_dir: /var/cache/drone/src/github.com/drone/drone
  pull_request: '9'
commit: { hash: abc, branch: main }
build: { number: 3 }
script:
  image: golang
  script: [go test ./...]
";
        let t: BuildTask = serde_yaml::from_str(raw).unwrap();
        assert_eq!(t.repo.pull_request_id(), Some("9"));
        assert_eq!(t.script.commands, vec!["go test ./..."]);
        assert_eq!(t.build.number, 3);
    }
}
