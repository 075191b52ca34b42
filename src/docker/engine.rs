use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, warn};

use super::run::{command_line, run_streaming, spawn_streaming};
use super::service::{ContainerService, ImageService, RuntimeError};
use super::types::{ContainerHandle, HostConfig, ImageConfig, ImageMetadata, OutputSink};

/// Container/Image Service backed by the `docker` command line.
///
/// The CLI fixes host settings when a container is created, so [`create`]
/// only reserves a container name and records the image configuration; the
/// container reaches the daemon in [`start`], where the host configuration is
/// applied.
///
/// [`create`]: ContainerService::create
/// [`start`]: ContainerService::start
#[derive(Debug)]
pub struct DockerCli {
    binary: String,
    host: Option<String>,
    pending: Mutex<HashMap<ContainerHandle, ImageConfig>>,
    followers: Mutex<HashMap<ContainerHandle, Child>>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, host: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            host,
            pending: Mutex::new(HashMap::new()),
            followers: Mutex::new(HashMap::new()),
        }
    }

    /// Verify that the Docker daemon is reachable.
    pub fn ensure_available(&self) -> Result<()> {
        let status = self
            .command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("failed to invoke `{}`: is it installed and on PATH?", self.binary))?;

        if !status.success() {
            bail!("docker daemon is not reachable (exit {})", status);
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(host) = &self.host {
            cmd.arg("--host").arg(host);
        }
        cmd
    }

    /// Run a docker subcommand and return its trimmed stdout.
    fn output(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let mut cmd = self.command();
        cmd.args(args);
        debug!(command = %command_line(&cmd), "running docker");

        let output = cmd.stdin(Stdio::null()).output()?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_string());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_not_found(&stderr) {
            Err(RuntimeError::NotFound(stderr))
        } else {
            Err(RuntimeError::Daemon(format!(
                "`docker {}` exited with {}: {stderr}",
                args.first().copied().unwrap_or_default(),
                output.status
            )))
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<ContainerHandle, ImageConfig>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn followers(&self) -> MutexGuard<'_, HashMap<ContainerHandle, Child>> {
        self.followers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reap_follower(&self, handle: &ContainerHandle) {
        if let Some(mut child) = self.followers().remove(handle) {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker", None)
    }
}

impl ImageService for DockerCli {
    fn build(
        &self,
        tag: &str,
        context_dir: &Path,
        output: &OutputSink,
    ) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["build", "--rm", "--tag", tag])
            .arg(context_dir)
            .stdin(Stdio::null());
        run_streaming(cmd, output).map_err(classify_build_failure)
    }

    fn inspect(&self, reference: &str) -> Result<ImageMetadata, RuntimeError> {
        let raw = self.output(&["image", "inspect", "--format", "{{json .}}", reference])?;
        serde_json::from_str(&raw)
            .map_err(|e| RuntimeError::Protocol(format!("image inspect for {reference}: {e}")))
    }

    fn pull(&self, reference: &str) -> Result<(), RuntimeError> {
        self.output(&["pull", "--quiet", reference]).map(drop)
    }

    fn remove(&self, reference: &str) -> Result<(), RuntimeError> {
        self.output(&["image", "rm", reference]).map(drop)
    }
}

impl ContainerService for DockerCli {
    fn create(&self, config: &ImageConfig) -> Result<ContainerHandle, RuntimeError> {
        let handle = ContainerHandle::new(format!("shipyard-{}", uuid::Uuid::new_v4().simple()));
        self.pending().insert(handle.clone(), config.clone());
        Ok(handle)
    }

    fn start(&self, handle: &ContainerHandle, host: &HostConfig) -> Result<(), RuntimeError> {
        let config = self
            .pending()
            .remove(handle)
            .ok_or_else(|| RuntimeError::NotFound(format!("no such container: {handle}")))?;

        let args = create_args(handle, &config, host);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.output(&args)?;
        self.output(&["start", handle.as_str()]).map(drop)
    }

    fn attach(&self, handle: &ContainerHandle, output: &OutputSink) -> Result<(), RuntimeError> {
        let mut cmd = self.command();
        cmd.args(["logs", "--follow", handle.as_str()])
            .stdin(Stdio::null());
        // Reader threads end on their own once the log stream closes.
        let (child, _readers, _tail) = spawn_streaming(cmd, output)?;
        self.followers().insert(handle.clone(), child);
        Ok(())
    }

    fn wait(&self, handle: &ContainerHandle) -> Result<i64, RuntimeError> {
        let raw = self.output(&["wait", handle.as_str()])?;
        raw.lines()
            .last()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| RuntimeError::Protocol(format!("unexpected `docker wait` output: {raw:?}")))
    }

    fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError> {
        if self.pending().contains_key(handle) {
            return Ok(());
        }
        let secs = timeout.as_secs().to_string();
        self.output(&["stop", "--time", &secs, handle.as_str()])
            .map(drop)
    }

    fn remove(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        if self.pending().remove(handle).is_some() {
            return Ok(());
        }
        let result = self.output(&["rm", "--force", "--volumes", handle.as_str()]);
        self.reap_follower(handle);
        if let Err(e) = &result {
            warn!(container = %handle, error = %e, "docker rm failed");
        }
        result.map(drop)
    }
}

/// Arguments for `docker create`. Host settings are applied only here.
fn create_args(handle: &ContainerHandle, config: &ImageConfig, host: &HostConfig) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".into(), handle.to_string()];
    if host.privileged {
        args.push("--privileged".into());
    }
    if let Some(entrypoint) = &config.entrypoint {
        // `--entrypoint` takes a single executable; extra words go before cmd.
        let mut words = entrypoint.iter();
        if let Some(program) = words.next() {
            args.push("--entrypoint".into());
            args.push(program.clone());
            args.push(config.image.clone());
            args.extend(words.cloned());
            args.extend(config.cmd.iter().cloned());
            return args;
        }
        args.push("--entrypoint".into());
        args.push(String::new());
    }
    args.push(config.image.clone());
    args.extend(config.cmd.iter().cloned());
    args
}

/// Markers docker prints before the exit status of a failed `RUN` step,
/// for the classic builder and for BuildKit.
const STEP_FAILURE_MARKERS: [&str; 2] = [
    "returned a non-zero code: ",
    "did not complete successfully: exit code: ",
];

/// A failed `docker build` whose output names a step exit status is the
/// build script failing, not the daemon.
fn classify_build_failure(err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::Daemon(detail) => match step_exit_code(&detail) {
            Some(code) => RuntimeError::StepFailed { code, detail },
            None => RuntimeError::Daemon(detail),
        },
        other => other,
    }
}

fn step_exit_code(output: &str) -> Option<i64> {
    STEP_FAILURE_MARKERS
        .iter()
        .filter_map(|marker| {
            let at = output.rfind(marker)? + marker.len();
            let digits: String = output[at..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            Some((at, digits.parse::<i64>().ok()?))
        })
        .max_by_key(|(at, _)| *at)
        .map(|(_, code)| code)
}

fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such image")
        || lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("not found")
}
