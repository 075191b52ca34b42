use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Docker CLI executable.
    pub docker_binary: String,
    /// Remote daemon address, passed as `--host`. Falls back to the CLI's own
    /// resolution (`DOCKER_HOST`, contexts) when unset.
    pub docker_host: Option<String>,
    /// Maximum build duration in seconds. 0 disables the limit.
    pub build_timeout: u64,
    /// Grace period in seconds before `docker stop` kills the container.
    pub stop_timeout: u64,
    /// Prefix of per-build image tags.
    pub image_prefix: String,
    /// Keep the per-build image after the build.
    pub keep_image: bool,
    /// Container entrypoint override, as a shell-words string.
    pub entrypoint: Option<String>,
    /// Container command override, as a shell-words string.
    pub command: Option<String>,
    /// File receiving the captured build log.
    pub log_path: Option<PathBuf>,
}

impl Config {
    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout > 0).then(|| Duration::from_secs(self.build_timeout))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            docker_host: None,
            build_timeout: 3600,
            stop_timeout: 10,
            image_prefix: "shipyard".to_string(),
            keep_image: false,
            entrypoint: None,
            command: None,
            log_path: None,
        }
    }
}
