// Build script model. Only the fields the orchestrator consumes are modelled;
// anything else in the file is ignored.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A parsed build script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildScript {
    /// Base image the build runs on.
    #[serde(default)]
    pub image: String,
    /// Shell commands, run in declared order.
    #[serde(default, alias = "script")]
    pub commands: Vec<String>,
    /// User the commands run as. Defaults to the image's user.
    #[serde(default)]
    pub user: Option<String>,
    /// Entrypoint of the built image.
    #[serde(default)]
    pub entrypoint: Option<String>,
}

impl BuildScript {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }
}

/// Parse a build script from YAML.
pub fn parse_script(raw: &str) -> Result<BuildScript> {
    let script: BuildScript = serde_yaml::from_str(raw).context("invalid build script")?;
    Ok(script)
}

/// Read and parse the build script at `path`.
pub fn load_script(path: &Path) -> Result<BuildScript> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read build script {}", path.display()))?;
    parse_script(&raw).with_context(|| format!("in {}", path.display()))
}
