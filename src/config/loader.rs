use std::path::Path;

use anyhow::{Context, Result};

use super::types::Config;

/// Name of the config file looked up in a project directory.
pub const CONFIG_FILE: &str = ".shipyard.yml";

/// Load config from a `.shipyard.yml` file in the given directory.
/// Returns defaults when the file does not exist.
pub fn load(dir: &Path) -> Result<Config> {
    let path = dir.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(Config::default());
    }
    load_file(&path)
}

/// Load config from an explicit path.
pub fn load_file(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(config)
}
