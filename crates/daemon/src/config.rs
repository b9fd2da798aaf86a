//! Thin config-file loader, mirroring the teacher's `load_config`: missing
//! file falls back to defaults with a warning rather than failing startup.

use std::path::Path;

use anyhow::{Context, Result};
use matchbox_protocol::MatchBoxConfig;

pub fn load_config(path: &Path) -> Result<MatchBoxConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(MatchBoxConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = MatchBoxConfig::from_json(&contents)
        .with_context(|| "failed to parse config JSON")?;
    tracing::info!("loaded config from {}", path.display());
    Ok(config)
}

pub fn save_config(path: &Path, config: &MatchBoxConfig) -> Result<()> {
    let json = config.to_json_pretty()?;
    std::fs::write(path, json).with_context(|| format!("failed to write config file: {}", path.display()))
}
