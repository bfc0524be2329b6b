//! Finding and reading the configuration file

use std::path::{Path, PathBuf};

use crate::Courier;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "COURIER_CONFIG";

/// Searched, in order, when [`CONFIG_ENV`] is unset
pub const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
pub fn find_config_file() -> anyhow::Result<PathBuf> {
    let defaults: Vec<PathBuf> = DEFAULT_PATHS.iter().map(PathBuf::from).collect();
    locate(std::env::var(CONFIG_ENV).ok(), &defaults)
}

fn locate(configured: Option<String>, defaults: &[PathBuf]) -> anyhow::Result<PathBuf> {
    if let Some(configured) = configured {
        let path = PathBuf::from(configured);
        if path.exists() {
            return Ok(path);
        }
        anyhow::bail!("{CONFIG_ENV} points to non-existent file: {}", path.display());
    }

    if let Some(path) = defaults.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = defaults
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    anyhow::bail!(
        "No configuration file found. Tried:\n  - {CONFIG_ENV} environment variable\n{paths_tried}"
    )
}

/// Read and parse the configuration at `path`
///
/// Optional settings can be written without wrapping them in `Some(..)`.
pub fn load(path: &Path) -> anyhow::Result<Courier> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read config from {}: {e}", path.display()))?;

    ron::Options::default()
        .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
        .from_str(&content)
        .map_err(|e| anyhow::anyhow!("Failed to parse config from {}: {e}", path.display()))
}
