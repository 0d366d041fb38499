//! Configuration loading and schema definitions for testlens.
//!
//! Configuration is a TOML file with a `[collector]` and an
//! `[orchestration]` section. Both are optional.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Loads testlens configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if:
/// - The file cannot be read (e.g., doesn't exist or permission denied)
/// - The file contains invalid TOML syntax
/// - The configuration doesn't match the expected schema
///
/// # Example
///
/// ```no_run
/// use testlens::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("testlens.toml"))?;
/// println!("Batch size: {}", config.collector.batch_size);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testlens configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testlens::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [collector]
///     flush_interval_ms = 500
/// "#)?;
///
/// assert_eq!(config.collector.flush_interval_ms, 500);
/// assert_eq!(config.collector.batch_size, 1000);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}
