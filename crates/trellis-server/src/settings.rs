//! Configuration loading.
//!
//! A TOML file provides the base layer; `TRELLIS__`-prefixed environment
//! variables override individual keys, `__` separating path segments
//! (`TRELLIS__LIMITS__RATE_CAPACITY=100`).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use tracing::warn;
use trellis_xmpp::Config;

/// Prefix of overriding environment variables.
pub const ENV_PREFIX: &str = "TRELLIS";

/// Load and validate the configuration at `path`. A missing file leaves
/// the defaults in place.
pub fn load(path: &Path) -> Result<Config> {
    load_with_env(path, None)
}

fn load_with_env(path: &Path, env: Option<HashMap<String, String>>) -> Result<Config> {
    if !path.exists() {
        warn!(path = %path.display(), "Configuration file not found, using defaults");
    }

    let config: Config = config::Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .source(env),
        )
        .build()
        .with_context(|| format!("failed to read {}", path.display()))?
        .try_deserialize()
        .context("invalid configuration")?;

    config.validate()?;
    Ok(config)
}
