use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use devcell_runtime_config::{
    CONFIG_FILE_NAME, DevcellConfig, apply_compat_fallbacks, apply_env_overrides,
};

/// Load `devcell.toml`.
///
/// An explicit path must exist. Without one, `./devcell.toml` is used when
/// present and defaults otherwise. Environment overrides apply last.
pub fn load(explicit: Option<&Path>) -> Result<DevcellConfig> {
    load_with(explicit, |key| std::env::var(key).ok())
}

fn load_with<F>(explicit: Option<&Path>, lookup: F) -> Result<DevcellConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(CONFIG_FILE_NAME)).filter(|p| p.exists()),
    };

    let mut config = match &path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))?
        }
        None => DevcellConfig::default(),
    };

    if apply_compat_fallbacks(&mut config) {
        tracing::info!("normalized legacy config values");
    }
    apply_env_overrides(&mut config, lookup);

    match &path {
        Some(path) => tracing::info!("config loaded from {}", path.display()),
        None => tracing::info!("no config file, using defaults"),
    }
    Ok(config)
}
