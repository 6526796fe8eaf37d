//! Engine configuration loading and data directory resolution.

use std::path::{Path, PathBuf};

use stepline_types::config::EngineConfig;

/// Resolve the data directory.
///
/// `STEPLINE_DATA_DIR` wins; otherwise `~/.stepline`, or `./.stepline` when
/// no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STEPLINE_DATA_DIR") {
        return PathBuf::from(dir);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".stepline");
    }
    PathBuf::from(".stepline")
}

/// Load `{data_dir}/config.toml`.
///
/// A missing file yields defaults. A file that cannot be read or parsed is
/// logged and also yields defaults. Validation is left to the caller.
pub async fn load_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %config_path.display(), "no config.toml, using defaults");
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to read config, using defaults");
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(path = %config_path.display(), error = %err, "failed to parse config, using defaults");
            EngineConfig::default()
        }
    }
}
