use std::path::Path;

use super::types::AppConfig;

const CONFIG_FILE: &str = "agentmesh.toml";

/// Load configuration from an explicit TOML file.
pub fn load_from_path(path: impl AsRef<Path>) -> anyhow::Result<AppConfig> {
    let s = std::fs::read_to_string(path.as_ref())?;
    Ok(toml::from_str::<AppConfig>(&s)?)
}

/// Load `./agentmesh.toml` if present, otherwise defaults, then apply
/// environment overrides.
pub fn load_default() -> anyhow::Result<AppConfig> {
    let local = Path::new(CONFIG_FILE);

    let mut cfg = if local.exists() {
        load_from_path(local)?
    } else {
        AppConfig::default()
    };

    if let Ok(v) = std::env::var("AGENTMESH_STORAGE_DIR") {
        if !v.trim().is_empty() {
            cfg.storage.storage_dir = Some(v);
        }
    }
    if let Ok(v) = std::env::var("AGENTMESH_LOG") {
        if !v.trim().is_empty() {
            cfg.logging.level = v;
        }
    }

    Ok(cfg)
}
