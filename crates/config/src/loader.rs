use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::GatewayConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "agentgate.toml",
    "agentgate.yaml",
    "agentgate.yml",
    "agentgate.json",
];

/// Override for the config directory, set via `set_config_dir()`.
static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Set a custom config directory. When set, config discovery only looks in
/// this directory (project-local and user-global paths are skipped).
pub fn set_config_dir(path: PathBuf) {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = Some(path);
}

/// Clear the config directory override, restoring default discovery.
pub fn clear_config_dir() {
    *CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner()) = None;
}

fn config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./agentgate.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/agentgate/agentgate.{toml,yaml,yml,json}` (user-global)
///
/// Returns `GatewayConfig::default()` if no config file is found or the one
/// found fails to parse.
pub fn discover_and_load() -> GatewayConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return GatewayConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            GatewayConfig::default()
        },
    }
}

/// Find the first config file in standard locations.
///
/// When a config dir override is set, only that directory is searched.
pub fn find_config_file() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return first_existing(&dir);
    }

    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    // User-global: ~/.config/agentgate/
    config_dir().and_then(|dir| first_existing(&dir))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the config directory: override, or `~/.config/agentgate/`.
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = config_dir_override() {
        return Some(dir);
    }
    home_dir().map(|h| h.join(".config").join("agentgate"))
}

/// Returns the data directory: `~/.agentgate/` on all platforms.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".agentgate"))
        .unwrap_or_else(|| PathBuf::from(".agentgate"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<GatewayConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StateBackend;

    #[test]
    fn parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentgate.toml");
        std::fs::write(
            &path,
            "[routing]\nrpc_timeout_ms = 500\n\n[state]\nbackend = \"sqlite\"\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.routing.rpc_timeout_ms, 500);
        assert_eq!(cfg.routing.heartbeat_interval_ms, 15_000);
        assert_eq!(cfg.state.backend, StateBackend::Sqlite);
        assert_eq!(cfg.server.port, 18790);
    }

    #[test]
    fn parses_yaml_and_json() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("agentgate.yaml");
        std::fs::write(&yaml, "server:\n  port: 9000\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().server.port, 9000);

        let json = dir.path().join("agentgate.json");
        std::fs::write(&json, r#"{"server":{"bind":"0.0.0.0"}}"#).unwrap();
        assert_eq!(load_config(&json).unwrap().server.bind, "0.0.0.0");
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agentgate.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn override_dir_limits_discovery() {
        let dir = tempfile::tempdir().unwrap();
        set_config_dir(dir.path().to_path_buf());
        assert!(find_config_file().is_none());
        assert_eq!(discover_and_load(), GatewayConfig::default());

        std::fs::write(dir.path().join("agentgate.yml"), "server:\n  port: 7000\n").unwrap();
        assert_eq!(discover_and_load().server.port, 7000);
        clear_config_dir();
    }
}
