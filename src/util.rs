use std::path::PathBuf;

use tracing::Level;

const VITALSTACK_CONFIG: &str = "VITALSTACK_CONFIG";

const DEFAULT_CONFIG: &str = "vitalstack.json";

pub fn get_default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG)
}

/// Config file path from `VITALSTACK_CONFIG`, falling back to `vitalstack.json`
pub fn get_config_path() -> PathBuf {
    let path_from_env = std::env::var(VITALSTACK_CONFIG);
    path_from_env.map_or_else(|_| get_default_config_path(), PathBuf::from)
}

const VITALSTACK_LOG: &str = "VITALSTACK_LOG";

const DEFAULT_LOG_LEVEL: Level = Level::INFO;

/// Log level from `VITALSTACK_LOG` (e.g. `debug`), `INFO` if unset or invalid
pub fn get_log_level() -> Level {
    let level_from_env = std::env::var(VITALSTACK_LOG);
    level_from_env.map_or(DEFAULT_LOG_LEVEL, |res| {
        res.parse().unwrap_or(DEFAULT_LOG_LEVEL)
    })
}
