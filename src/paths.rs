use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Directory name used under the platform config/data/cache dirs
pub const APP_DIR_NAME: &str = "preview-cache";
/// Environment override for the preview cache root
pub const CACHE_DIR_ENV: &str = "PREVIEW_CACHE_DIR";
/// Environment override for the config directory
pub const CONFIG_DIR_ENV: &str = "PREVIEW_CACHE_CONFIG_DIR";

/// Overrides for the default application paths
#[derive(Debug, Clone, Default)]
pub struct PathConfig {
    /// Custom config directory (from CLI or ENV)
    pub config_dir: Option<PathBuf>,
    /// Custom preview cache root (from CLI or ENV)
    pub cache_dir: Option<PathBuf>,
}

impl PathConfig {
    /// Priority: CLI args -> ENV vars -> None (use defaults)
    pub fn from_env_and_cli(cli_config_dir: Option<PathBuf>, cli_cache_dir: Option<PathBuf>) -> Self {
        let config_dir = cli_config_dir.or_else(|| std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from));
        let cache_dir = cli_cache_dir.or_else(|| std::env::var_os(CACHE_DIR_ENV).map(PathBuf::from));
        Self { config_dir, cache_dir }
    }
}

/// Get path to a configuration file
///
/// Priority:
/// 1. CLI --config-dir argument
/// 2. PREVIEW_CACHE_CONFIG_DIR environment variable
/// 3. Local folder IF any config files exist (preview.json, preview-cache.log)
/// 4. Platform-specific config directory from dirs-next (default)
///
/// Platform paths:
/// - Linux: ~/.config/preview-cache/{name}
/// - macOS: ~/Library/Application Support/preview-cache/{name}
/// - Windows: %APPDATA%\preview-cache\{name}
pub fn config_file(name: &str, config: &PathConfig) -> PathBuf {
    get_config_dir(config).join(name)
}

/// Get path to a data file (logs). Same priority as `config_file`.
pub fn data_file(name: &str, config: &PathConfig) -> PathBuf {
    get_data_dir(config).join(name)
}

/// Root under which every document gets `<document id>/preview`.
///
/// - Linux: ~/.cache/preview-cache
/// - macOS: ~/Library/Caches/preview-cache
/// - Windows: %LOCALAPPDATA%\preview-cache
pub fn cache_root(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.cache_dir {
        return dir.clone();
    }
    dirs_next::cache_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR_NAME))
}

/// Create config and data directories if they don't exist.
pub fn ensure_dirs(config: &PathConfig) -> Result<()> {
    let config_dir = get_config_dir(config);
    let data_dir = get_data_dir(config);

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;
    }

    // Only create data_dir if it's different from config_dir
    if data_dir != config_dir && !data_dir.exists() {
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;
    }

    Ok(())
}

fn has_local_config_files(dir: &Path) -> bool {
    ["preview.json", "preview-cache.log"].iter().any(|f| dir.join(f).exists())
}

fn local_dir() -> Option<PathBuf> {
    std::env::current_dir().ok().filter(|dir| has_local_config_files(dir))
}

fn get_config_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = local_dir() {
        return dir;
    }
    dirs_next::config_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn get_data_dir(config: &PathConfig) -> PathBuf {
    if let Some(dir) = &config.config_dir {
        return dir.clone();
    }
    if let Some(dir) = local_dir() {
        return dir;
    }
    dirs_next::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("."))
}
