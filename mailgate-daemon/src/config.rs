//! Daemon configuration handling.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use mailgate_core::AuthConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`DaemonConfig::socket_path`].
pub const SOCKET_ENV: &str = "MAILGATE_SOCKET";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,

    /// Path to the configuration file that was loaded.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Working directory for relative artifact paths.
    pub data_dir: PathBuf,

    /// Logging level used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Authenticate once at startup instead of on the first request.
    pub authenticate_on_start: bool,

    /// Vault and authentication settings.
    pub auth: AuthConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let dirs = project_dirs();
        let data_dir = dirs
            .as_ref()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".mailgate"));

        let socket_path = default_socket_path();

        Self {
            socket_path,
            config_path: PathBuf::new(),
            data_dir,
            log_level: "info".to_string(),
            authenticate_on_start: true,
            auth: AuthConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Apply `MAILGATE_*` environment overrides and resolve relative paths.
    pub fn finalize(mut self) -> Result<Self> {
        if let Ok(socket) = std::env::var(SOCKET_ENV) {
            self.socket_path = PathBuf::from(socket);
        }
        self.auth
            .apply_env_overrides()
            .context("Invalid authentication settings")?;

        self.auth.credentials_path = resolve(&self.data_dir, &self.auth.credentials_path);
        self.auth.token_path = resolve(&self.data_dir, &self.auth.token_path);
        Ok(self)
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Default socket location shared by the daemon and its clients.
pub fn default_socket_path() -> PathBuf {
    project_dirs()
        .as_ref()
        .map(|d| d.runtime_dir().unwrap_or(d.data_dir()).join("mailgate.sock"))
        .unwrap_or_else(|| PathBuf::from("/tmp/mailgate.sock"))
}

/// Load configuration from the default location or create defaults.
pub fn load_config() -> Result<DaemonConfig> {
    let config_path = project_dirs()
        .as_ref()
        .map(|d| d.config_dir().join("daemon.toml"))
        .unwrap_or_else(|| PathBuf::from("mailgate-daemon.toml"));

    load_config_from(&config_path)
}

/// Load configuration from `config_path`, falling back to defaults if absent.
pub fn load_config_from(config_path: &Path) -> Result<DaemonConfig> {
    let config = if config_path.exists() {
        let contents = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config from {:?}", config_path))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {:?}", config_path))?
    } else {
        DaemonConfig::default()
    };

    let mut config = config.finalize()?;
    config.config_path = config_path.to_path_buf();

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("Failed to create data directory {:?}", config.data_dir))?;

    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "mailgate", "mailgate")
}
