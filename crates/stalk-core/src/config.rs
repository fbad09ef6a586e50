use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080/api/coords";
pub const DEFAULT_API_KEY: &str = "INVALID_API_KEY";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("server_url must be an http(s) URL, got '{0}'")]
    InvalidServerUrl(String),
    #[error("api_key must not be empty")]
    EmptyApiKey,
    #[error("request_timeout_ms must be greater than zero")]
    ZeroRequestTimeout,
    #[error("cannot resolve a state directory: neither XDG_STATE_HOME nor HOME is set")]
    NoStateDir,
}

/// On-disk shape; every field is optional so a partial file only overrides what it names.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct FileConfig {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub request_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StalkConfig {
    pub server_url: String,
    pub api_key: String,
    pub state_dir: PathBuf,
    pub request_timeout: Duration,
}

impl StalkConfig {
    /// Loads from `explicit`, or the default config location, then applies env overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(explicit, |name| std::env::var(name).ok())
    }

    pub fn load_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(&env),
        };
        let file = match path {
            Some(path) => read_file_config(&path)?,
            None => FileConfig::default(),
        };
        Self::resolve(file, &env)
    }

    pub fn resolve(
        file: FileConfig,
        env: &impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let server_url = non_empty(env("SERVER_URL"))
            .or(file.server_url)
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let api_key = env("API_KEY")
            .or(file.api_key)
            .unwrap_or_else(|| DEFAULT_API_KEY.to_string());
        let state_dir = match non_empty(env("STALK_STATE_DIR")).map(PathBuf::from) {
            Some(dir) => dir,
            None => match file.state_dir {
                Some(dir) => dir,
                None => default_state_dir(env).ok_or(ConfigError::NoStateDir)?,
            },
        };
        let request_timeout = Duration::from_millis(
            file.request_timeout_ms
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        );

        let config = Self {
            server_url,
            api_key,
            state_dir,
            request_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server_url.starts_with("http") {
            return Err(ConfigError::InvalidServerUrl(self.server_url.clone()));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::EmptyApiKey);
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroRequestTimeout);
        }
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join("prefs.sqlite3")
    }

    pub fn control_socket_path(&self) -> PathBuf {
        self.state_dir.join("tracker.sock")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigError> {
    if !path.exists() {
        return Ok(FileConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn default_config_path(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(path) = non_empty(env("STALK_CONFIG_PATH")) {
        return Some(PathBuf::from(path));
    }
    if let Some(dir) = non_empty(env("XDG_CONFIG_HOME")) {
        return Some(PathBuf::from(dir).join("stalk/config.toml"));
    }
    non_empty(env("HOME")).map(|home| PathBuf::from(home).join(".config/stalk/config.toml"))
}

fn default_state_dir(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    if let Some(dir) = non_empty(env("XDG_STATE_HOME")) {
        return Some(PathBuf::from(dir).join("stalk"));
    }
    non_empty(env("HOME")).map(|home| PathBuf::from(home).join(".local/state/stalk"))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}
