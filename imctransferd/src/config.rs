use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::sync::box_remote::DEFAULT_PAGE_SIZE;
use crate::sync::hash::HashKind;
use crate::sync::orchestrator::{LocalAudit, SyncSettings};
use crate::sync::paths::{Layout, paths_overlap};

const ENV_PREFIX: &str = "IMCTRANSFER_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub root_folder_id: String,
    pub access_token: Option<String>,
    pub api_base_url: Option<String>,
    pub file_extensions: Vec<String>,
    pub page_size: u32,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            root_folder_id: "0".into(),
            access_token: None,
            api_base_url: None,
            file_extensions: vec!["mcd".into()],
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub root_output_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub max_retry_attempts: u32,
    pub stale_download_threshold_secs: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// `0` disables the pass timeout.
    pub pass_timeout_secs: u64,
    pub hash_algorithm: HashKind,
    pub layout: Layout,
    pub local_audit: LocalAudit,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let project = default_project_dir();
        Self {
            root_output_dir: project.join("data").join("raw"),
            staging_dir: project.join("data").join(".staging"),
            max_concurrent_downloads: 4,
            max_retry_attempts: 5,
            stale_download_threshold_secs: 3600,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 60_000,
            pass_timeout_secs: 6 * 3600,
            hash_algorithm: HashKind::Sha1,
            layout: Layout::Mirror,
            local_audit: LocalAudit::Presence,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub refresh_interval_secs: u64,
    /// Stop `run` after this long without newly verified files. `0` never stops.
    pub idle_timeout_hours: u64,
    pub database_path: Option<PathBuf>,
    pub metadata: bool,
    pub metadata_file: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 2 * 3600,
            idle_timeout_hours: 3,
            database_path: None,
            metadata: true,
            metadata_file: default_project_dir()
                .join("metadata")
                .join("annotation.auto.csv"),
        }
    }
}

impl DaemonConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_hours > 0).then(|| Duration::from_secs(self.idle_timeout_hours * 3600))
    }
}

impl Config {
    /// Reads `path`, or the default location when `None`. A missing file
    /// yields the defaults. Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path.is_some();
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path(),
        };

        let mut config: Config = match path {
            Some(path) => match std::fs::read_to_string(&path) {
                Ok(content) => {
                    toml::from_str(&content).map_err(|source| ConfigError::Parse {
                        path: path.clone(),
                        source,
                    })?
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound && !explicit => {
                    debug!(path = %path.display(), "no config file, using defaults");
                    Config::default()
                }
                Err(source) => return Err(ConfigError::Read { path, source }),
            },
            None => Config::default(),
        };

        config.apply_env(|name| std::env::var(name).ok())?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Applies `IMCTRANSFER_*` overrides from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}")).filter(|value| !value.trim().is_empty())
        };

        if let Some(value) = get("ROOT_FOLDER_ID") {
            self.remote.root_folder_id = value;
        }
        if let Some(value) = get("BOX_TOKEN") {
            self.remote.access_token = Some(value);
        }
        if let Some(value) = get("API_BASE_URL") {
            self.remote.api_base_url = Some(value);
        }
        if let Some(value) = get("FILE_EXTENSIONS") {
            self.remote.file_extensions = value
                .split(',')
                .map(|ext| ext.trim().to_string())
                .filter(|ext| !ext.is_empty())
                .collect();
        }
        if let Some(value) = get("OUTPUT_DIR") {
            self.sync.root_output_dir = PathBuf::from(value);
        }
        if let Some(value) = get("STAGING_DIR") {
            self.sync.staging_dir = PathBuf::from(value);
        }
        if let Some(value) = get("MAX_CONCURRENT_DOWNLOADS") {
            self.sync.max_concurrent_downloads = parse_env("MAX_CONCURRENT_DOWNLOADS", &value)?;
        }
        if let Some(value) = get("MAX_RETRY_ATTEMPTS") {
            self.sync.max_retry_attempts = parse_env("MAX_RETRY_ATTEMPTS", &value)?;
        }
        if let Some(value) = get("STALE_DOWNLOAD_SECS") {
            self.sync.stale_download_threshold_secs = parse_env("STALE_DOWNLOAD_SECS", &value)?;
        }
        if let Some(value) = get("PASS_TIMEOUT_SECS") {
            self.sync.pass_timeout_secs = parse_env("PASS_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = get("REFRESH_INTERVAL_SECS") {
            self.daemon.refresh_interval_secs = parse_env("REFRESH_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = get("IDLE_TIMEOUT_HOURS") {
            self.daemon.idle_timeout_hours = parse_env("IDLE_TIMEOUT_HOURS", &value)?;
        }
        if let Some(value) = get("DATABASE_PATH") {
            self.daemon.database_path = Some(PathBuf::from(value));
        }
        if let Some(value) = get("METADATA_FILE") {
            self.daemon.metadata_file = PathBuf::from(value);
        }
        Ok(())
    }

    fn expand_paths(&mut self) {
        let Some(home) = dirs::home_dir() else {
            return;
        };
        self.sync.root_output_dir = expand_with_home(&self.sync.root_output_dir, &home);
        self.sync.staging_dir = expand_with_home(&self.sync.staging_dir, &home);
        self.daemon.metadata_file = expand_with_home(&self.daemon.metadata_file, &home);
        if let Some(db) = &self.daemon.database_path {
            self.daemon.database_path = Some(expand_with_home(db, &home));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let output = &self.sync.root_output_dir;
        let staging = &self.sync.staging_dir;
        if paths_overlap(output, staging) {
            return Err(ConfigError::Invalid(format!(
                "staging dir {} and output dir {} must be distinct and not nested",
                staging.display(),
                output.display()
            )));
        }
        if self.sync.max_concurrent_downloads == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_downloads must be at least 1".into(),
            ));
        }
        if self.sync.max_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_retry_attempts must be at least 1".into(),
            ));
        }
        if self.remote.root_folder_id.trim().is_empty() {
            return Err(ConfigError::Invalid("root_folder_id must not be empty".into()));
        }
        Ok(())
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            root_folder_id: self.remote.root_folder_id.clone(),
            file_extensions: self.remote.file_extensions.clone(),
            root_output_dir: self.sync.root_output_dir.clone(),
            staging_dir: self.sync.staging_dir.clone(),
            max_concurrent_downloads: self.sync.max_concurrent_downloads,
            max_retry_attempts: self.sync.max_retry_attempts,
            stale_download_threshold: Duration::from_secs(self.sync.stale_download_threshold_secs),
            retry_base_delay: Duration::from_millis(self.sync.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(
                self.sync.retry_max_delay_ms.max(self.sync.retry_base_delay_ms),
            ),
            pass_timeout: (self.sync.pass_timeout_secs > 0)
                .then(|| Duration::from_secs(self.sync.pass_timeout_secs)),
            hash_kind: self.sync.hash_algorithm,
            layout: self.sync.layout,
            local_audit: self.sync.local_audit,
        }
    }
}

/// Staging renames are only atomic within one filesystem. Both directories
/// must already exist.
pub fn check_same_device(staging: &Path, output: &Path) -> Result<(), ConfigError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let staging_dev = std::fs::metadata(staging)?.dev();
        let output_dev = std::fs::metadata(output)?.dev();
        if staging_dev != output_dev {
            return Err(ConfigError::Invalid(format!(
                "staging dir {} and output dir {} are on different filesystems",
                staging.display(),
                output.display()
            )));
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (staging, output);
    }
    Ok(())
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("imctransfer").join("config.toml"))
}

fn default_project_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("imctransfer")
}

fn expand_with_home(value: &Path, home: &Path) -> PathBuf {
    match value.to_str() {
        Some("~") => home.to_path_buf(),
        Some(text) => match text.strip_prefix("~/") {
            Some(rest) => home.join(rest),
            None => value.to_path_buf(),
        },
        None => value.to_path_buf(),
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::InvalidEnv {
            name: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
        })
}
