//! YAML configuration for a synchronization run.
//!
//! # Storage layout
//!
//! ```text
//! ~/.trialsync/
//!   config.yaml           (mode 0600, holds the registry credential)
//!   protocol_env.json     (allocator state, written by the engine)
//!   watermark.json        (per-trial sync dates, written by the engine)
//! ```
//!
//! Every function that touches the home directory has an `_at(home, …)`
//! form; tests must always use it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, ConfigError};

/// Environment variable overriding [`SyncConfig::server`].
pub const ENV_SERVER: &str = "TRIALSYNC_SERVER";
/// Environment variable overriding [`SyncConfig::token`].
pub const ENV_TOKEN: &str = "TRIALSYNC_TOKEN";

/// Retry policy for moving processed files into the archive directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateConfig {
    #[serde(default = "default_relocate_attempts")]
    pub attempts: u32,
    #[serde(default = "default_relocate_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RelocateConfig {
    fn default() -> Self {
        Self {
            attempts: default_relocate_attempts(),
            delay_ms: default_relocate_delay_ms(),
        }
    }
}

/// Everything a synchronization run needs to know about its surroundings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the registry, e.g. `https://matchminer.example.org`.
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_auth_scheme")]
    pub auth_scheme: String,
    #[serde(default = "default_trial_endpoint")]
    pub trial_endpoint: String,
    #[serde(default = "default_recompute_endpoint")]
    pub recompute_endpoint: String,

    /// Directory holding one `<trial key>.json` document per trial.
    pub trial_dir: PathBuf,
    /// Where processed trial documents are moved.
    pub archive_dir: PathBuf,
    /// The authoritative status feed (CSV or JSON).
    pub status_file: PathBuf,
    /// Directory for `protocol_env.json` and `watermark.json`.
    /// Defaults to `~/.trialsync`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub relocate: RelocateConfig,
}

impl SyncConfig {
    /// A config with placeholder paths, used by `trialsync init`.
    pub fn template() -> Self {
        Self {
            server: "https://matchminer.example.org".to_owned(),
            token: String::new(),
            auth_scheme: default_auth_scheme(),
            trial_endpoint: default_trial_endpoint(),
            recompute_endpoint: default_recompute_endpoint(),
            trial_dir: PathBuf::from("trial_data_reviewed"),
            archive_dir: PathBuf::from("trial_data_processed"),
            status_file: PathBuf::from("trial_status.csv"),
            state_dir: None,
            log_file: None,
            request_timeout_secs: default_request_timeout_secs(),
            relocate: RelocateConfig::default(),
        }
    }

    /// Resolved state directory, falling back to `<home>/.trialsync`.
    pub fn state_dir_at(&self, home: &Path) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| trialsync_root(home))
    }

    /// Full URL of the trial collection endpoint.
    pub fn trial_url(&self) -> String {
        join_url(&self.server, &self.trial_endpoint)
    }

    /// Full URL of the recompute trigger endpoint.
    pub fn recompute_url(&self) -> String {
        join_url(&self.server, &self.recompute_endpoint)
    }

    /// `Authorization` header value.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.auth_scheme, self.token)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Apply environment overrides through `lookup` (usually `std::env::var`).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server) = lookup(ENV_SERVER).filter(|s| !s.trim().is_empty()) {
            self.server = server;
        }
        if let Some(token) = lookup(ENV_TOKEN).filter(|s| !s.trim().is_empty()) {
            self.token = token;
        }
    }

    /// Resolve relative paths against `base` (the config file's directory).
    pub fn resolve_paths(&mut self, base: &Path) {
        for path in [
            &mut self.trial_dir,
            &mut self.archive_dir,
            &mut self.status_file,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        for path in [&mut self.state_dir, &mut self.log_file].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }

    /// Reject configs that cannot possibly reach the registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "server",
                reason: format!("must be set (or export {ENV_SERVER})"),
            });
        }
        if !self.server.starts_with("http://") && !self.server.starts_with("https://") {
            return Err(ConfigError::Invalid {
                field: "server",
                reason: format!("'{}' is not an http(s) URL", self.server),
            });
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "token",
                reason: format!("must be set (or export {ENV_TOKEN})"),
            });
        }
        if self.relocate.attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "relocate.attempts",
                reason: "must be at least 1".to_owned(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.trialsync`
pub fn trialsync_root(home: &Path) -> PathBuf {
    home.join(".trialsync")
}

/// `<home>/.trialsync/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    trialsync_root(home).join("config.yaml")
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load, override from the process environment, resolve, and validate.
///
/// `explicit` wins over `<home>/.trialsync/config.yaml`.
pub fn load_at(home: &Path, explicit: Option<&Path>) -> Result<SyncConfig, ConfigError> {
    load_with_env(home, explicit, |key| std::env::var(key).ok())
}

/// [`load_at`] with an injectable environment lookup.
pub fn load_with_env(
    home: &Path,
    explicit: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<SyncConfig, ConfigError> {
    let path = explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config_path_at(home));
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    let mut config: SyncConfig = serde_yaml::from_str(&contents)
        .map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

    config.apply_env_overrides(lookup);
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    config.validate()?;
    Ok(config)
}

/// `load_at` convenience wrapper using the real home directory.
pub fn load(explicit: Option<&Path>) -> Result<SyncConfig, ConfigError> {
    load_at(&home()?, explicit)
}

/// Atomically write `config` to `path` (`.tmp` sibling → `chmod 0600` → rename).
pub fn save_at(path: &Path, config: &SyncConfig) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    let yaml = serde_yaml::to_string(config)?;
    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

/// The current user's home directory.
pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn join_url(server: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        server.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

fn default_auth_scheme() -> String {
    "Basic".to_owned()
}

fn default_trial_endpoint() -> String {
    "/api/trial".to_owned()
}

fn default_recompute_endpoint() -> String {
    "/api/run_matchengine".to_owned()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_relocate_attempts() -> u32 {
    3
}

fn default_relocate_delay_ms() -> u64 {
    1000
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
