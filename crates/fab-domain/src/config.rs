use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Sandboxing technology used for isolated producer execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum SandboxKind {
    /// Run against the base interpreter with no environment isolation.
    None,
    #[default]
    Venv,
    Conda,
}

impl SandboxKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Venv => "venv",
            Self::Conda => "conda",
        }
    }
}

impl TryFrom<&str> for SandboxKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "none" => Ok(Self::None),
            "venv" => Ok(Self::Venv),
            "conda" => Ok(Self::Conda),
            other => Err(format!("unknown sandbox kind `{other}`")),
        }
    }
}

/// Retry policy for remote fetches.
#[derive(Clone, Copy, Debug)]
pub struct GitRetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max: u32,
    /// Fixed delay between attempts.
    pub patience: Duration,
}

impl Default for GitRetryConfig {
    fn default() -> Self {
        Self {
            max: 1,
            patience: Duration::from_secs(1),
        }
    }
}

/// Resolved engine settings.
///
/// The layering (defaults, then the optional `config.yaml` in the state
/// directory, then `FAB_*` environment variables) happens once at
/// construction; the engine only ever sees the resolved values.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Folder for all engine-managed state (fetch caches, sandboxes,
    /// artifact cache).
    pub state_dir: PathBuf,
    /// Enables the filesystem artifact cache.
    pub cache: bool,
    /// Blobs below this size are not persisted (1-byte sentinels excepted).
    pub cache_min_entry_size: u64,
    /// Blobs above this size are not persisted.
    pub cache_max_entry_size: u64,
    /// Overrides the worker pool sizing.
    pub threads_max: Option<usize>,
    /// Refresh fetch caches even when they are fresh.
    pub force_update: bool,
    /// Never touch the network; missing fetch caches become errors.
    pub offline: bool,
    pub git_retry: GitRetryConfig,
    /// Preferred sandboxing technology for producer execution.
    pub sandbox: SandboxKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            cache: true,
            cache_min_entry_size: 100,
            cache_max_entry_size: 10 * 1024 * 1024,
            threads_max: None,
            force_update: false,
            offline: false,
            git_retry: GitRetryConfig::default(),
            sandbox: SandboxKind::default(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fab")
}

/// Keys understood in `<state>/config.yaml`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    cache_files: Option<bool>,
    cache_files_min_entry_size: Option<u64>,
    cache_files_max_entry_size: Option<u64>,
    threads_max: Option<usize>,
    force_update: Option<bool>,
    offline: Option<bool>,
    git_retry_max: Option<u32>,
    git_retry_patience: Option<u64>,
    sandbox: Option<String>,
}

impl EngineConfig {
    /// Builds a configuration snapshot from the current process environment
    /// and the user's config file.
    #[must_use]
    pub fn from_env() -> Self {
        let snapshot = EnvSnapshot::capture();
        let state_dir = snapshot
            .var("FAB_STATE_DIR")
            .map_or_else(default_state_dir, PathBuf::from);
        let file = read_config_file(&state_dir.join("config.yaml"));
        Self::resolve(&snapshot, &file)
    }

    fn resolve(snapshot: &EnvSnapshot, file: &ConfigFile) -> Self {
        let mut config = Self::default();

        if let Some(dir) = &file.state_dir {
            config.state_dir = dir.clone();
        }
        if let Some(enabled) = file.cache_files {
            config.cache = enabled;
        }
        if let Some(size) = file.cache_files_min_entry_size {
            config.cache_min_entry_size = size;
        }
        if let Some(size) = file.cache_files_max_entry_size {
            config.cache_max_entry_size = size;
        }
        if let Some(threads) = file.threads_max {
            config.threads_max = Some(threads);
        }
        if let Some(force) = file.force_update {
            config.force_update = force;
        }
        if let Some(offline) = file.offline {
            config.offline = offline;
        }
        if let Some(max) = file.git_retry_max {
            config.git_retry.max = max;
        }
        if let Some(secs) = file.git_retry_patience {
            config.git_retry.patience = Duration::from_secs(secs);
        }
        if let Some(kind) = &file.sandbox {
            match SandboxKind::try_from(kind.as_str()) {
                Ok(kind) => config.sandbox = kind,
                Err(reason) => warn!("config.yaml: {reason}"),
            }
        }

        if let Some(dir) = snapshot.var("FAB_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Some(enabled) = snapshot.bool_var("FAB_CACHE_FILES") {
            config.cache = enabled;
        }
        if let Some(size) = snapshot.int_var("FAB_CACHE_FILES_MIN_ENTRY_SIZE") {
            config.cache_min_entry_size = size;
        }
        if let Some(size) = snapshot.int_var("FAB_CACHE_FILES_MAX_ENTRY_SIZE") {
            config.cache_max_entry_size = size;
        }
        if let Some(threads) = snapshot.int_var("FAB_THREADS_MAX") {
            config.threads_max = usize::try_from(threads).ok();
        }
        if let Some(force) = snapshot.bool_var("FAB_FORCE_UPDATE") {
            config.force_update = force;
        }
        if let Some(offline) = snapshot.bool_var("FAB_OFFLINE") {
            config.offline = offline;
        }
        if let Some(max) = snapshot.int_var("FAB_GIT_RETRY_MAX") {
            config.git_retry.max = u32::try_from(max).unwrap_or(u32::MAX);
        }
        if let Some(secs) = snapshot.int_var("FAB_GIT_RETRY_PATIENCE") {
            config.git_retry.patience = Duration::from_secs(secs);
        }
        if let Some(kind) = snapshot.var("FAB_SANDBOX") {
            match SandboxKind::try_from(kind) {
                Ok(kind) => config.sandbox = kind,
                Err(reason) => warn!("FAB_SANDBOX: {reason}"),
            }
        }

        config
    }
}

fn read_config_file(path: &Path) -> ConfigFile {
    if !path.is_file() {
        return ConfigFile::default();
    }
    match fs::read_to_string(path).map_err(|err| err.to_string()).and_then(|text| {
        serde_yaml::from_str::<ConfigFile>(&text).map_err(|err| err.to_string())
    }) {
        Ok(file) => file,
        Err(reason) => {
            warn!("failed to parse {}: {reason}", path.display());
            ConfigFile::default()
        }
    }
}

/// An immutable snapshot of the process environment.
#[derive(Debug, Clone)]
pub struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    #[must_use]
    pub fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    #[must_use]
    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    fn bool_var(&self, key: &str) -> Option<bool> {
        self.var(key).map(|value| {
            let lowered = value.to_ascii_lowercase();
            lowered != "0" && lowered != "false" && !lowered.is_empty()
        })
    }

    fn int_var(&self, key: &str) -> Option<u64> {
        self.var(key).and_then(|value| value.trim().parse().ok())
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert!(config.cache);
        assert_eq!(config.cache_min_entry_size, 100);
        assert_eq!(config.cache_max_entry_size, 10 * 1024 * 1024);
        assert_eq!(config.git_retry.max, 1);
        assert_eq!(config.sandbox, SandboxKind::Venv);
        assert!(!config.offline);
    }

    #[test]
    fn env_overrides_file_values() {
        let file: ConfigFile = serde_yaml::from_str(
            "cacheFiles: false\ngitRetryMax: 5\nsandbox: conda\n",
        )
        .unwrap();
        let snapshot = EnvSnapshot::testing(&[
            ("FAB_CACHE_FILES", "1"),
            ("FAB_GIT_RETRY_PATIENCE", "7"),
        ]);
        let config = EngineConfig::resolve(&snapshot, &file);
        // The file disabled the cache; the environment wins.
        assert!(config.cache);
        assert_eq!(config.git_retry.max, 5);
        assert_eq!(config.git_retry.patience, Duration::from_secs(7));
        assert_eq!(config.sandbox, SandboxKind::Conda);
    }

    #[test]
    fn boolean_env_values_accept_common_forms() {
        let snapshot = EnvSnapshot::testing(&[("FAB_OFFLINE", "true")]);
        let config = EngineConfig::resolve(&snapshot, &ConfigFile::default());
        assert!(config.offline);

        let snapshot = EnvSnapshot::testing(&[("FAB_OFFLINE", "0")]);
        let config = EngineConfig::resolve(&snapshot, &ConfigFile::default());
        assert!(!config.offline);
    }
}
