//! Harness settings with layered loading.
//!
//! Precedence (lowest to highest):
//! 1. Built-in defaults
//! 2. Optional TOML file
//! 3. Environment variables (`EMBEDDED_REDIS__*`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::exec::{ExecutableTable, Platform};
use crate::{Error, Result};

/// Settings shared by every instance and topology a test builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSettings {
    /// Redis version to look up in the executable table.
    pub version: String,

    /// Directory containing bundled executables.
    pub resource_dir: Option<PathBuf>,

    /// Explicit executable; wins over the table for the current platform.
    pub executable: Option<PathBuf>,

    /// Host nodes advertise to each other.
    pub bind_host: String,

    /// Upper bound on waiting for the ready line. `None` waits until the
    /// output stream ends.
    pub ready_timeout_ms: Option<u64>,

    /// Sleep between cluster health polls.
    pub poll_interval_ms: u64,

    /// Overall bound on cluster convergence. `0` waits forever.
    pub convergence_timeout_ms: u64,

    /// `cluster-node-timeout` written into cluster node configs.
    pub cluster_node_timeout_ms: u64,

    /// How long `stop()` waits for output drains after the process exits.
    pub stop_grace_ms: u64,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self {
            version: crate::exec::DEFAULT_VERSION.to_string(),
            resource_dir: None,
            executable: None,
            bind_host: "127.0.0.1".to_string(),
            ready_timeout_ms: None,
            poll_interval_ms: 1000,
            convergence_timeout_ms: 0,
            cluster_node_timeout_ms: 2000,
            stop_grace_ms: 1000,
        }
    }
}

impl HarnessSettings {
    /// Loads defaults overlaid with `EMBEDDED_REDIS__*` variables.
    pub fn load() -> Result<Self> {
        SettingsLoader::new().load()
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `None` means no bound.
    pub fn convergence_timeout(&self) -> Option<Duration> {
        (self.convergence_timeout_ms > 0).then(|| Duration::from_millis(self.convergence_timeout_ms))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Builds the executable table these settings describe.
    pub fn executables(&self) -> Result<ExecutableTable> {
        let mut table = ExecutableTable::bundled(self.version.clone());
        if let Some(dir) = &self.resource_dir {
            table = table.with_resource_dir(dir);
        }
        if let Some(exe) = &self.executable {
            let platform = Platform::detect()?;
            table = table.with_override(platform.os, platform.arch, exe);
        }
        Ok(table)
    }

    /// Resolves the executable for the current platform.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        self.executables()?.resolve_current()
    }
}

/// Loader with builder-style source selection.
pub struct SettingsLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "EMBEDDED_REDIS".to_string(),
        }
    }

    /// Adds a TOML file layer. Missing files are skipped.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the environment variable prefix (default: `EMBEDDED_REDIS`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn load(self) -> Result<HarnessSettings> {
        let defaults = config::Config::try_from(&HarnessSettings::default())
            .map_err(|e| Error::Settings(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(file) = &self.file {
            if file.exists() {
                builder = builder.add_source(
                    config::File::from(file.as_path())
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|c| c.try_deserialize::<HarnessSettings>())
            .map_err(|e| Error::Settings(e.to_string()))
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_historical_values() {
        let settings = HarnessSettings::default();
        assert_eq!(settings.version, "2.8");
        assert_eq!(settings.bind_host, "127.0.0.1");
        assert_eq!(settings.poll_interval(), Duration::from_millis(1000));
        assert_eq!(settings.convergence_timeout(), None);
        assert_eq!(settings.ready_timeout(), None);
        assert_eq!(settings.cluster_node_timeout_ms, 2000);
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("embedded-redis.toml");
        fs::write(
            &path,
            r#"
version = "5.0"
poll_interval_ms = 250
convergence_timeout_ms = 30000
ready_timeout_ms = 5000
"#,
        )
        .unwrap();

        let settings = SettingsLoader::new()
            .with_env_prefix("EMBEDDED_REDIS_FILE_LAYER_TEST")
            .with_file(&path)
            .load()
            .unwrap();

        assert_eq!(settings.version, "5.0");
        assert_eq!(settings.poll_interval(), Duration::from_millis(250));
        assert_eq!(
            settings.convergence_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(settings.ready_timeout(), Some(Duration::from_secs(5)));
        // Untouched keys keep their defaults.
        assert_eq!(settings.bind_host, "127.0.0.1");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let settings = SettingsLoader::new()
            .with_env_prefix("EMBEDDED_REDIS_MISSING_FILE_TEST")
            .with_file(dir.path().join("absent.toml"))
            .load()
            .unwrap();
        assert_eq!(settings, HarnessSettings::default());
    }

    #[test]
    fn explicit_executable_wins() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("redis-server");
        fs::write(&exe, b"").unwrap();

        let settings = HarnessSettings {
            executable: Some(exe.clone()),
            ..HarnessSettings::default()
        };
        assert_eq!(settings.resolve_executable().unwrap(), exe);
    }
}
