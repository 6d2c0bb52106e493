//! Configuration types for the updater.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level updater configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// The application being updated.
    pub app: AppConfig,
    /// Release index settings.
    pub release: ReleaseConfig,
    /// Artifact download settings.
    pub download: DownloadConfig,
    /// Installation settings.
    pub install: InstallConfig,
}

/// Identity and layout of the application being updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Artifact base name (`"App"` in `App-2.0.0-mac.zip`).
    pub name: String,
    /// Version currently installed.
    pub current_version: String,
    /// Main executable file name inside the bundle.
    pub executable_name: String,
    /// Bundle directory name on macOS (e.g. `"App.app"`). Defaults to
    /// `"{name}.app"` when unset.
    pub bundle_name: Option<String>,
    /// Installed application path. When unset it is derived from the
    /// running executable.
    pub install_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "App".to_owned(),
            current_version: env!("CARGO_PKG_VERSION").to_owned(),
            executable_name: "app".to_owned(),
            bundle_name: None,
            install_path: None,
        }
    }
}

impl AppConfig {
    /// macOS bundle directory name.
    pub fn bundle_dir_name(&self) -> String {
        self.bundle_name
            .clone()
            .unwrap_or_else(|| format!("{}.app", self.name))
    }
}

/// Release index endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    /// URL of the "latest release" document.
    pub endpoint: String,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
    /// `Accept` header for the release index request.
    pub accept: String,
    /// Whole-request timeout for the release index.
    pub timeout_secs: u64,
    /// Page users are sent to when an update cannot be completed.
    pub release_page: Option<String>,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.github.com/repos/owner/app/releases/latest".to_owned(),
            user_agent: format!("updraft/{}", env!("CARGO_PKG_VERSION")),
            accept: "application/vnd.github.v3+json".to_owned(),
            timeout_secs: 15,
            release_page: None,
        }
    }
}

impl ReleaseConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Artifact download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Abort an attempt when no bytes arrive for this long.
    pub inactivity_timeout_secs: u64,
    /// TCP/TLS connect timeout.
    pub connect_timeout_secs: u64,
    /// Redirects followed per candidate URL before falling through.
    pub max_redirects: u8,
    /// Minimum spacing of progress callbacks to observers.
    pub progress_interval_ms: u64,
    /// Where artifacts are stored. Defaults to `app_dirs::downloads_dir()`.
    pub download_dir: Option<PathBuf>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 30,
            connect_timeout_secs: 15,
            max_redirects: 5,
            progress_interval_ms: 1000,
            download_dir: None,
        }
    }
}

impl DownloadConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Resolved download directory.
    pub fn resolved_download_dir(&self) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(crate::app_dirs::downloads_dir)
    }
}

/// Installation pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    /// Schedule a relaunch of the new version after installing.
    pub relaunch: bool,
    /// How long the relaunch helper waits for this process to exit.
    pub relaunch_delay_secs: u64,
    /// Ask other running instances of the application to exit first.
    pub quiesce_other_instances: bool,
    /// Suffix appended to the install path to form the backup path.
    pub backup_suffix: String,
    /// Scratch directory for extraction. Defaults to `app_dirs::work_dir()`.
    pub work_dir: Option<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            relaunch: true,
            relaunch_delay_secs: 2,
            quiesce_other_instances: true,
            backup_suffix: ".backup".to_owned(),
            work_dir: None,
        }
    }
}

impl InstallConfig {
    pub fn resolved_work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(crate::app_dirs::work_dir)
    }
}

impl UpdaterConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::error::UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file(&self, path: &std::path::Path) -> crate::error::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config file path.
    pub fn default_config_path() -> PathBuf {
        crate::app_dirs::config_file()
    }

    /// Reject settings the engine cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`](crate::error::UpdateError::Config)
    /// describing the first problem found.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::UpdateError;

        if self.app.name.trim().is_empty() {
            return Err(UpdateError::Config("app.name must not be empty".to_owned()));
        }
        if self.app.executable_name.trim().is_empty() {
            return Err(UpdateError::Config(
                "app.executable_name must not be empty".to_owned(),
            ));
        }
        if url::Url::parse(&self.release.endpoint).is_err() {
            return Err(UpdateError::Config(format!(
                "release.endpoint is not a valid URL: {}",
                self.release.endpoint
            )));
        }
        if self.release.timeout_secs == 0 || self.download.inactivity_timeout_secs == 0 {
            return Err(UpdateError::Config("timeouts must be non-zero".to_owned()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = UpdaterConfig::default();
        assert_eq!(config.release.timeout_secs, 15);
        assert_eq!(config.release.accept, "application/vnd.github.v3+json");
        assert_eq!(config.download.max_redirects, 5);
        assert_eq!(config.download.inactivity_timeout_secs, 30);
        assert_eq!(config.download.progress_interval_ms, 1000);
        assert_eq!(config.install.relaunch_delay_secs, 2);
        assert!(config.install.relaunch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let toml_str = r#"
[app]
name = "Dashboard"
current_version = "1.9.9"

[download]
max_redirects = 3
"#;
        let config: UpdaterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.app.name, "Dashboard");
        assert_eq!(config.app.current_version, "1.9.9");
        assert_eq!(config.app.executable_name, "app");
        assert_eq!(config.download.max_redirects, 3);
        assert_eq!(config.download.connect_timeout_secs, 15);
        assert_eq!(config.app.bundle_dir_name(), "Dashboard.app");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = UpdaterConfig::default();
        config.app.name = "Dashboard".to_owned();
        config.release.release_page = Some("https://example.com/releases".to_owned());
        config.save_to_file(&path).unwrap();

        let loaded = UpdaterConfig::from_file(&path).unwrap();
        assert_eq!(loaded.app.name, "Dashboard");
        assert_eq!(
            loaded.release.release_page.as_deref(),
            Some("https://example.com/releases")
        );
    }

    #[test]
    fn validate_rejects_bad_endpoint() {
        let mut config = UpdaterConfig::default();
        config.release.endpoint = "not a url".to_owned();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("release.endpoint"));
    }

    #[test]
    fn validate_rejects_empty_executable() {
        let mut config = UpdaterConfig::default();
        config.app.executable_name = "  ".to_owned();
        assert!(config.validate().is_err());
    }
}
