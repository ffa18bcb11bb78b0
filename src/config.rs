//! Configuration for the update subsystem.

use crate::channel::{Channel, ChannelRole, ChannelSpec, DescriptorFormat, UrlSource};
use crate::error::{Result, UpdateError};
use crate::retry::RetryPolicy;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BASELINE: &str = "1.3.11.001";
const DEV_MANIFEST_URL: &str = "https://ghfast.top/https://raw.githubusercontent.com/steven118-live/OrionTVR/refs/heads/dev/package.json";
const TAG_MANIFEST_URL: &str = "https://ghfast.top/https://raw.githubusercontent.com/steven118-live/OrionTVR/refs/tags/v{version}/package.json";
const UPSTREAM_MANIFEST_URL: &str = "https://ghfast.top/https://raw.githubusercontent.com/orion-lib/OrionTV/refs/heads/master/package.json";
const DOWNLOAD_URL: &str = "https://ghfast.top/https://github.com/steven118-live/OrionTVR/releases/download/v{version}/{version}.apk";

/// Top-level update configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Channel the installed build came from.
    pub current_channel: Channel,
    /// Installed version. `None` falls back to the crate version.
    pub installed_version: Option<Version>,
    /// Whether periodic checks run at all.
    pub auto_check_enabled: bool,
    /// Whether the host allows a background timer (TV launchers often don't).
    pub background_timers: bool,
    /// Minimum time between automatic checks, in milliseconds.
    pub check_interval_ms: u64,
    /// Per-request timeout for version descriptor fetches, in milliseconds.
    pub timeout_ms: u64,
    /// Total transfer timeout for a package download, in milliseconds.
    pub download_timeout_ms: u64,
    /// Attempts per fetch or download before giving up.
    pub max_retries: u32,
    /// Backoff unit for version checks; attempt `n` waits `n` units.
    pub check_retry_delay_ms: u64,
    /// Backoff unit for downloads; attempt `n` waits `n` units.
    pub download_retry_delay_ms: u64,
    /// Number of downloaded artifacts kept on disk.
    pub retention_count: usize,
    /// Directory holding downloaded artifacts. `None` uses the platform data dir.
    pub artifact_dir: Option<PathBuf>,
    /// Artifact filename prefix (`<prefix>_v<version>.<ext>`).
    pub artifact_prefix: String,
    /// Artifact filename extension.
    pub artifact_extension: String,
    /// Append a `t=<millis>` query parameter to version descriptor URLs.
    pub cache_bust: bool,
    /// Content provider authority used to share artifacts with the system
    /// package installer. Installing is unsupported without one.
    pub install_authority: Option<String>,
    /// Channel table.
    pub channels: Vec<ChannelSpec>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        let baseline = Version::parse(DEFAULT_BASELINE);
        Self {
            current_channel: Channel::tag(),
            installed_version: None,
            auto_check_enabled: true,
            background_timers: true,
            check_interval_ms: 12 * 60 * 60 * 1000,
            timeout_ms: 10_000,
            download_timeout_ms: 10 * 60 * 1000,
            max_retries: 3,
            check_retry_delay_ms: 2_000,
            download_retry_delay_ms: 3_000,
            retention_count: 2,
            artifact_dir: None,
            artifact_prefix: "OrionTV".to_owned(),
            artifact_extension: "apk".to_owned(),
            cache_bust: true,
            install_authority: None,
            channels: vec![
                ChannelSpec {
                    name: Channel::dev(),
                    version_source: UrlSource::Static(DEV_MANIFEST_URL.to_owned()),
                    baseline_version: baseline.clone(),
                    download_url: UrlSource::Templated(DOWNLOAD_URL.to_owned()),
                    role: ChannelRole::Gating,
                    format: DescriptorFormat::Manifest,
                },
                ChannelSpec {
                    name: Channel::tag(),
                    version_source: UrlSource::Templated(TAG_MANIFEST_URL.to_owned()),
                    baseline_version: baseline.clone(),
                    download_url: UrlSource::Templated(DOWNLOAD_URL.to_owned()),
                    role: ChannelRole::Gating,
                    format: DescriptorFormat::Manifest,
                },
                ChannelSpec {
                    name: Channel::upstream(),
                    version_source: UrlSource::Static(UPSTREAM_MANIFEST_URL.to_owned()),
                    baseline_version: Version::parse("0"),
                    download_url: UrlSource::Templated(DOWNLOAD_URL.to_owned()),
                    role: ChannelRole::Reference,
                    format: DescriptorFormat::Manifest,
                },
            ],
        }
    }
}

impl UpdateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid TOML, or
    /// fails [`validate`](Self::validate).
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| UpdateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/channel-updater/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("channel-updater").join("config.toml")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("channel-updater")
                .join("config.toml")
        } else {
            PathBuf::from("/tmp/channel-updater/config.toml")
        }
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`UpdateError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.retention_count == 0 {
            return Err(UpdateError::Config("retention_count must be at least 1".to_owned()));
        }
        if self.max_retries == 0 {
            return Err(UpdateError::Config("max_retries must be at least 1".to_owned()));
        }
        match self.channel(&self.current_channel) {
            Some(spec) if spec.is_gating() => {}
            Some(_) => {
                return Err(UpdateError::Config(format!(
                    "current channel `{}` is a reference channel",
                    self.current_channel
                )));
            }
            None => {
                return Err(UpdateError::Config(format!(
                    "current channel `{}` is not configured",
                    self.current_channel
                )));
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.channels {
            if !seen.insert(&spec.name) {
                return Err(UpdateError::Config(format!(
                    "channel `{}` is configured twice",
                    spec.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a channel by name.
    pub fn channel(&self, name: &Channel) -> Option<&ChannelSpec> {
        self.channels.iter().find(|c| &c.name == name)
    }

    /// Baseline version per gating channel.
    pub fn baselines(&self) -> BTreeMap<Channel, Version> {
        self.channels
            .iter()
            .filter(|c| c.is_gating())
            .map(|c| (c.name.clone(), c.baseline_version.clone()))
            .collect()
    }

    /// The installed version, defaulting to the crate version.
    pub fn installed_version(&self) -> Version {
        self.installed_version
            .clone()
            .unwrap_or_else(|| Version::parse(env!("CARGO_PKG_VERSION")))
    }

    /// Directory for downloaded artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("channel-updater")
                .join("artifacts")
        })
    }

    /// Retry policy for version descriptor fetches.
    pub fn check_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.check_retry_delay_ms),
        )
    }

    /// Retry policy for package downloads.
    pub fn download_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.download_retry_delay_ms),
        )
    }

    /// Minimum interval between automatic checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = UpdateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retention_count, 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.timeout_ms, 10_000);
        assert_eq!(config.check_interval_ms, 43_200_000);
    }

    #[test]
    fn default_baselines_cover_gating_channels_only() {
        let baselines = UpdateConfig::default().baselines();
        assert_eq!(baselines.len(), 2);
        assert_eq!(baselines[&Channel::dev()].as_str(), "1.3.11.001");
        assert_eq!(baselines[&Channel::tag()].as_str(), "1.3.11.001");
        assert!(!baselines.contains_key(&Channel::upstream()));
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = UpdateConfig::default();
        config.retention_count = 3;
        config.installed_version = Some(Version::parse("1.3.10.000-tag"));
        config.save_to_file(&path).unwrap();

        let loaded = UpdateConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: UpdateConfig = toml::from_str(
            r#"
            current_channel = "dev"
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.current_channel, Channel::dev());
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.channels.len(), 3);
    }

    #[test]
    fn from_file_nonexistent_returns_error() {
        let result = UpdateConfig::from_file(std::path::Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(matches!(UpdateConfig::from_file(&path), Err(UpdateError::Config(_))));
    }

    #[test]
    fn validate_rejects_reference_current_channel() {
        let config = UpdateConfig {
            current_channel: Channel::upstream(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_retention() {
        let config = UpdateConfig {
            retention_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_duplicate_channel() {
        let mut config = UpdateConfig::default();
        let dup = config.channels[0].clone();
        config.channels.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_config_path_ends_with_config_toml() {
        let path = UpdateConfig::default_config_path();
        let path_str = path.to_string_lossy();
        assert!(path_str.ends_with("config.toml"));
        assert!(path_str.contains("channel-updater"));
    }

    #[test]
    fn installed_version_falls_back_to_crate_version() {
        let config = UpdateConfig::default();
        assert_eq!(config.installed_version().as_str(), env!("CARGO_PKG_VERSION"));
    }
}
