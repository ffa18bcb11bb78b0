//! Update state persistence.
//!
//! Tracks the version the user chose to skip and when the last successful
//! check ran. Values live in a [`KeyValueStore`]; the default store is a JSON
//! file at `~/.config/channel-updater/update-state.json`.

use crate::error::{Result, UpdateError};
use crate::version::Version;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key holding the skipped version string.
pub const SKIP_VERSION_KEY: &str = "skip_version";
/// Key holding the RFC 3339 time of the last successful check.
pub const LAST_CHECK_TIME_KEY: &str = "last_check_time";

/// Small string key-value store surviving restarts.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Store backed by a pretty-printed JSON object on disk.
///
/// A missing or unreadable file starts out empty. Every write rewrites the
/// whole file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            values: Mutex::new(values),
        }
    }

    /// Returns the default state file path.
    pub fn default_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config)
                .join("channel-updater")
                .join("update-state.json")
        } else if let Some(home) = std::env::var_os("HOME") {
            PathBuf::from(home)
                .join(".config")
                .join("channel-updater")
                .join("update-state.json")
        } else {
            std::env::temp_dir()
                .join("channel-updater")
                .join("update-state.json")
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn update(&self, apply: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut values = self
            .values
            .lock()
            .map_err(|_| UpdateError::Storage("state lock poisoned".to_owned()))?;
        apply(&mut values);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::Storage(format!(
                    "cannot create state directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let json = serde_json::to_string_pretty(&*values)
            .map_err(|e| UpdateError::Storage(format!("cannot serialize update state: {e}")))?;
        std::fs::write(&self.path, json).map_err(|e| {
            UpdateError::Storage(format!(
                "cannot write update state to {}: {e}",
                self.path.display()
            ))
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self
            .values
            .lock()
            .map_err(|_| UpdateError::Storage("state lock poisoned".to_owned()))?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|values| {
            values.insert(key.to_owned(), value.to_owned());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|values| {
            values.remove(key);
        })
    }
}

/// In-memory store, for tests and hosts without writable storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .lock()
            .map_err(|_| UpdateError::Storage("state lock poisoned".to_owned()))?
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| UpdateError::Storage("state lock poisoned".to_owned()))?
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| UpdateError::Storage("state lock poisoned".to_owned()))?
            .remove(key);
        Ok(())
    }
}

/// Typed view over the persisted update keys.
#[derive(Clone)]
pub struct UpdateState {
    store: Arc<dyn KeyValueStore>,
}

impl UpdateState {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Version the user chose to skip, if any.
    pub fn skip_version(&self) -> Result<Option<Version>> {
        Ok(self
            .store
            .get(SKIP_VERSION_KEY)?
            .filter(|s| !s.trim().is_empty())
            .map(|s| Version::parse(&s)))
    }

    pub fn set_skip_version(&self, version: &Version) -> Result<()> {
        self.store.set(SKIP_VERSION_KEY, version.as_str())
    }

    pub fn clear_skip_version(&self) -> Result<()> {
        self.store.remove(SKIP_VERSION_KEY)
    }

    /// Returns `true` if `version` is the skipped one.
    pub fn is_skipped(&self, version: &Version) -> Result<bool> {
        Ok(self.skip_version()?.is_some_and(|skipped| &skipped == version))
    }

    /// Time of the last successful check. Unparseable values read as `None`.
    pub fn last_check(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .store
            .get(LAST_CHECK_TIME_KEY)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Record a successful check at `now`.
    pub fn mark_checked(&self, now: DateTime<Utc>) -> Result<()> {
        self.store.set(LAST_CHECK_TIME_KEY, &now.to_rfc3339())
    }

    /// Returns `true` if no check was recorded or the last one is at least
    /// `interval` old.
    pub fn check_is_due(&self, now: DateTime<Utc>, interval: Duration) -> Result<bool> {
        let Some(last) = self.last_check()? else {
            return Ok(true);
        };
        let elapsed = now.signed_duration_since(last);
        Ok(elapsed.to_std().map_or(false, |e| e >= interval))
    }
}

impl std::fmt::Debug for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateState").finish_non_exhaustive()
    }
}
