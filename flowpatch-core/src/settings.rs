//! The persisted settings record and the stores that load it.

use crate::error::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "flowpatch";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// One snapshot of the user's settings.
///
/// Every load produces a fresh, owned value so a flow keeps working against the
/// snapshot it started with even if the file changes underneath it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub username: String,
    pub password: String,
    /// Exact source URL -> replacement URL
    pub url_replacements: HashMap<String, String>,
    /// Source of `function custom_request(flow)`; empty means no request unit
    pub custom_request_code: String,
    /// Source of `function custom_response(flow)`; empty means no response unit
    pub custom_response_code: String,
}

impl Settings {
    /// Username and password, only when both are non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() || self.password.is_empty() {
            None
        } else {
            Some((self.username.as_str(), self.password.as_str()))
        }
    }
}

/// Source of [`Settings`]. Implementations must be cheap enough to call once per flow.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<Settings, ConfigError>;
}

/// Settings kept in a single JSON file, written by the embedding application.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store backed by `settings.json` inside [`default_settings_dir`].
    pub fn in_default_location() -> std::io::Result<Self> {
        Ok(Self::new(default_settings_dir()?.join(SETTINGS_FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        // A missing file is a fresh install, not an error
        if !self.path.exists() {
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.display().to_string(),
            source,
        })?;

        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }
}

/// In-process store for embedders that own their settings, and for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    settings: RwLock<Settings>,
}

impl MemoryStore {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
        }
    }

    /// Replace the whole record.
    pub fn replace(&self, settings: Settings) {
        *self.settings.write() = settings;
    }

    /// Edit the record in place under the write lock.
    pub fn update(&self, edit: impl FnOnce(&mut Settings)) {
        let mut guard = self.settings.write();
        edit(&mut *guard);
    }
}

impl ConfigStore for MemoryStore {
    fn load(&self) -> Result<Settings, ConfigError> {
        Ok(self.settings.read().clone())
    }
}

/// Per-user application directory: `$APPDATA/flowpatch`, or `./flowpatch` when
/// `APPDATA` is not set. Created if missing.
pub fn default_settings_dir() -> std::io::Result<PathBuf> {
    let base = std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .map_or_else(std::env::current_dir, Ok)?;
    let dir = base.join(APP_DIR_NAME);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}
