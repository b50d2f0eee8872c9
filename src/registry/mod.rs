//! Per-instance agent settings held in the external registry.
//!
//! The settings blob is opaque to this crate except for the
//! `disks.persistent` map from disk identity to device name, which the disk
//! manager edits around every attach and detach. Updates are plain
//! read-modify-write with last-writer-wins semantics.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::CpiConfig;

const DISKS_KEY: &str = "disks";
const PERSISTENT_KEY: &str = "persistent";
const RECORD_EXTENSION: &str = "json";

/// Errors raised while reading or writing registry records.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a stored record is not valid JSON of the expected shape.
    #[error("failed to parse settings for {key}: {message}")]
    Parse {
        /// Registry key.
        key: String,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when a key cannot be used as a record name.
    #[error("invalid registry key '{key}'")]
    InvalidKey {
        /// Offending key.
        key: String,
    },
}

/// Agent settings blob for one compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AgentSettings {
    value: Value,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            value: Value::Object(Map::new()),
        }
    }
}

impl AgentSettings {
    /// Wraps an existing settings document.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Parse`] when the document root or its
    /// `disks.persistent` section is not an object.
    pub fn from_value(key: &str, value: Value) -> Result<Self, RegistryError> {
        let settings = Self { value };
        settings
            .persistent()
            .map_err(|message| RegistryError::Parse {
                key: key.to_owned(),
                message,
            })?;
        Ok(settings)
    }

    /// Returns the raw settings document.
    #[must_use]
    pub const fn as_value(&self) -> &Value {
        &self.value
    }

    /// Returns the persistent disk map as disk identity to device name.
    #[must_use]
    pub fn persistent_disks(&self) -> BTreeMap<String, String> {
        self.persistent()
            .ok()
            .flatten()
            .map(|disks| {
                disks
                    .iter()
                    .filter_map(|(disk, device)| {
                        device.as_str().map(|name| (disk.clone(), name.to_owned()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Records `disk_id` as attached under `device`.
    pub fn insert_persistent_disk(&mut self, disk_id: &str, device: &str) {
        if let Some(disks) = self.persistent_mut() {
            disks.insert(disk_id.to_owned(), Value::String(device.to_owned()));
        }
    }

    /// Forgets `disk_id`; missing entries are ignored.
    pub fn remove_persistent_disk(&mut self, disk_id: &str) {
        if let Some(disks) = self.persistent_mut() {
            disks.remove(disk_id);
        }
    }

    fn persistent(&self) -> Result<Option<&Map<String, Value>>, String> {
        let root = self
            .value
            .as_object()
            .ok_or_else(|| String::from("settings root is not an object"))?;
        let Some(disks) = root.get(DISKS_KEY) else {
            return Ok(None);
        };
        let disks = disks
            .as_object()
            .ok_or_else(|| format!("{DISKS_KEY} must be an object"))?;
        disks.get(PERSISTENT_KEY).map_or(Ok(None), |persistent| {
            persistent
                .as_object()
                .map(Some)
                .ok_or_else(|| format!("{DISKS_KEY}.{PERSISTENT_KEY} must be an object"))
        })
    }

    fn persistent_mut(&mut self) -> Option<&mut Map<String, Value>> {
        let root = self.value.as_object_mut()?;
        let disks = root
            .entry(DISKS_KEY)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()?;
        disks
            .entry(PERSISTENT_KEY)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
    }
}

/// Keyed store for agent settings.
pub trait SettingsRegistry: Send + Sync {
    /// Reads the settings stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the record cannot be read or parsed.
    fn read(&self, key: &str) -> Result<Option<AgentSettings>, RegistryError>;

    /// Replaces the settings stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the record cannot be written.
    fn write(&self, key: &str, settings: &AgentSettings) -> Result<(), RegistryError>;

    /// Removes the record under `key`; missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] when the record exists but cannot be removed.
    fn delete(&self, key: &str) -> Result<(), RegistryError>;
}

/// Read-modify-write of the record under `key`. A missing record starts from
/// empty settings. Not guarded against concurrent writers.
///
/// # Errors
///
/// Returns [`RegistryError`] when reading or writing fails.
pub fn update_settings<R, F>(registry: &R, key: &str, edit: F) -> Result<(), RegistryError>
where
    R: SettingsRegistry + ?Sized,
    F: FnOnce(&mut AgentSettings),
{
    let mut settings = registry.read(key)?.unwrap_or_default();
    edit(&mut settings);
    registry.write(key, &settings)
}

/// Process-local registry, used when embedding the CPI without an external
/// store and by tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    records: Arc<Mutex<BTreeMap<String, AgentSettings>>>,
}

impl MemoryRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the keys currently stored.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.records
            .lock()
            .map(|records| records.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn poisoned(key: &str) -> RegistryError {
        RegistryError::Io {
            path: key.to_owned(),
            message: String::from("registry lock poisoned"),
        }
    }
}

impl SettingsRegistry for MemoryRegistry {
    fn read(&self, key: &str) -> Result<Option<AgentSettings>, RegistryError> {
        let records = self.records.lock().map_err(|_| Self::poisoned(key))?;
        Ok(records.get(key).cloned())
    }

    fn write(&self, key: &str, settings: &AgentSettings) -> Result<(), RegistryError> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned(key))?;
        records.insert(key.to_owned(), settings.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let mut records = self.records.lock().map_err(|_| Self::poisoned(key))?;
        records.remove(key);
        Ok(())
    }
}

/// Registry storing one `<key>.json` document per instance under a directory.
#[derive(Clone, Debug)]
pub struct FileRegistry {
    root: Utf8PathBuf,
}

impl FileRegistry {
    /// Creates a registry rooted at `root`; the directory is created on first
    /// write.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Registry rooted at the configured `registry_path`, when one is set.
    #[must_use]
    pub fn from_config(config: &CpiConfig) -> Option<Self> {
        config
            .registry_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(Self::new)
    }

    /// Directory holding the records.
    #[must_use]
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn file_name(key: &str) -> Result<String, RegistryError> {
        if key.is_empty()
            || key.trim() != key
            || key.contains('/')
            || key.contains('\\')
            || key.starts_with('.')
        {
            return Err(RegistryError::InvalidKey {
                key: key.to_owned(),
            });
        }
        Ok(format!("{key}.{RECORD_EXTENSION}"))
    }

    fn open_root(&self) -> Result<Option<Dir>, RegistryError> {
        match Dir::open_ambient_dir(&self.root, ambient_authority()) {
            Ok(dir) => Ok(Some(dir)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Self::io_error(&self.root, &err)),
        }
    }

    fn io_error(path: &Utf8Path, err: &io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

impl SettingsRegistry for FileRegistry {
    fn read(&self, key: &str) -> Result<Option<AgentSettings>, RegistryError> {
        let file_name = Self::file_name(key)?;
        let Some(dir) = self.open_root()? else {
            return Ok(None);
        };
        let contents = match dir.read_to_string(&file_name) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Self::io_error(&self.root.join(&file_name), &err)),
        };
        let value: Value = serde_json::from_str(&contents).map_err(|err| RegistryError::Parse {
            key: key.to_owned(),
            message: err.to_string(),
        })?;
        AgentSettings::from_value(key, value).map(Some)
    }

    fn write(&self, key: &str, settings: &AgentSettings) -> Result<(), RegistryError> {
        let file_name = Self::file_name(key)?;
        Dir::create_ambient_dir_all(&self.root, ambient_authority())
            .map_err(|err| Self::io_error(&self.root, &err))?;
        let dir = Dir::open_ambient_dir(&self.root, ambient_authority())
            .map_err(|err| Self::io_error(&self.root, &err))?;
        let rendered =
            serde_json::to_string_pretty(settings.as_value()).map_err(|err| RegistryError::Parse {
                key: key.to_owned(),
                message: err.to_string(),
            })?;
        dir.write(&file_name, rendered)
            .map_err(|err| Self::io_error(&self.root.join(&file_name), &err))
    }

    fn delete(&self, key: &str) -> Result<(), RegistryError> {
        let file_name = Self::file_name(key)?;
        let Some(dir) = self.open_root()? else {
            return Ok(());
        };
        match dir.remove_file(&file_name) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Self::io_error(&self.root.join(&file_name), &err)),
        }
    }
}
