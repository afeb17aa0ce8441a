use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const DOWNLOADS_STORAGE_KEY: &str = "file-downloads";

/// One entry of the local download history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
    pub file_id: String,
    pub file_name: String,
    pub download_uri: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_name: Option<String>,
}

impl DownloadItem {
    pub fn new(
        file_id: impl Into<String>,
        file_name: impl Into<String>,
        download_uri: impl Into<String>,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            file_name: file_name.into(),
            download_uri: download_uri.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            record_name: None,
        }
    }

    #[must_use]
    pub fn with_record_name(mut self, record_name: impl Into<String>) -> Self {
        self.record_name = Some(record_name.into());
        self
    }
}

/// String key/value persistence the download log is written through.
pub trait KeyValueStore {
    type Error: Display;

    fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;
    fn set(&self, key: &str, value: String) -> Result<(), Self::Error>;
    fn remove(&self, key: &str) -> Result<(), Self::Error>;
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    values: Mutex<HashMap<String, String>>,
}

impl KeyValueStore for MemoryKeyValueStore {
    type Error = Infallible;

    fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<(), Self::Error> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), Self::Error> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }
}

/// Keys stored as one JSON object on disk, replaced atomically on each write.
#[derive(Debug, Clone)]
pub struct JsonFileKeyValueStore {
    path: PathBuf,
}

impl JsonFileKeyValueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, String>, DownloadLogError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new());
            }
            Err(error) => {
                return Err(DownloadLogError::Storage {
                    message: format!("read {}: {error}", self.path.display()),
                });
            }
        };
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&raw).map_err(|error| DownloadLogError::Decode {
            message: error.to_string(),
        })
    }

    /// Like `read_all`, but a damaged file yields an empty map so writes can
    /// replace it. The flag reports whether the file was damaged.
    fn read_for_write(&self) -> Result<(HashMap<String, String>, bool), DownloadLogError> {
        match self.read_all() {
            Ok(values) => Ok((values, false)),
            Err(DownloadLogError::Decode { message }) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %message,
                    "replacing unreadable key-value file",
                );
                Ok((HashMap::new(), true))
            }
            Err(error) => Err(error),
        }
    }

    fn write_all(&self, values: &HashMap<String, String>) -> Result<(), DownloadLogError> {
        let storage_error = |error: std::io::Error| DownloadLogError::Storage {
            message: format!("write {}: {error}", self.path.display()),
        };
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let payload = serde_json::to_vec_pretty(values).map_err(|error| DownloadLogError::Decode {
            message: error.to_string(),
        })?;
        let temp_path = self
            .path
            .with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&temp_path, payload).map_err(storage_error)?;
        fs::rename(&temp_path, &self.path).map_err(storage_error)
    }
}

impl KeyValueStore for JsonFileKeyValueStore {
    type Error = DownloadLogError;

    fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<(), Self::Error> {
        let (mut values, _) = self.read_for_write()?;
        values.insert(key.to_string(), value);
        self.write_all(&values)
    }

    fn remove(&self, key: &str) -> Result<(), Self::Error> {
        let (mut values, damaged) = self.read_for_write()?;
        if values.remove(key).is_some() || damaged {
            self.write_all(&values)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DownloadLogError {
    #[error("download log storage failed: {message}")]
    Storage { message: String },
    #[error("download log could not be decoded: {message}")]
    Decode { message: String },
}

/// Persistent list of files the user downloaded, keyed by file id.
pub struct DownloadLog<S> {
    store: S,
}

impl<S: KeyValueStore> DownloadLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stored entries. Unreadable storage reads as an empty history.
    pub fn entries(&self) -> Vec<DownloadItem> {
        let raw = match self.store.get(DOWNLOADS_STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(error) => {
                tracing::warn!(error = %error, "failed to read download log");
                return Vec::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(error) => {
                tracing::warn!(error = %error, "discarding malformed download log");
                Vec::new()
            }
        }
    }

    /// Replaces an entry with the same file id in place, otherwise prepends.
    pub fn record(&self, item: DownloadItem) -> Result<Vec<DownloadItem>, DownloadLogError> {
        let mut items = self.entries();
        match items.iter_mut().find(|existing| existing.file_id == item.file_id) {
            Some(existing) => *existing = item,
            None => items.insert(0, item),
        }
        self.write(&items)?;
        Ok(items)
    }

    pub fn remove(&self, file_id: &str) -> Result<Vec<DownloadItem>, DownloadLogError> {
        let mut items = self.entries();
        items.retain(|item| item.file_id != file_id);
        self.write(&items)?;
        Ok(items)
    }

    pub fn clear(&self) -> Result<(), DownloadLogError> {
        self.store
            .remove(DOWNLOADS_STORAGE_KEY)
            .map_err(|error| DownloadLogError::Storage {
                message: error.to_string(),
            })
    }

    fn write(&self, items: &[DownloadItem]) -> Result<(), DownloadLogError> {
        let payload = serde_json::to_string(items).map_err(|error| DownloadLogError::Decode {
            message: error.to_string(),
        })?;
        self.store
            .set(DOWNLOADS_STORAGE_KEY, payload)
            .map_err(|error| DownloadLogError::Storage {
                message: error.to_string(),
            })
    }
}
