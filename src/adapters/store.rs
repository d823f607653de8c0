//! Configuration persistence adapters.
//!
//! [`JsonFileStore`] keeps the [`ConfigDocument`] as pretty-printed JSON on
//! disk; [`MemoryStore`] keeps it in memory for tests and throwaway runs.
//! Both report `None` when nothing has been saved yet.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use log::info;

use crate::app::ports::{ConfigDocument, ConfigPort};
use crate::error::StorageError;

/// Default file name, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "backend_config.json";

/// JSON file on disk.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigPort for JsonFileStore {
    fn load(&self) -> Result<Option<ConfigDocument>, StorageError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("STORE | no config at {}", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let doc = serde_json::from_str(&text)?;
        info!("STORE | loaded config from {}", self.path.display());
        Ok(Some(doc))
    }

    /// Written to a sibling temp file first and renamed into place, so a
    /// crash mid-write never leaves a truncated document.
    fn save(&self, doc: &ConfigDocument) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(doc)?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    doc: Mutex<Option<ConfigDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigPort for MemoryStore {
    fn load(&self) -> Result<Option<ConfigDocument>, StorageError> {
        Ok(self.doc.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, doc: &ConfigDocument) -> Result<(), StorageError> {
        *self.doc.lock().unwrap_or_else(PoisonError::into_inner) = Some(doc.clone());
        Ok(())
    }
}
