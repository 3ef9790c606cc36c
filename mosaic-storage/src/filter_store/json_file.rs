//! File-per-key JSON persistence.
//!
//! Each record lives at `{root}/filters/{user}/{partition}.json`. Writes go
//! to a sibling temp file first and are renamed into place, so a crash never
//! leaves a half-written record behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use mosaic_core::StorageError;
use tracing::debug;

use super::persistence::FilterPersistence;
use super::user_key::UserScopedKey;

#[derive(Debug, Clone)]
pub struct JsonFileFilterPersistence {
    root: PathBuf,
}

impl JsonFileFilterPersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &UserScopedKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.encode().split('/') {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }
}

impl FilterPersistence for JsonFileFilterPersistence {
    fn load(&self, key: &UserScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::ReadFailed {
                key: key.encode(),
                reason: err.to_string(),
            }),
        }
    }

    fn save(&self, key: &UserScopedKey, record: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let write_failed = |err: std::io::Error| StorageError::WriteFailed {
            key: key.encode(),
            reason: err.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_failed)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, record).map_err(write_failed)?;
        std::fs::rename(&tmp, &path).map_err(write_failed)?;
        debug!(path = %path.display(), bytes = record.len(), "Saved filter record");
        Ok(())
    }

    fn remove(&self, key: &UserScopedKey) -> Result<(), StorageError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::WriteFailed {
                key: key.encode(),
                reason: err.to_string(),
            }),
        }
    }
}
