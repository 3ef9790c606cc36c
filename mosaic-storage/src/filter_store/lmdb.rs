//! LMDB-backed filter persistence.
//!
//! Uses the heed crate (Rust bindings for LMDB). Keys are the encoded
//! [`UserScopedKey`] strings, so every record of one user shares a prefix.

use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use mosaic_core::StorageError;
use tracing::info;

use super::persistence::FilterPersistence;
use super::user_key::UserScopedKey;

pub struct LmdbFilterPersistence {
    env: Env,
    db: Database<Bytes, Bytes>,
}

impl std::fmt::Debug for LmdbFilterPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbFilterPersistence")
            .field("path", &self.env.path())
            .finish()
    }
}

impl LmdbFilterPersistence {
    /// Open (or create) the environment in `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the directory cannot be created or
    /// the environment or database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let open_failed = |reason: String| StorageError::Open {
            path: path.display().to_string(),
            reason,
        };

        std::fs::create_dir_all(path).map_err(|e| open_failed(e.to_string()))?;

        // SAFETY: the environment is opened once per path by this process and
        // the memory map is not modified outside of heed transactions.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path)
        }
        .map_err(|e| open_failed(e.to_string()))?;

        let mut wtxn = env.write_txn().map_err(|e| open_failed(e.to_string()))?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| open_failed(e.to_string()))?;
        wtxn.commit().map_err(|e| open_failed(e.to_string()))?;

        info!(path = %path.display(), max_size_mb, "Opened LMDB filter store");
        Ok(Self { env, db })
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<u64, StorageError> {
        let rtxn = self.env.read_txn().map_err(|e| StorageError::ReadFailed {
            key: "*".to_string(),
            reason: e.to_string(),
        })?;
        self.db.len(&rtxn).map_err(|e| StorageError::ReadFailed {
            key: "*".to_string(),
            reason: e.to_string(),
        })
    }
}

impl FilterPersistence for LmdbFilterPersistence {
    fn load(&self, key: &UserScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        let encoded = key.encode();
        let read_failed = |reason: String| StorageError::ReadFailed {
            key: encoded.clone(),
            reason,
        };

        let rtxn = self.env.read_txn().map_err(|e| read_failed(e.to_string()))?;
        let value = self
            .db
            .get(&rtxn, encoded.as_bytes())
            .map_err(|e| read_failed(e.to_string()))?;
        Ok(value.map(<[u8]>::to_vec))
    }

    fn save(&self, key: &UserScopedKey, record: &[u8]) -> Result<(), StorageError> {
        let encoded = key.encode();
        let write_failed = |reason: String| StorageError::WriteFailed {
            key: encoded.clone(),
            reason,
        };

        let mut wtxn = self.env.write_txn().map_err(|e| write_failed(e.to_string()))?;
        self.db
            .put(&mut wtxn, encoded.as_bytes(), record)
            .map_err(|e| write_failed(e.to_string()))?;
        wtxn.commit().map_err(|e| write_failed(e.to_string()))
    }

    fn remove(&self, key: &UserScopedKey) -> Result<(), StorageError> {
        let encoded = key.encode();
        let write_failed = |reason: String| StorageError::WriteFailed {
            key: encoded.clone(),
            reason,
        };

        let mut wtxn = self.env.write_txn().map_err(|e| write_failed(e.to_string()))?;
        self.db
            .delete(&mut wtxn, encoded.as_bytes())
            .map_err(|e| write_failed(e.to_string()))?;
        wtxn.commit().map_err(|e| write_failed(e.to_string()))
    }
}
