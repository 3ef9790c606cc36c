//! Durable storage behind the filter state store.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use mosaic_core::StorageError;

use super::user_key::UserScopedKey;

/// Key-value storage for serialized filter records.
///
/// Calls are synchronous and small; the store never holds one across an
/// `.await`.
pub trait FilterPersistence: Send + Sync {
    fn load(&self, key: &UserScopedKey) -> Result<Option<Vec<u8>>, StorageError>;

    fn save(&self, key: &UserScopedKey, record: &[u8]) -> Result<(), StorageError>;

    /// Removing an absent key is not an error.
    fn remove(&self, key: &UserScopedKey) -> Result<(), StorageError>;
}

impl<P: FilterPersistence + ?Sized> FilterPersistence for Arc<P> {
    fn load(&self, key: &UserScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).load(key)
    }

    fn save(&self, key: &UserScopedKey, record: &[u8]) -> Result<(), StorageError> {
        (**self).save(key, record)
    }

    fn remove(&self, key: &UserScopedKey) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

impl<P: FilterPersistence + ?Sized> FilterPersistence for Box<P> {
    fn load(&self, key: &UserScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        (**self).load(key)
    }

    fn save(&self, key: &UserScopedKey, record: &[u8]) -> Result<(), StorageError> {
        (**self).save(key, record)
    }

    fn remove(&self, key: &UserScopedKey) -> Result<(), StorageError> {
        (**self).remove(key)
    }
}

/// Process-local persistence for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct InMemoryFilterPersistence {
    records: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryFilterPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store raw bytes under a key, bypassing the filter store.
    pub fn insert_raw(&self, key: &UserScopedKey, record: impl Into<Vec<u8>>) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.encode(), record.into());
    }
}

impl FilterPersistence for InMemoryFilterPersistence {
    fn load(&self, key: &UserScopedKey) -> Result<Option<Vec<u8>>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.get(&key.encode()).cloned())
    }

    fn save(&self, key: &UserScopedKey, record: &[u8]) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        records.insert(key.encode(), record.to_vec());
        Ok(())
    }

    fn remove(&self, key: &UserScopedKey) -> Result<(), StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::LockPoisoned)?;
        records.remove(&key.encode());
        Ok(())
    }
}
