//! Per-user, per-partition filter state.
//!
//! [`FilterStateStore`] owns the current criteria of both partitions. Every
//! successful `set` or `reset` persists the result, bumps the partition's
//! generation and hands back a new [`KeyedCriteria`], so callers always hold
//! the criteria, the cache key derived from them and the generation that key
//! belongs to as one value.

pub mod json_file;
pub mod lmdb;
pub mod persistence;
pub mod user_key;

pub use json_file::JsonFileFilterPersistence;
pub use lmdb::LmdbFilterPersistence;
pub use persistence::{FilterPersistence, InMemoryFilterPersistence};
pub use user_key::UserScopedKey;

use std::sync::{Arc, PoisonError, RwLock};

use mosaic_core::{
    EngineConfig, FilterCriteria, FilterPatch, ListingError, Partition, Timestamp, UserId,
    ValidationError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, Generation, GenerationClock};

/// Current persisted record layout.
pub const RECORD_VERSION: u32 = 1;

/// The signed-in account the store is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: UserId,
    pub account_created_at: Timestamp,
}

impl UserContext {
    pub fn new(user_id: UserId, account_created_at: Timestamp) -> Self {
        Self {
            user_id,
            account_created_at,
        }
    }
}

/// Criteria together with their cache key, generation and page size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyedCriteria {
    pub criteria: FilterCriteria,
    pub key: CacheKey,
    pub generation: Generation,
    pub page_size: u32,
}

impl KeyedCriteria {
    pub fn partition(&self) -> Partition {
        self.key.partition()
    }
}

/// On-disk record of one partition's filter state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedFilters {
    pub version: u32,
    pub criteria: FilterCriteria,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_size: Option<u32>,
}

#[derive(Debug, Clone)]
struct Slot {
    criteria: FilterCriteria,
    page_size: u32,
}

pub struct FilterStateStore<P: FilterPersistence> {
    user: UserContext,
    persistence: P,
    clock: Arc<GenerationClock>,
    config: EngineConfig,
    slots: RwLock<[Option<Slot>; 2]>,
}

impl<P: FilterPersistence> std::fmt::Debug for FilterStateStore<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterStateStore")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

impl<P: FilterPersistence> FilterStateStore<P> {
    pub fn new(
        user: UserContext,
        persistence: P,
        clock: Arc<GenerationClock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            user,
            persistence,
            clock,
            config,
            slots: RwLock::new([None, None]),
        }
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    pub fn clock(&self) -> &Arc<GenerationClock> {
        &self.clock
    }

    /// Default criteria: an open window from account creation onwards.
    pub fn defaults(&self) -> FilterCriteria {
        FilterCriteria::defaults(self.user.account_created_at)
    }

    fn default_page_size(&self, partition: Partition) -> u32 {
        match partition {
            Partition::Active => self.config.active_page_size,
            Partition::Trashed => self.config.default_trashed_page_size,
        }
    }

    fn storage_key(&self, partition: Partition) -> UserScopedKey {
        UserScopedKey::new(self.user.user_id.clone(), partition)
    }

    fn keyed(&self, partition: Partition, slot: &Slot, generation: Generation) -> KeyedCriteria {
        KeyedCriteria {
            key: CacheKey::new(self.user.user_id.clone(), partition, &slot.criteria),
            criteria: slot.criteria.clone(),
            generation,
            page_size: slot.page_size,
        }
    }

    /// Current criteria of a partition.
    ///
    /// Loads the persisted record on first access; a missing, unreadable or
    /// undecodable record yields the defaults. Never bumps the generation.
    pub fn get(&self, partition: Partition) -> KeyedCriteria {
        if let Some(slot) = &self.slots.read().unwrap_or_else(PoisonError::into_inner)
            [partition.index()]
        {
            return self.keyed(partition, slot, self.clock.current(partition));
        }

        let loaded = self.load(partition);
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let slot = slots[partition.index()].get_or_insert(loaded).clone();
        drop(slots);
        self.keyed(partition, &slot, self.clock.current(partition))
    }

    /// Merge `patch`, validate, persist, and bump the generation.
    ///
    /// An invalid result is rejected before anything is written.
    pub fn set(
        &self,
        partition: Partition,
        patch: &FilterPatch,
    ) -> Result<KeyedCriteria, ListingError> {
        let current = self.get(partition);
        let criteria = current.criteria.apply(patch);
        criteria.validate()?;

        let slot = Slot {
            criteria,
            page_size: current.page_size,
        };
        self.persist(partition, &slot)?;
        let keyed = self.install(partition, slot);
        info!(
            user_id = %self.user.user_id,
            partition = %partition,
            generation = %keyed.generation,
            "Filters updated"
        );
        Ok(keyed)
    }

    /// Restore the default criteria and drop the persisted record.
    pub fn reset(&self, partition: Partition) -> Result<KeyedCriteria, ListingError> {
        self.persistence.remove(&self.storage_key(partition))?;
        let slot = Slot {
            criteria: self.defaults(),
            page_size: self.default_page_size(partition),
        };
        let keyed = self.install(partition, slot);
        info!(
            user_id = %self.user.user_id,
            partition = %partition,
            generation = %keyed.generation,
            "Filters reset"
        );
        Ok(keyed)
    }

    /// Persist the trashed partition's page-size selection.
    ///
    /// The cache key does not depend on the page size, so the generation is
    /// left alone; the cache's page intent drops responses of the old size.
    pub fn set_page_size(
        &self,
        partition: Partition,
        size: u32,
    ) -> Result<KeyedCriteria, ListingError> {
        match partition {
            Partition::Active if size != self.config.active_page_size => {
                return Err(ValidationError::InvalidValue {
                    field: "page_size".to_string(),
                    reason: format!(
                        "active partition uses a fixed page size of {}",
                        self.config.active_page_size
                    ),
                }
                .into());
            }
            Partition::Trashed if !self.config.is_allowed_trashed_page_size(size) => {
                return Err(ValidationError::InvalidValue {
                    field: "page_size".to_string(),
                    reason: format!(
                        "{size} is not one of {:?}",
                        self.config.trashed_page_sizes
                    ),
                }
                .into());
            }
            _ => {}
        }

        let current = self.get(partition);
        let slot = Slot {
            criteria: current.criteria,
            page_size: size,
        };
        self.persist(partition, &slot)?;
        {
            let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
            slots[partition.index()] = Some(slot.clone());
        }
        debug!(partition = %partition, page_size = size, "Page size updated");
        Ok(self.keyed(partition, &slot, self.clock.current(partition)))
    }

    fn install(&self, partition: Partition, slot: Slot) -> KeyedCriteria {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        slots[partition.index()] = Some(slot.clone());
        // Bump while holding the slot lock so a concurrent `get` never pairs
        // the new criteria with the old generation.
        let generation = self.clock.advance(partition);
        drop(slots);
        self.keyed(partition, &slot, generation)
    }

    fn persist(&self, partition: Partition, slot: &Slot) -> Result<(), ListingError> {
        let record = PersistedFilters {
            version: RECORD_VERSION,
            criteria: slot.criteria.clone(),
            page_size: (slot.page_size != self.default_page_size(partition))
                .then_some(slot.page_size),
        };
        let key = self.storage_key(partition);
        let bytes = serde_json::to_vec(&record).map_err(|e| ListingError::Storage {
            reason: format!("failed to encode {}: {e}", key.encode()),
        })?;
        self.persistence.save(&key, &bytes)?;
        Ok(())
    }

    fn load(&self, partition: Partition) -> Slot {
        let key = self.storage_key(partition);
        let fallback = || Slot {
            criteria: self.defaults(),
            page_size: self.default_page_size(partition),
        };

        let bytes = match self.persistence.load(&key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return fallback(),
            Err(err) => {
                warn!(key = %key.encode(), error = %err, "Failed to read filters, using defaults");
                return fallback();
            }
        };

        let record = match serde_json::from_slice::<PersistedFilters>(&bytes) {
            Ok(record) if record.version == RECORD_VERSION => record,
            Ok(record) => {
                warn!(key = %key.encode(), version = record.version, "Unknown filter record version, using defaults");
                return fallback();
            }
            Err(err) => {
                warn!(key = %key.encode(), error = %err, "Undecodable filter record, using defaults");
                return fallback();
            }
        };
        if let Err(err) = record.criteria.validate() {
            warn!(key = %key.encode(), error = %err, "Persisted filters invalid, using defaults");
            return fallback();
        }

        let page_size = match (partition, record.page_size) {
            (Partition::Trashed, Some(size)) if self.config.is_allowed_trashed_page_size(size) => {
                size
            }
            _ => self.default_page_size(partition),
        };
        debug!(key = %key.encode(), "Restored persisted filters");
        Slot {
            criteria: record.criteria,
            page_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mosaic_core::{DateRange, SortDirection, SortField, SortSpec, StatusFilter};

    fn created() -> Timestamp {
        Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()
    }

    fn now() -> Timestamp {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn store(
        persistence: Arc<InMemoryFilterPersistence>,
    ) -> FilterStateStore<Arc<InMemoryFilterPersistence>> {
        FilterStateStore::new(
            UserContext::new(UserId::new("u1"), created()),
            persistence,
            Arc::new(GenerationClock::new()),
            EngineConfig::default(),
        )
    }

    #[test]
    fn test_get_defaults_and_is_stable() {
        let store = store(Arc::default());
        let a = store.get(Partition::Active);
        let b = store.get(Partition::Active);
        assert_eq!(a, b);
        assert_eq!(a.criteria, FilterCriteria::defaults(created()));
        assert_eq!(a.generation, Generation::new(0));
        assert_eq!(a.page_size, 15);
        assert_eq!(store.get(Partition::Trashed).page_size, 10);
    }

    #[test]
    fn test_set_persists_and_bumps() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        let store = store(Arc::clone(&persistence));
        let before = store.get(Partition::Active);

        let after = store
            .set(Partition::Active, &FilterPatch::new().with_status(StatusFilter::Failed))
            .unwrap();
        assert_ne!(before.key, after.key);
        assert!(before.generation.is_superseded_by(after.generation));
        assert_eq!(persistence.len(), 1);
        assert_eq!(store.get(Partition::Trashed).generation, Generation::new(0));
    }

    #[test]
    fn test_invalid_set_changes_nothing() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        let store = store(Arc::clone(&persistence));
        let before = store.get(Partition::Active);

        let err = store
            .set(
                Partition::Active,
                &FilterPatch::new().with_date_range(DateRange::new(now(), created())),
            )
            .unwrap_err();
        assert!(matches!(err, ListingError::Validation(_)));
        assert_eq!(store.get(Partition::Active), before);
        assert!(persistence.is_empty());
    }

    #[test]
    fn test_reset_restores_defaults_and_clears_record() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        let store = store(Arc::clone(&persistence));
        store
            .set(
                Partition::Active,
                &FilterPatch::new()
                    .with_query("robots")
                    .with_status(StatusFilter::Complete)
                    .with_sort(SortSpec::new(SortField::Title, SortDirection::Asc)),
            )
            .unwrap();

        let reset = store.reset(Partition::Active).unwrap();
        assert_eq!(reset.criteria.date_range, DateRange::since(created()));
        assert_eq!(reset.criteria.status, StatusFilter::All);
        assert_eq!(reset.criteria.sort, SortSpec::default());
        assert_eq!(reset.criteria.query, "");
        assert_eq!(reset.generation, Generation::new(2));
        assert!(persistence.is_empty());
    }

    #[test]
    fn test_users_never_share_filters() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        store(Arc::clone(&persistence))
            .set(Partition::Active, &FilterPatch::new().with_query("mine"))
            .unwrap();

        let other = FilterStateStore::new(
            UserContext::new(UserId::new("u2"), created()),
            Arc::clone(&persistence),
            Arc::new(GenerationClock::new()),
            EngineConfig::default(),
        );
        assert_eq!(other.get(Partition::Active).criteria.query, "");
    }

    #[test]
    fn test_undecodable_record_reads_as_defaults() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        persistence.insert_raw(
            &UserScopedKey::new(UserId::new("u1"), Partition::Active),
            "not json",
        );
        let store = store(persistence);
        assert_eq!(
            store.get(Partition::Active).criteria,
            FilterCriteria::defaults(created())
        );
    }

    #[test]
    fn test_default_window_stays_open_through_persistence() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        store(Arc::clone(&persistence))
            .set(Partition::Active, &FilterPatch::new().with_query("neon"))
            .unwrap();

        let restored = store(persistence).get(Partition::Active);
        assert_eq!(restored.criteria.query, "neon");
        assert!(restored.criteria.date_range.is_open());
        assert_eq!(restored.criteria.date_range.start, created());
    }

    #[test]
    fn test_page_size_selection() {
        let persistence = Arc::new(InMemoryFilterPersistence::new());
        let store = store(Arc::clone(&persistence));

        assert!(store.set_page_size(Partition::Trashed, 7).is_err());
        assert!(store.set_page_size(Partition::Active, 50).is_err());

        let keyed = store.set_page_size(Partition::Trashed, 50).unwrap();
        assert_eq!(keyed.page_size, 50);
        assert_eq!(keyed.generation, Generation::new(0));

        let reloaded = self::store(persistence);
        assert_eq!(reloaded.get(Partition::Trashed).page_size, 50);
    }
}
