//! User-scoped composite cache keys.
//!
//! A [`CacheKey`] is `(user, partition, serialized criteria)`. Like the
//! persisted filter key, it can only be built by naming the user, so two
//! accounts never resolve to the same entry.

use mosaic_core::{FilterCriteria, Partition, UserId};
use std::fmt;
use std::sync::Arc;

/// Composite key of one cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    inner: CacheKeyInner,
}

/// Private inner struct - prevents external construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKeyInner {
    user_id: UserId,
    partition: Partition,
    filters: Arc<str>,
}

impl CacheKey {
    pub fn new(user_id: UserId, partition: Partition, criteria: &FilterCriteria) -> Self {
        Self {
            inner: CacheKeyInner {
                user_id,
                partition,
                filters: Arc::from(criteria.cache_fragment()),
            },
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user_id
    }

    pub fn partition(&self) -> Partition {
        self.inner.partition
    }

    /// Canonical serialized criteria this key was built from.
    pub fn filters(&self) -> &str {
        &self.inner.filters
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.inner.user_id, self.inner.partition, self.inner.filters
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use mosaic_core::{DateRange, FilterPatch, StatusFilter};

    fn criteria() -> FilterCriteria {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        FilterCriteria::defaults(start)
            .apply(&FilterPatch::new().with_date_range(DateRange::new(start, end)))
    }

    #[test]
    fn test_equal_criteria_share_a_key() {
        let a = CacheKey::new(UserId::new("u1"), Partition::Active, &criteria());
        let b = CacheKey::new(
            UserId::new("u1"),
            Partition::Active,
            &criteria().apply(&FilterPatch::new().with_query("  ")),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_key_components_separate_entries() {
        let base = CacheKey::new(UserId::new("u1"), Partition::Active, &criteria());
        let other_user = CacheKey::new(UserId::new("u2"), Partition::Active, &criteria());
        let other_partition = CacheKey::new(UserId::new("u1"), Partition::Trashed, &criteria());
        let other_filters = CacheKey::new(
            UserId::new("u1"),
            Partition::Active,
            &criteria().apply(&FilterPatch::new().with_status(StatusFilter::Complete)),
        );

        assert_ne!(base, other_user);
        assert_ne!(base, other_partition);
        assert_ne!(base, other_filters);
        assert_eq!(base.partition(), Partition::Active);
        assert!(base.to_string().starts_with("u1/active/"));
    }
}
