//! Engine configuration.

use crate::error::ConfigError;
use std::time::Duration;

/// Tuning knobs shared by the cache, the invalidator and the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Upper bound for any single source call before it fails as a network error.
    pub fetch_timeout: Duration,
    /// Quiet period that collapses bursts of push events into one refetch.
    pub debounce: Duration,
    /// Longest a burst may keep postponing its flush.
    pub max_debounce: Duration,
    /// Page size of the infinitely scrolling active partition.
    pub active_page_size: u32,
    /// Page sizes offered by the trashed partition's selector.
    pub trashed_page_sizes: Vec<u32>,
    /// Page size used for the trashed partition until the user picks one.
    pub default_trashed_page_size: u32,
    /// Age after which a cache entry reads as stale, if set.
    pub entry_ttl: Option<Duration>,
    /// Run one coarse invalidation after the push channel reconnects.
    pub invalidate_on_reconnect: bool,
    /// Bound on remembered item placements (archive/restore/delete).
    pub max_placements: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(20),
            debounce: Duration::from_millis(300),
            max_debounce: Duration::from_secs(2),
            active_page_size: 15,
            trashed_page_sizes: vec![10, 25, 50, 100],
            default_trashed_page_size: 10,
            entry_ttl: None,
            invalidate_on_reconnect: false,
            max_placements: 1_024,
        }
    }
}

impl EngineConfig {
    /// Create a new engine config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_max_debounce(mut self, max: Duration) -> Self {
        self.max_debounce = max;
        self
    }

    pub fn with_active_page_size(mut self, size: u32) -> Self {
        self.active_page_size = size;
        self
    }

    pub fn with_trashed_page_sizes(mut self, sizes: Vec<u32>, default: u32) -> Self {
        self.trashed_page_sizes = sizes;
        self.default_trashed_page_size = default;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = Some(ttl);
        self
    }

    pub fn with_invalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.invalidate_on_reconnect = enabled;
        self
    }

    pub fn with_max_placements(mut self, max: usize) -> Self {
        self.max_placements = max;
        self
    }

    pub fn is_allowed_trashed_page_size(&self, size: u32) -> bool {
        self.trashed_page_sizes.contains(&size)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout.is_zero() {
            return Err(invalid("fetch_timeout", "must be > 0"));
        }
        if self.max_debounce < self.debounce {
            return Err(invalid("max_debounce", "must be >= debounce"));
        }
        if self.active_page_size == 0 {
            return Err(invalid("active_page_size", "must be > 0"));
        }
        if self.trashed_page_sizes.is_empty() || self.trashed_page_sizes.contains(&0) {
            return Err(invalid(
                "trashed_page_sizes",
                "must be non-empty and contain only sizes > 0",
            ));
        }
        if !self.is_allowed_trashed_page_size(self.default_trashed_page_size) {
            return Err(invalid(
                "default_trashed_page_size",
                "must be one of trashed_page_sizes",
            ));
        }
        if self.entry_ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(invalid("entry_ttl", "must be > 0 when set"));
        }
        if self.max_placements == 0 {
            return Err(invalid("max_placements", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
