//! Error types for Mosaic operations

use crate::item::{ItemId, Timestamp};
use thiserror::Error;

/// Validation errors raised before any request leaves the process.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Date range end {end} is before start {start}")]
    InvalidDateRange { start: Timestamp, end: Timestamp },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Failures of a list fetch or a mutation, as seen at the cache boundary.
///
/// Every variant is cloneable so a single coalesced result can be handed to
/// all waiting callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ListingError {
    /// No response arrived: transport failure or the fetch timed out.
    #[error("Network error: {reason}")]
    Network { reason: String },

    #[error("Server responded with {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A mutation targeted an item that is no longer where the caller
    /// expected it (e.g. restoring something already deleted).
    #[error("Conflict on {}: {reason}", .id.as_ref().map(ItemId::as_str).unwrap_or("<bulk>"))]
    Conflict { id: Option<ItemId>, reason: String },

    /// The response belonged to a filter generation or page request that has
    /// since been replaced and was discarded.
    #[error("Result superseded by generation {generation}")]
    Superseded { generation: u64 },

    #[error("Storage error: {reason}")]
    Storage { reason: String },
}

impl ListingError {
    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    pub fn conflict(id: Option<ItemId>, reason: impl Into<String>) -> Self {
        Self::Conflict {
            id,
            reason: reason.into(),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ListingError::Network { .. } => true,
            ListingError::Server { status, .. } => *status >= 500,
            ListingError::Superseded { .. } => true,
            ListingError::Validation(_)
            | ListingError::Conflict { .. }
            | ListingError::Storage { .. } => false,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, ListingError::Superseded { .. })
    }
}

/// Durable filter storage errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open store at {path}: {reason}")]
    Open { path: String, reason: String },

    #[error("Read failed for {key}: {reason}")]
    ReadFailed { key: String, reason: String },

    #[error("Write failed for {key}: {reason}")]
    WriteFailed { key: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl From<StorageError> for ListingError {
    fn from(err: StorageError) -> Self {
        ListingError::Storage {
            reason: err.to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Master error type for all Mosaic errors.
#[derive(Debug, Clone, Error)]
pub enum MosaicError {
    #[error("Listing error: {0}")]
    Listing(#[from] ListingError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Mosaic operations.
pub type MosaicResult<T> = Result<T, MosaicError>;

// =============================================================================
// TESTS
// =============================================================================
