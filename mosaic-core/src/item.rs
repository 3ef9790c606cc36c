//! Items, identities and partitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of a generated item, as issued by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of the signed-in account. Every persisted filter and every
/// cache key is namespaced by it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a generated item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in-progress",
            ItemStatus::Complete => "complete",
            ItemStatus::Failed => "failed",
        }
    }

    /// Whether the generation backend may still change this item's status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Complete | ItemStatus::Failed)
    }
}

/// A generated content item as returned by the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub status: ItemStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub archive_date: Option<Timestamp>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Item {
    /// The partition this item currently belongs to.
    pub fn partition(&self) -> Partition {
        if self.archived {
            Partition::Trashed
        } else {
            Partition::Active
        }
    }
}

/// Mutually exclusive subset of items with its own filters and cache namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Active,
    Trashed,
}

impl Partition {
    pub const ALL: [Partition; 2] = [Partition::Active, Partition::Trashed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Active => "active",
            Partition::Trashed => "trashed",
        }
    }

    /// Value of the `isArchived` list parameter for this partition.
    pub fn is_archived(&self) -> bool {
        matches!(self, Partition::Trashed)
    }

    /// The partition an archive or restore moves items into.
    pub fn other(&self) -> Partition {
        match self {
            Partition::Active => Partition::Trashed,
            Partition::Trashed => Partition::Active,
        }
    }

    pub fn strategy(&self) -> PageStrategy {
        match self {
            Partition::Active => PageStrategy::Accumulate,
            Partition::Trashed => PageStrategy::Replace,
        }
    }

    /// Stable slot index, used by per-partition tables.
    pub fn index(&self) -> usize {
        match self {
            Partition::Active => 0,
            Partition::Trashed => 1,
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How successive page responses combine in a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStrategy {
    /// Infinite scrolling: pages append to the accumulated list.
    Accumulate,
    /// Offset pagination: a page response replaces the displayed page.
    Replace,
}
