//! Filter, sort and date-range criteria for list views.
//!
//! A [`FilterCriteria`] is owned per partition, persisted per user, and
//! serialized to a canonical string that forms part of every cache key.

use crate::error::ValidationError;
use crate::item::{ItemStatus, Timestamp};
use serde::{Deserialize, Serialize};

/// Inclusive creation-date window.
///
/// An open `end` means "until now" and is resolved only when a list query is
/// built, so items created later still fall inside the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Timestamp>,
}

impl DateRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self {
            start,
            end: Some(end),
        }
    }

    /// Window from `start` up to whatever "now" is at query time.
    pub fn since(start: Timestamp) -> Self {
        Self { start, end: None }
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Concrete end of the window when evaluated at `now`.
    pub fn end_at(&self, now: Timestamp) -> Timestamp {
        self.end.unwrap_or(now)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.end {
            Some(end) if end < self.start => Err(ValidationError::InvalidDateRange {
                start: self.start,
                end,
            }),
            _ => Ok(()),
        }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        at >= self.start && self.end.map_or(true, |end| at <= end)
    }
}

/// Status facet of the list view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    #[default]
    All,
    Complete,
    Pending,
    Failed,
}

impl StatusFilter {
    /// Value of the `status` list parameter; `None` means "no filter".
    pub fn as_query(&self) -> Option<&'static str> {
        match self {
            StatusFilter::All => None,
            StatusFilter::Complete => Some("complete"),
            StatusFilter::Pending => Some("pending"),
            StatusFilter::Failed => Some("failed"),
        }
    }

    pub fn matches(&self, status: ItemStatus) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Complete => status == ItemStatus::Complete,
            StatusFilter::Pending => {
                matches!(status, ItemStatus::Pending | ItemStatus::InProgress)
            }
            StatusFilter::Failed => status == ItemStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    UpdatedAt,
    CreatedAt,
    Title,
    Status,
}

impl SortField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortField::UpdatedAt => "updatedAt",
            SortField::CreatedAt => "createdAt",
            SortField::Title => "title",
            SortField::Status => "status",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Sort field plus direction. Defaults to `updatedAt desc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: SortField, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    /// Wire form of the `sort` parameter: `field` ascending, `-field` descending.
    pub fn to_query(&self) -> String {
        match self.direction {
            SortDirection::Asc => self.field.as_str().to_string(),
            SortDirection::Desc => format!("-{}", self.field.as_str()),
        }
    }
}

/// The full set of criteria a list view is filtered by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterCriteria {
    pub date_range: DateRange,
    pub query: String,
    pub status: StatusFilter,
    pub sort: SortSpec,
}

impl FilterCriteria {
    /// Default criteria for an account: everything since the account was
    /// created, no query, all statuses, newest updates first.
    pub fn defaults(account_created_at: Timestamp) -> Self {
        Self {
            date_range: DateRange::since(account_created_at),
            query: String::new(),
            status: StatusFilter::All,
            sort: SortSpec::default(),
        }
    }

    /// Merge a patch into a copy of these criteria.
    pub fn apply(&self, patch: &FilterPatch) -> Self {
        let mut next = self.clone();
        if let Some(range) = patch.date_range {
            next.date_range = range;
        }
        if let Some(query) = &patch.query {
            next.query = query.trim().to_string();
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(sort) = patch.sort {
            next.sort = sort;
        }
        next
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.date_range.validate()
    }

    /// Free-text query, `None` when blank.
    pub fn query(&self) -> Option<&str> {
        let trimmed = self.query.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Stable string form used as a cache key component.
    ///
    /// Field order is fixed by the struct declaration and the query is
    /// trimmed, so equal criteria always produce the same fragment.
    pub fn cache_fragment(&self) -> String {
        let canonical = CanonicalCriteria {
            start: self.date_range.start.timestamp_millis(),
            end: self.date_range.end.map(|end| end.timestamp_millis()),
            q: self.query.trim(),
            status: self.status,
            sort: self.sort.to_query(),
        };
        serde_json::to_string(&canonical).unwrap_or_else(|_| {
            format!(
                "{}|{:?}|{}|{:?}|{}",
                canonical.start, canonical.end, canonical.q, canonical.status, canonical.sort
            )
        })
    }
}

#[derive(Serialize)]
struct CanonicalCriteria<'a> {
    start: i64,
    end: Option<i64>,
    q: &'a str,
    status: StatusFilter,
    sort: String,
}

/// Partial update of [`FilterCriteria`]; `None` fields are kept as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<SortSpec>,
}

impl FilterPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_date_range(mut self, range: DateRange) -> Self {
        self.date_range = Some(range);
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_status(mut self, status: StatusFilter) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.date_range.is_none()
            && self.query.is_none()
            && self.status.is_none()
            && self.sort.is_none()
    }
}
