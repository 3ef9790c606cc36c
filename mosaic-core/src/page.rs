//! Page requests and the list endpoint's wire shapes.

use crate::filter::FilterCriteria;
use crate::item::{Item, Partition, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// A 1-based page number plus page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn new(page: u32, limit: u32) -> Self {
        Self {
            page: page.max(1),
            limit: limit.max(1),
        }
    }

    pub fn first(limit: u32) -> Self {
        Self::new(1, limit)
    }

    pub fn next(&self) -> Self {
        Self::new(self.page + 1, self.limit)
    }

    /// Zero-based offset of the first item on this page.
    pub fn offset(&self) -> usize {
        (self.page.saturating_sub(1) as usize) * self.limit as usize
    }
}

/// Query parameters of the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: u32,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub sort: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub is_archived: bool,
}

impl ListQuery {
    /// Build the query for a page, resolving an open date range against the
    /// current time.
    pub fn build(partition: Partition, criteria: &FilterCriteria, request: PageRequest) -> Self {
        Self::build_at(partition, criteria, request, Utc::now())
    }

    pub fn build_at(
        partition: Partition,
        criteria: &FilterCriteria,
        request: PageRequest,
        now: Timestamp,
    ) -> Self {
        Self {
            page: request.page,
            limit: request.limit,
            q: criteria.query().map(str::to_string),
            status: criteria.status.as_query().map(str::to_string),
            sort: criteria.sort.to_query(),
            start: criteria.date_range.start,
            end: criteria.date_range.end_at(now),
            is_archived: partition.is_archived(),
        }
    }

    pub fn partition(&self) -> Partition {
        if self.is_archived {
            Partition::Trashed
        } else {
            Partition::Active
        }
    }

    pub fn request(&self) -> PageRequest {
        PageRequest::new(self.page, self.limit)
    }
}

/// Response body of the list endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub data: Vec<Item>,
    pub page: u32,
    pub total_pages: u32,
    pub has_more: bool,
    pub total_items: u64,
}

/// One page of items as stored by the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Item>,
    pub page_number: u32,
    pub has_more: bool,
    pub total_items: u64,
    pub total_pages: u32,
}

impl From<ListResponse> for Page {
    fn from(response: ListResponse) -> Self {
        Self {
            items: response.data,
            page_number: response.page,
            has_more: response.has_more,
            total_items: response.total_items,
            total_pages: response.total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{DateRange, FilterPatch, StatusFilter};
    use chrono::TimeZone;

    #[test]
    fn test_list_query_serializes_endpoint_params() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let criteria = FilterCriteria::defaults(start).apply(
            &FilterPatch::new()
                .with_date_range(DateRange::new(start, end))
                .with_status(StatusFilter::Failed)
                .with_query("robot"),
        );
        let query = ListQuery::build(Partition::Trashed, &criteria, PageRequest::new(2, 25));
        let value = serde_json::to_value(&query).unwrap();

        assert_eq!(value["page"], 2);
        assert_eq!(value["limit"], 25);
        assert_eq!(value["q"], "robot");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["sort"], "-updatedAt");
        assert_eq!(value["isArchived"], true);
        assert_eq!(query.end, end);
        assert_eq!(query.partition(), Partition::Trashed);
    }

    #[test]
    fn test_open_date_range_ends_at_build_time() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let criteria = FilterCriteria::defaults(start);
        let first = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();

        let a = ListQuery::build_at(Partition::Active, &criteria, PageRequest::first(15), first);
        let b = ListQuery::build_at(Partition::Active, &criteria, PageRequest::first(15), later);
        assert_eq!(a.start, start);
        assert_eq!(a.end, first);
        assert_eq!(b.end, later);
    }

    #[test]
    fn test_blank_query_and_all_status_are_omitted() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let criteria = FilterCriteria::defaults(at);
        let query = ListQuery::build(Partition::Active, &criteria, PageRequest::first(15));
        let value = serde_json::to_value(&query).unwrap();
        assert!(value.get("q").is_none());
        assert!(value.get("status").is_none());
        assert_eq!(value["isArchived"], false);
    }

    #[test]
    fn test_page_request_offset() {
        assert_eq!(PageRequest::new(1, 15).offset(), 0);
        assert_eq!(PageRequest::new(3, 15).offset(), 30);
        assert_eq!(PageRequest::new(0, 0), PageRequest::new(1, 1));
        assert_eq!(PageRequest::first(10).next().page, 2);
    }
}
