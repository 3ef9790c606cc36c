//! Cache entries and their page-strategy specific contents.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mosaic_core::{Item, ItemId, Page, PageRequest, PageStrategy, Partition};
use tokio::time::Instant;

use super::freshness::Freshness;
use super::generation::Watermark;
use super::ledger::PlacementLedger;

/// Read projection of a cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PageView {
    pub items: Vec<Item>,
    /// Last loaded page for accumulated entries, the displayed page otherwise.
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
    pub total_items: u64,
    pub total_pages: u32,
}

impl PageView {
    pub fn empty(page_size: u32) -> Self {
        Self {
            items: Vec::new(),
            page: 0,
            page_size,
            has_more: false,
            total_items: 0,
            total_pages: 0,
        }
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.iter().any(|item| &item.id == id)
    }
}

/// Outcome of offering a fetched page to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Applied {
    Stored,
    /// Already reflected in the entry; nothing changed.
    Redundant,
    /// Out of order or no longer the requested page.
    Rejected,
}

#[derive(Debug, Clone)]
struct Accumulated {
    items: Vec<Item>,
    seen: HashSet<ItemId>,
    loaded_pages: u32,
    page_size: u32,
    has_more: bool,
    total_items: u64,
    total_pages: u32,
}

impl Accumulated {
    fn from_first(page: Page, page_size: u32) -> Self {
        let mut acc = Self {
            items: Vec::with_capacity(page.items.len()),
            seen: HashSet::new(),
            loaded_pages: 0,
            page_size,
            has_more: page.has_more,
            total_items: page.total_items,
            total_pages: page.total_pages,
        };
        acc.append(page);
        acc
    }

    /// Append in server order, skipping ids already present. `total_items`
    /// stays as reported by the first page.
    fn append(&mut self, page: Page) {
        for item in page.items {
            if self.seen.insert(item.id.clone()) {
                self.items.push(item);
            }
        }
        self.loaded_pages += 1;
        self.has_more = page.has_more;
        self.total_pages = page.total_pages;
    }
}

#[derive(Debug, Clone)]
enum EntryData {
    Empty,
    Accumulated(Accumulated),
    Paged { page: Page, request: PageRequest },
}

/// One cached key.
#[derive(Debug)]
pub(crate) struct CacheEntry {
    partition: Partition,
    data: EntryData,
    fetched_at: Option<DateTime<Utc>>,
    fetched_instant: Option<Instant>,
    /// Start watermark of the oldest fetch still reflected in `data`.
    fetched_from: Option<Watermark>,
    invalidated_at: Option<Watermark>,
    /// Latest page requested for replace-strategy entries.
    intent: Option<PageRequest>,
    pub(crate) leases: usize,
}

impl CacheEntry {
    pub(crate) fn new(partition: Partition) -> Self {
        Self {
            partition,
            data: EntryData::Empty,
            fetched_at: None,
            fetched_instant: None,
            fetched_from: None,
            invalidated_at: None,
            intent: None,
            leases: 0,
        }
    }

    pub(crate) fn has_data(&self) -> bool {
        !matches!(self.data, EntryData::Empty)
    }

    pub(crate) fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub(crate) fn fetched_from(&self) -> Option<Watermark> {
        self.fetched_from
    }

    pub(crate) fn invalidated_at(&self) -> Option<Watermark> {
        self.invalidated_at
    }

    pub(crate) fn freshness(&self, ttl: Option<Duration>) -> Freshness {
        let Some(fetched_from) = self.fetched_from.filter(|_| self.has_data()) else {
            return Freshness::Absent;
        };
        if self
            .invalidated_at
            .is_some_and(|at| at.is_newer_than(fetched_from))
        {
            return Freshness::Stale;
        }
        let expired = match (ttl, self.fetched_instant) {
            (Some(ttl), Some(at)) => at.elapsed() >= ttl,
            _ => false,
        };
        if expired {
            Freshness::Stale
        } else {
            Freshness::Fresh
        }
    }

    /// Mark stale as of `at`. Returns false if an equal or newer mark exists.
    pub(crate) fn invalidate(&mut self, at: Watermark) -> bool {
        if self.invalidated_at.is_some_and(|existing| existing >= at) {
            return false;
        }
        self.invalidated_at = Some(at);
        true
    }

    pub(crate) fn set_intent(&mut self, request: PageRequest) {
        self.intent = Some(request);
    }

    pub(crate) fn intent(&self) -> Option<PageRequest> {
        self.intent
    }

    /// The page requests a full revalidation has to refetch.
    pub(crate) fn revalidation_plan(&self, default_page_size: u32) -> Vec<PageRequest> {
        match &self.data {
            EntryData::Accumulated(acc) => (1..=acc.loaded_pages.max(1))
                .map(|page| PageRequest::new(page, acc.page_size))
                .collect(),
            EntryData::Paged { request, .. } => vec![self.intent.unwrap_or(*request)],
            EntryData::Empty => vec![self
                .intent
                .unwrap_or_else(|| PageRequest::first(default_page_size))],
        }
    }

    /// The next page an accumulated entry would load, if any.
    pub(crate) fn next_page(&self) -> Option<PageRequest> {
        match &self.data {
            EntryData::Accumulated(acc) if acc.has_more => {
                Some(PageRequest::new(acc.loaded_pages + 1, acc.page_size))
            }
            EntryData::Accumulated(_) => None,
            EntryData::Paged { request, page } if page.has_more => Some(request.next()),
            EntryData::Paged { .. } => None,
            EntryData::Empty => None,
        }
    }

    /// Whether this entry can answer `request` without a fetch.
    pub(crate) fn covers(&self, request: PageRequest) -> bool {
        match &self.data {
            EntryData::Accumulated(acc) => acc.page_size == request.limit,
            EntryData::Paged { request: shown, .. } => *shown == request,
            EntryData::Empty => false,
        }
    }

    /// Offer one fetched page started at `started`.
    pub(crate) fn apply_page(
        &mut self,
        strategy: PageStrategy,
        request: PageRequest,
        page: Page,
        started: Watermark,
    ) -> Applied {
        match strategy {
            PageStrategy::Accumulate => {
                if request.page == 1 {
                    self.data = EntryData::Accumulated(Accumulated::from_first(page, request.limit));
                    self.stamp(started, true);
                    return Applied::Stored;
                }
                let EntryData::Accumulated(acc) = &mut self.data else {
                    return Applied::Rejected;
                };
                if acc.page_size != request.limit {
                    return Applied::Rejected;
                }
                if request.page <= acc.loaded_pages {
                    return Applied::Redundant;
                }
                if request.page != acc.loaded_pages + 1 {
                    return Applied::Rejected;
                }
                acc.append(page);
                self.stamp(started, false);
                Applied::Stored
            }
            PageStrategy::Replace => {
                if self.intent.is_some_and(|intent| intent != request) {
                    return Applied::Rejected;
                }
                self.data = EntryData::Paged { page, request };
                self.stamp(started, true);
                Applied::Stored
            }
        }
    }

    /// Swap in a complete refetch. `pages` are in request order.
    pub(crate) fn replace_all(
        &mut self,
        strategy: PageStrategy,
        pages: Vec<(PageRequest, Page)>,
        started: Watermark,
    ) -> Applied {
        let mut pages = pages.into_iter();
        let Some((first_request, first)) = pages.next() else {
            return Applied::Rejected;
        };
        match strategy {
            PageStrategy::Accumulate => {
                let mut acc = Accumulated::from_first(first, first_request.limit);
                for (_, page) in pages {
                    acc.append(page);
                }
                self.data = EntryData::Accumulated(acc);
            }
            PageStrategy::Replace => {
                if self.intent.is_some_and(|intent| intent != first_request) {
                    return Applied::Rejected;
                }
                self.data = EntryData::Paged {
                    page: first,
                    request: first_request,
                };
            }
        }
        self.stamp(started, true);
        Applied::Stored
    }

    fn stamp(&mut self, started: Watermark, replaced: bool) {
        self.fetched_from = match self.fetched_from {
            Some(existing) if !replaced => Some(existing.min(started)),
            _ => Some(started),
        };
        if replaced || self.fetched_at.is_none() {
            self.fetched_at = Some(Utc::now());
            self.fetched_instant = Some(Instant::now());
        }
    }

    /// Project the entry, masking items the ledger knows have moved away.
    pub(crate) fn view(&self, ledger: &PlacementLedger, default_page_size: u32) -> PageView {
        let fetched_from = self.fetched_from.unwrap_or_default();
        let visible = |items: &[Item]| -> Vec<Item> {
            items
                .iter()
                .filter(|item| ledger.admits(&item.id, self.partition, fetched_from))
                .cloned()
                .collect()
        };
        match &self.data {
            EntryData::Empty => PageView::empty(
                self.intent.map(|r| r.limit).unwrap_or(default_page_size),
            ),
            EntryData::Accumulated(acc) => PageView {
                items: visible(&acc.items),
                page: acc.loaded_pages,
                page_size: acc.page_size,
                has_more: acc.has_more,
                total_items: acc.total_items,
                total_pages: acc.total_pages,
            },
            EntryData::Paged { page, request } => PageView {
                items: visible(&page.items),
                page: request.page,
                page_size: request.limit,
                has_more: page.has_more,
                total_items: page.total_items,
                total_pages: page.total_pages,
            },
        }
    }
}
