//! Placement ledger: known item moves not yet reflected in cached data.
//!
//! When an archive, restore or delete is confirmed (or announced by the push
//! channel) the cached pages fetched before it still show the item in its
//! old partition until the refetch lands. The ledger records where each moved
//! item went and at which watermark, and cache reads mask out items whose
//! recorded placement is newer than the data and points elsewhere.

use std::collections::{BTreeSet, HashMap};

use mosaic_core::{ItemId, Partition, Placement};

use super::generation::Watermark;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlacementRecord {
    placement: Placement,
    at: Watermark,
}

/// Bounded record of `item id -> (placement, watermark)`.
#[derive(Debug)]
pub struct PlacementLedger {
    records: HashMap<ItemId, PlacementRecord>,
    /// Records ordered by age, for pruning and the size bound.
    order: BTreeSet<(Watermark, ItemId)>,
    /// Per-partition "everything removed" marks from bulk deletes.
    purges: [Option<Watermark>; 2],
    max_records: usize,
}

impl PlacementLedger {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: HashMap::new(),
            order: BTreeSet::new(),
            purges: [None, None],
            max_records: max_records.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.purges.iter().all(Option::is_none)
    }

    /// Record that `id` moved to `placement` at `at`. Older records for the
    /// same item never overwrite newer ones.
    pub fn record(&mut self, id: ItemId, placement: Placement, at: Watermark) {
        if let Some(existing) = self.records.get(&id) {
            if existing.at >= at {
                return;
            }
            self.order.remove(&(existing.at, id.clone()));
        }
        self.order.insert((at, id.clone()));
        self.records.insert(id, PlacementRecord { placement, at });

        while self.records.len() > self.max_records {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.records.remove(&oldest);
        }
    }

    /// Record that every item of `partition` was removed at `at`.
    pub fn record_purge(&mut self, partition: Partition, at: Watermark) {
        let slot = &mut self.purges[partition.index()];
        if slot.map_or(true, |existing| existing < at) {
            *slot = Some(at);
        }
    }

    /// Whether an item seen in `partition` data fetched from `fetched_from`
    /// may still be shown there.
    pub fn admits(&self, id: &ItemId, partition: Partition, fetched_from: Watermark) -> bool {
        if self.purges[partition.index()].is_some_and(|at| at.is_newer_than(fetched_from)) {
            return false;
        }
        match self.records.get(id) {
            Some(record) if record.at.is_newer_than(fetched_from) => {
                record.placement.admits(partition)
            }
            _ => true,
        }
    }

    /// Where the ledger last saw `id` move, if anywhere.
    pub fn placement_of(&self, id: &ItemId) -> Option<Placement> {
        self.records.get(id).map(|r| r.placement)
    }

    /// Drop everything at or before `oldest_live`: no cached or in-flight
    /// data predates it, so those records can no longer mask anything.
    pub fn prune(&mut self, oldest_live: Option<Watermark>) {
        let Some(oldest_live) = oldest_live else {
            self.records.clear();
            self.order.clear();
            self.purges = [None, None];
            return;
        };

        while let Some((at, _)) = self.order.first() {
            if at.is_newer_than(oldest_live) {
                break;
            }
            if let Some((_, id)) = self.order.pop_first() {
                self.records.remove(&id);
            }
        }
        for slot in &mut self.purges {
            if slot.is_some_and(|at| !at.is_newer_than(oldest_live)) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(n: u64) -> Watermark {
        Watermark::new(n)
    }

    #[test]
    fn test_masks_only_data_older_than_the_move() {
        let mut ledger = PlacementLedger::new(16);
        let x = ItemId::new("x");
        ledger.record(x.clone(), Placement::In(Partition::Trashed), w(5));

        assert!(!ledger.admits(&x, Partition::Active, w(3)));
        assert!(ledger.admits(&x, Partition::Trashed, w(3)));
        // Data fetched after the move is authoritative.
        assert!(ledger.admits(&x, Partition::Active, w(6)));
        assert!(ledger.admits(&ItemId::new("y"), Partition::Active, w(3)));
    }

    #[test]
    fn test_newer_record_wins() {
        let mut ledger = PlacementLedger::new(16);
        let x = ItemId::new("x");
        ledger.record(x.clone(), Placement::In(Partition::Active), w(7));
        ledger.record(x.clone(), Placement::In(Partition::Trashed), w(4));
        assert_eq!(ledger.placement_of(&x), Some(Placement::In(Partition::Active)));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_gone_is_admitted_nowhere() {
        let mut ledger = PlacementLedger::new(16);
        let x = ItemId::new("x");
        ledger.record(x.clone(), Placement::Gone, w(2));
        for partition in Partition::ALL {
            assert!(!ledger.admits(&x, partition, w(1)));
        }
    }

    #[test]
    fn test_purge_masks_whole_partition() {
        let mut ledger = PlacementLedger::new(16);
        ledger.record_purge(Partition::Trashed, w(10));
        assert!(!ledger.admits(&ItemId::new("a"), Partition::Trashed, w(9)));
        assert!(ledger.admits(&ItemId::new("a"), Partition::Active, w(9)));
        assert!(ledger.admits(&ItemId::new("a"), Partition::Trashed, w(11)));
    }

    #[test]
    fn test_bound_evicts_oldest() {
        let mut ledger = PlacementLedger::new(2);
        ledger.record(ItemId::new("a"), Placement::Gone, w(1));
        ledger.record(ItemId::new("b"), Placement::Gone, w(2));
        ledger.record(ItemId::new("c"), Placement::Gone, w(3));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.placement_of(&ItemId::new("a")), None);
    }

    #[test]
    fn test_prune() {
        let mut ledger = PlacementLedger::new(16);
        ledger.record(ItemId::new("a"), Placement::Gone, w(1));
        ledger.record(ItemId::new("b"), Placement::Gone, w(5));
        ledger.record_purge(Partition::Trashed, w(2));

        ledger.prune(Some(w(3)));
        assert_eq!(ledger.len(), 1);
        assert!(ledger.admits(&ItemId::new("z"), Partition::Trashed, w(1)));

        ledger.prune(None);
        assert!(ledger.is_empty());
    }
}
