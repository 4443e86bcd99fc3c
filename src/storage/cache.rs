use std::collections::HashMap;

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::storage::base::Address;
use crate::storage::index::page::{Dirty, Page, PageInfo};
use crate::storage::index::{load_info, load_page, store_info, store_page};
use crate::storage::{CacheStats, StorageSystem};

/// Clock value at which recencies are compacted back to `1..=K`
const RECENCY_LIMIT: u64 = u64::MAX / 2;

#[derive(Debug, Default)]
struct Slot {
    page: Option<Page>,
    dirty: Dirty,
    pending_changes: u32,
    /// 0 while empty, so empty slots are always picked first
    recency: u64,
}

/// Fixed pool of materialized pages with least-recently-used eviction.
///
/// Slots are ordered by an indexed binary min-heap on recency: `heap` holds
/// slot numbers, `heap_pos` maps a slot back to its heap position.
#[derive(Debug)]
pub struct PageCache {
    slots: Vec<Slot>,
    index: HashMap<Address, usize>,
    heap: Vec<usize>,
    heap_pos: Vec<usize>,
    clock: u64,
    recency_limit: u64,
    write_back_threshold: Option<u32>,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(capacity: usize, write_back_threshold: Option<u32>) -> Self {
        let capacity = capacity.max(1);
        PageCache {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            index: HashMap::with_capacity(capacity),
            heap: (0..capacity).collect(),
            heap_pos: (0..capacity).collect(),
            clock: 0,
            recency_limit: RECENCY_LIMIT,
            write_back_threshold,
            stats: CacheStats::default(),
        }
    }

    #[cfg(test)]
    fn with_recency_limit(mut self, limit: u64) -> Self {
        self.recency_limit = limit;
        self
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_resident(&self, address: Address) -> bool {
        self.index.contains_key(&address)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Resident page at `address`, loading it on a miss
    pub fn read(&mut self, sys: &StorageSystem, address: Address) -> Result<&Page> {
        let slot = self.ensure_resident(sys, address)?;
        self.slots[slot]
            .page
            .as_ref()
            .ok_or_else(|| Error::State(format!("cache slot for {} is empty", address)))
    }

    /// Run `f` on the resident page at `address` and record the change.
    /// The page is written back once it collects `write_back_threshold`
    /// changes. The result is always `f`'s: a failed write-back keeps the
    /// page dirty for the next flush or eviction.
    pub fn modify<R>(
        &mut self,
        sys: &StorageSystem,
        address: Address,
        dirty: Dirty,
        f: impl FnOnce(&mut Page) -> Result<R>,
    ) -> Result<R> {
        let slot = self.ensure_resident(sys, address)?;
        let entry = &mut self.slots[slot];
        let page = entry
            .page
            .as_mut()
            .ok_or_else(|| Error::State(format!("cache slot for {} is empty", address)))?;

        let result = f(page);
        entry.dirty.merge(dirty);
        entry.pending_changes = entry.pending_changes.saturating_add(1);

        if let Some(threshold) = self.write_back_threshold {
            if self.slots[slot].pending_changes >= threshold {
                if let Err(err) = self.write_back(sys, slot) {
                    warn!(%address, error = %err, "write-back failed, page stays dirty");
                }
            }
        }
        result
    }

    /// Change a page's info. Pages that are not resident are updated on
    /// disk directly instead of being loaded.
    pub fn modify_info(&mut self, sys: &StorageSystem, address: Address, f: impl FnOnce(&mut PageInfo)) -> Result<()> {
        if let Some(&slot) = self.index.get(&address) {
            let entry = &mut self.slots[slot];
            if let Some(page) = entry.page.as_mut() {
                f(&mut page.info);
                entry.dirty.merge(Dirty::INFO);
                entry.pending_changes = entry.pending_changes.saturating_add(1);
                return Ok(());
            }
        }

        let mut info = load_info(sys, address)?;
        f(&mut info);
        store_info(sys, &info)
    }

    /// Current info of a page without making it resident
    pub fn peek_info(&self, sys: &StorageSystem, address: Address) -> Result<PageInfo> {
        if let Some(page) = self.index.get(&address).and_then(|&slot| self.slots[slot].page.as_ref()) {
            return Ok(page.info);
        }
        load_info(sys, address)
    }

    /// Write back every page with pending changes
    pub fn flush(&mut self, sys: &StorageSystem) -> Result<()> {
        for slot in 0..self.slots.len() {
            self.write_back(sys, slot)?;
        }
        Ok(())
    }

    /// Forget a page without writing it back
    pub fn purge(&mut self, address: Address) {
        if let Some(slot) = self.index.remove(&address) {
            let entry = &mut self.slots[slot];
            entry.page = None;
            entry.dirty = Dirty::CLEAN;
            entry.pending_changes = 0;
            entry.recency = 0;
            self.sift_up(self.heap_pos[slot]);
            trace!(%address, "purged page");
        }
    }

    fn write_back(&mut self, sys: &StorageSystem, slot: usize) -> Result<()> {
        let entry = &mut self.slots[slot];
        let Some(page) = entry.page.as_ref() else {
            return Ok(());
        };
        if entry.pending_changes == 0 && !entry.dirty.any() {
            return Ok(());
        }

        store_page(sys, page, entry.dirty)?;
        trace!(address = %page.address(), changes = entry.pending_changes, "wrote back page");
        entry.dirty = Dirty::CLEAN;
        entry.pending_changes = 0;
        self.stats.write_backs += 1;
        Ok(())
    }

    fn ensure_resident(&mut self, sys: &StorageSystem, address: Address) -> Result<usize> {
        if let Some(&slot) = self.index.get(&address) {
            self.stats.hits += 1;
            self.touch(slot);
            return Ok(slot);
        }

        let page = load_page(sys, address)?;
        let slot = self.heap[0];
        if let Some(victim) = self.slots[slot].page.as_ref().map(|page| page.address()) {
            // a failed write-back leaves the victim resident and dirty
            self.write_back(sys, slot)?;
            self.index.remove(&victim);
            self.stats.evictions += 1;
            debug!(address = %victim, "evicted page");
        }

        self.stats.misses += 1;
        let entry = &mut self.slots[slot];
        entry.page = Some(page);
        entry.dirty = Dirty::CLEAN;
        entry.pending_changes = 0;
        self.index.insert(address, slot);
        self.touch(slot);
        trace!(%address, slot, "loaded page");
        Ok(slot)
    }

    fn touch(&mut self, slot: usize) {
        if self.clock >= self.recency_limit {
            self.renormalize();
        }
        self.clock += 1;
        self.slots[slot].recency = self.clock;
        self.sift_down(self.heap_pos[slot]);
    }

    /// Replace recencies by their rank, keeping empty slots at 0
    fn renormalize(&mut self) {
        let mut order: Vec<usize> = (0..self.slots.len()).filter(|&s| self.slots[s].recency > 0).collect();
        order.sort_by_key(|&s| self.slots[s].recency);
        for (rank, &slot) in order.iter().enumerate() {
            self.slots[slot].recency = rank as u64 + 1;
        }
        self.clock = order.len() as u64;

        for i in (0..self.heap.len() / 2).rev() {
            self.sift_down(i);
        }
        debug!(clock = self.clock, "renormalized cache recency");
    }

    fn key(&self, pos: usize) -> u64 {
        self.slots[self.heap[pos]].recency
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.heap_pos[self.heap[a]] = a;
        self.heap_pos[self.heap[b]] = b;
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.key(pos) >= self.key(parent) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.key(left) < self.key(smallest) {
                smallest = left;
            }
            if right < len && self.key(right) < self.key(smallest) {
                smallest = right;
            }
            if smallest == pos {
                break;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}
