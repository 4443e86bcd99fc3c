use std::collections::HashSet;
use std::ops::Range;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::allocator::{AllocatorSettings, CompactionStrategy, FreeListAllocator, SpaceAllocator, TrimTail};
use crate::storage::base::{Address, ElementHandle, HEADER_SIZE, Header};
use crate::storage::cache::PageCache;
use crate::storage::index::page::{Dirty, PageInfo};
use crate::storage::index::{self, load_page};
use crate::storage::io::Disk;
use crate::storage::{CacheStats, StorageSystem};

/// Page the cursor sits on and the position of its first element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    page: Address,
    start: u64,
}

/// A file-backed array of byte blobs.
///
/// Element handles live in a doubly linked chain of index pages, payloads in
/// chunk chains. Lookups walk the page chain from a cursor that stays where
/// the last operation left it, so sequential access is cheap.
#[derive(Debug)]
pub struct LargeArray {
    sys: StorageSystem,
    cache: PageCache,
    header: Header,
    config: Config,
    cursor: Cursor,
    /// In-memory state is ahead of the free-space snapshot on disk
    dirty: bool,
    closed: bool,
}

/// Header counters and page chain of an array file as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Inspection {
    pub max_elements_per_page: u64,
    pub count: u64,
    pub total_used_bytes: u64,
    /// `None` when the file has no free-space snapshot, in which case the
    /// counters may be stale until the next open recounts them
    pub free_bytes: Option<u64>,
    pub pages: Vec<PageInfo>,
}

/// Any failure while reading an existing file means the file is not usable
fn damaged(err: Error) -> Error {
    match err {
        Error::Format(_) => err,
        other => Error::Format(format!("damaged array file: {}", other)),
    }
}

impl LargeArray {
    /// Open an existing array or create a new one with default settings
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, Config::default())
    }

    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        capacity_hint: u64,
        max_elements_per_page: u64,
        min_allocation_size: u64,
    ) -> Result<Self> {
        let config = Config::new()
            .with_capacity_hint(capacity_hint)
            .with_max_elements_per_page(max_elements_per_page)
            .with_min_allocation_size(min_allocation_size);
        Self::open_with_config(path, config)
    }

    /// Open the array at `path`. A file holding no more than a header is
    /// initialized from scratch; anything else must load cleanly.
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: Config) -> Result<Self> {
        config.validate()?;
        let disk = Disk::open(path.as_ref())?;
        let file_len = disk.len()?;

        if file_len <= HEADER_SIZE {
            Self::create(disk, config)
        } else {
            Self::load(disk, config, file_len)
        }
    }

    /// Read the file at `path` without opening it as an array. Nothing is
    /// recovered, initialized or written.
    pub fn inspect<P: AsRef<Path>>(path: P) -> Result<Inspection> {
        let disk = Disk::open_read_only(path.as_ref())?;
        let header = Header::read(&disk).map_err(damaged)?;
        header.validate()?;

        let config = Config::new().with_max_elements_per_page(header.max_elements_per_page);
        let settings = AllocatorSettings::from(&config);
        let free_bytes = if header.free_list_root.is_valid() {
            let allocator = FreeListAllocator::load_state(settings, &disk, header.free_list_root).map_err(damaged)?;
            Some(allocator.free_byte_count())
        } else {
            None
        };
        let file_len = disk.len()?;
        let sys = StorageSystem::new(disk, Box::new(FreeListAllocator::new(settings, file_len)));

        let mut pages = Vec::new();
        let mut visited = HashSet::new();
        let mut address = header.root_address;
        while address.is_valid() {
            if !visited.insert(address) {
                return Err(Error::address(address, "page chain loops"));
            }
            let info = index::load_info(&sys, address).map_err(damaged)?;
            address = info.next;
            pages.push(info);
        }

        Ok(Inspection {
            max_elements_per_page: header.max_elements_per_page,
            count: header.count,
            total_used_bytes: header.total_used_bytes,
            free_bytes,
            pages,
        })
    }

    fn create(disk: Disk, config: Config) -> Result<Self> {
        let allocator = FreeListAllocator::new(AllocatorSettings::from(&config), HEADER_SIZE);
        let mut sys = StorageSystem::new(disk, Box::new(allocator));

        let mut header = Header::new(config.max_elements_per_page);
        let root = index::create_page(
            &mut sys,
            header.max_elements_per_page,
            Address::INVALID,
            Address::INVALID,
            Vec::new(),
        )?;
        header.root_address = root.address();
        sys.write_header(&header)?;
        sys.sync()?;

        info!(
            path = %sys.disk().path().display(),
            max_elements_per_page = header.max_elements_per_page,
            "created array"
        );
        Ok(Self::assemble(sys, header, config, true))
    }

    fn load(disk: Disk, mut config: Config, file_len: u64) -> Result<Self> {
        let mut header = Header::read(&disk).map_err(damaged)?;
        header.validate()?;

        if header.max_elements_per_page != config.max_elements_per_page {
            warn!(
                stored = header.max_elements_per_page,
                configured = config.max_elements_per_page,
                "page size differs from configuration, using stored value"
            );
            config.max_elements_per_page = header.max_elements_per_page;
        }

        let settings = AllocatorSettings::from(&config);
        let recovered = !header.free_list_root.is_valid();
        let allocator = if recovered {
            FreeListAllocator::recover(settings, file_len)
        } else {
            FreeListAllocator::load_state(settings, &disk, header.free_list_root).map_err(damaged)?
        };
        let sys = StorageSystem::new(disk, Box::new(allocator));

        let root = index::load_info(&sys, header.root_address).map_err(damaged)?;
        if root.prev.is_valid() {
            return Err(Error::Format(format!(
                "root page {} has a predecessor {}",
                root.address, root.prev
            )));
        }
        if root.max_count != header.max_elements_per_page {
            return Err(Error::Format(format!(
                "root page {} has capacity {}, header records {}",
                root.address, root.max_count, header.max_elements_per_page
            )));
        }

        if recovered {
            let (count, total_used_bytes) = Self::recount(&sys, header.root_address).map_err(damaged)?;
            if count != header.count || total_used_bytes != header.total_used_bytes {
                warn!(
                    header_count = header.count,
                    count,
                    total_used_bytes,
                    "header counters were stale, recounted from page chain"
                );
            }
            header.count = count;
            header.total_used_bytes = total_used_bytes;
        }

        info!(
            path = %sys.disk().path().display(),
            count = header.count,
            total_used_bytes = header.total_used_bytes,
            recovered,
            "opened array"
        );
        Ok(Self::assemble(sys, header, config, recovered))
    }

    fn assemble(sys: StorageSystem, header: Header, config: Config, dirty: bool) -> Self {
        let cache = PageCache::new(config.effective_page_cache_capacity(), config.write_back_threshold);
        let cursor = Cursor {
            page: header.root_address,
            start: 0,
        };
        LargeArray {
            sys,
            cache,
            header,
            config,
            cursor,
            dirty,
            closed: false,
        }
    }

    /// Element count and payload bytes as recorded by the page chain itself
    fn recount(sys: &StorageSystem, root: Address) -> Result<(u64, u64)> {
        let mut visited = HashSet::new();
        let mut address = root;
        let (mut count, mut bytes) = (0u64, 0u64);
        while address.is_valid() {
            if !visited.insert(address) {
                return Err(Error::address(address, "page chain loops"));
            }
            let page = load_page(sys, address)?;
            count += page.count();
            bytes += page.handles().iter().map(|h| h.used).sum::<u64>();
            address = page.info.next;
        }
        Ok((count, bytes))
    }

    pub fn count(&self) -> u64 {
        self.header.count
    }

    pub fn is_empty(&self) -> bool {
        self.header.count == 0
    }

    pub fn total_used_bytes(&self) -> u64 {
        self.header.total_used_bytes
    }

    /// Bytes the allocator holds free for reuse
    pub fn total_free_bytes(&self) -> u64 {
        self.sys.allocator().free_byte_count()
    }

    pub fn max_elements_per_page(&self) -> u64 {
        self.header.max_elements_per_page
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.sys.disk().path()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Invalidate the on-disk free-space snapshot before the first change
    /// after open or sync, so a crash never resurrects a stale free list.
    fn mark_dirty(&mut self) -> Result<()> {
        if self.dirty {
            return Ok(());
        }
        self.header.free_list_root = Address::INVALID;
        self.sys.write_header(&self.header)?;
        self.sys.sync()?;
        self.dirty = true;
        Ok(())
    }

    /// Move the cursor until `position` falls inside its page. With
    /// `inclusive`, the slot just past a page's last element counts as
    /// inside.
    fn seek(&mut self, position: u64, inclusive: bool) -> Result<(Address, u64)> {
        let mut forward = None;
        let mut hops = 0u64;
        loop {
            hops += 1;
            if hops > self.header.count + 2 {
                return Err(Error::address(self.cursor.page, "page chain loops"));
            }

            let info = self.cache.peek_info(&self.sys, self.cursor.page)?;
            let end = self.cursor.start + info.count;
            let inside = if inclusive { position <= end } else { position < end };

            if position < self.cursor.start {
                if forward == Some(true) {
                    return Err(Error::State(format!("page counts disagree around position {}", position)));
                }
                forward = Some(false);
                if !info.prev.is_valid() {
                    return Err(Error::Bounds {
                        position,
                        count: self.header.count,
                    });
                }
                let prev = self.cache.peek_info(&self.sys, info.prev)?;
                if prev.count > self.cursor.start {
                    return Err(Error::State(format!(
                        "page {} holds {} elements before position {}",
                        prev.address, prev.count, self.cursor.start
                    )));
                }
                self.cursor = Cursor {
                    page: info.prev,
                    start: self.cursor.start - prev.count,
                };
            } else if !inside {
                if forward == Some(false) {
                    return Err(Error::State(format!("page counts disagree around position {}", position)));
                }
                forward = Some(true);
                if !info.next.is_valid() {
                    return Err(Error::Bounds {
                        position,
                        count: self.header.count,
                    });
                }
                self.cursor = Cursor {
                    page: info.next,
                    start: end,
                };
            } else {
                return Ok((self.cursor.page, position - self.cursor.start));
            }
        }
    }

    fn find_page_for_access(&mut self, position: u64) -> Result<(Address, u64)> {
        if position >= self.header.count {
            return Err(Error::Bounds {
                position,
                count: self.header.count,
            });
        }
        self.seek(position, false)
    }

    fn find_page_for_insertion(&mut self, position: u64) -> Result<(Address, u64)> {
        if position > self.header.count {
            return Err(Error::Bounds {
                position,
                count: self.header.count,
            });
        }
        self.seek(position, true)
    }

    /// Free a chain that never made it into a page
    fn release(&mut self, handle: &ElementHandle) {
        if let Err(err) = self.sys.free_chain(handle) {
            warn!(address = %handle.chunk_address, error = %err, "could not release orphaned chain");
        }
    }

    pub fn get(&mut self, position: u64) -> Result<Vec<u8>> {
        let (page, offset) = self.find_page_for_access(position)?;
        let handle = self.cache.read(&self.sys, page)?.handle_at(offset)?;
        self.sys.load_chain(&handle, None)
    }

    /// At most the first `limit` bytes of the element at `position`
    pub fn get_prefix(&mut self, position: u64, limit: u64) -> Result<Vec<u8>> {
        let (page, offset) = self.find_page_for_access(position)?;
        let handle = self.cache.read(&self.sys, page)?.handle_at(offset)?;
        self.sys.load_chain(&handle, Some(limit))
    }

    /// Length of the element at `position` without reading it
    pub fn element_len(&mut self, position: u64) -> Result<u64> {
        let (page, offset) = self.find_page_for_access(position)?;
        Ok(self.cache.read(&self.sys, page)?.handle_at(offset)?.used)
    }

    /// Replace the element at `position`. The existing chain is rewritten in
    /// place when `bytes` fits its reserved capacity.
    pub fn set(&mut self, position: u64, bytes: &[u8]) -> Result<()> {
        let (page, offset) = self.find_page_for_access(position)?;
        self.mark_dirty()?;
        let old = self.cache.read(&self.sys, page)?.handle_at(offset)?;

        let in_place = !bytes.is_empty() && old.chunk_address.is_valid() && bytes.len() as u64 <= old.reserved;
        let new = if in_place {
            self.sys.update_chain(old.chunk_address, bytes)?
        } else {
            self.sys.store_chain(bytes)?
        };

        if let Err(err) = self
            .cache
            .modify(&self.sys, page, Dirty::ALL, |p| p.set_handle(offset, new))
        {
            if !in_place {
                self.release(&new);
            }
            return Err(err);
        }
        if !in_place {
            self.sys.free_chain(&old)?;
        }

        self.header.total_used_bytes = self.header.total_used_bytes.saturating_sub(old.used) + new.used;
        Ok(())
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.mark_dirty()?;
        let (page, _) = self.find_page_for_insertion(self.header.count)?;
        let info = self.cache.peek_info(&self.sys, page)?;
        let handle = self.sys.store_chain(bytes)?;

        let result = if info.count >= info.max_count {
            self.append_page(page, handle)
        } else {
            self.cache.modify(&self.sys, page, Dirty::ALL, |p| p.append(handle))
        };
        if let Err(err) = result {
            self.release(&handle);
            return Err(err);
        }

        self.header.count += 1;
        self.header.total_used_bytes += handle.used;
        Ok(())
    }

    /// Start a new last page holding `handle` and move the cursor onto it
    fn append_page(&mut self, last: Address, handle: ElementHandle) -> Result<()> {
        let page = index::create_page(
            &mut self.sys,
            self.header.max_elements_per_page,
            last,
            Address::INVALID,
            vec![handle],
        )?;
        let address = page.address();
        self.cache.modify_info(&self.sys, last, |info| info.next = address)?;
        self.cursor = Cursor {
            page: address,
            start: self.header.count,
        };
        Ok(())
    }

    /// Insert before `position`; `position == count()` appends
    pub fn insert(&mut self, position: u64, bytes: &[u8]) -> Result<()> {
        if position == self.header.count {
            return self.append(bytes);
        }
        let (mut page, mut offset) = self.find_page_for_insertion(position)?;
        self.mark_dirty()?;

        // shifting handles into the next page can carry `position` along
        // into a page that is full in turn
        let mut attempts = 0u64;
        loop {
            let info = self.cache.peek_info(&self.sys, page)?;
            if info.count < info.max_count {
                break;
            }
            attempts += 1;
            if attempts > self.header.count + 2 {
                return Err(Error::State(format!("no room found for position {}", position)));
            }
            index::ensure_free_space(&mut self.sys, &mut self.cache, page, self.config.rebalance_threshold)?;
            (page, offset) = self.find_page_for_insertion(position)?;
        }

        let handle = self.sys.store_chain(bytes)?;
        if let Err(err) = self
            .cache
            .modify(&self.sys, page, Dirty::ALL, |p| p.insert(offset, handle))
        {
            self.release(&handle);
            return Err(err);
        }

        self.header.count += 1;
        self.header.total_used_bytes += handle.used;
        Ok(())
    }

    pub fn remove(&mut self, position: u64) -> Result<()> {
        let (page, offset) = self.find_page_for_access(position)?;
        self.mark_dirty()?;

        let handle = self.cache.modify(&self.sys, page, Dirty::ALL, |p| p.remove(offset))?;
        self.header.count -= 1;
        self.header.total_used_bytes = self.header.total_used_bytes.saturating_sub(handle.used);
        self.sys.free_chain(&handle)?;

        let info = self.cache.peek_info(&self.sys, page)?;
        if info.count == 0 && (info.prev.is_valid() || info.next.is_valid()) {
            self.drop_page(info)?;
        }
        Ok(())
    }

    /// Remove every element in `range`, one at a time
    pub fn remove_range(&mut self, range: Range<u64>) -> Result<()> {
        if range.start > range.end || range.end > self.header.count {
            return Err(Error::Bounds {
                position: range.end,
                count: self.header.count,
            });
        }
        for _ in range.clone() {
            self.remove(range.start)?;
        }
        Ok(())
    }

    /// Unlink an emptied page, moving the cursor to a neighbor first. The
    /// cursor is on `info`'s page.
    fn drop_page(&mut self, info: PageInfo) -> Result<()> {
        if info.next.is_valid() {
            self.cursor.page = info.next;
        } else {
            let prev = self.cache.peek_info(&self.sys, info.prev)?;
            self.cursor = Cursor {
                page: info.prev,
                start: self.cursor.start.saturating_sub(prev.count),
            };
        }

        index::deallocate(&mut self.sys, &mut self.cache, info.address)?;
        if self.header.root_address == info.address {
            self.header.root_address = info.next;
            self.sys.write_header(&self.header)?;
        }
        Ok(())
    }

    pub fn iter(&mut self) -> Iter<'_> {
        self.iter_from(0)
    }

    /// Iterate from `position` to the count at the time of the call
    pub fn iter_from(&mut self, position: u64) -> Iter<'_> {
        let end = self.header.count;
        Iter {
            array: self,
            position,
            end,
        }
    }

    /// Infos of all pages in chain order
    pub fn page_chain_info(&self) -> Result<Vec<PageInfo>> {
        let mut infos = Vec::new();
        let mut address = self.header.root_address;
        while address.is_valid() {
            if infos.len() as u64 > self.header.count {
                return Err(Error::address(address, "page chain loops"));
            }
            let info = self.cache.peek_info(&self.sys, address)?;
            address = info.next;
            infos.push(info);
        }
        Ok(infos)
    }

    /// Walk the page chain checking links, page bounds and counters
    pub fn check_integrity(&mut self) -> Result<()> {
        let infos = self.page_chain_info()?;
        let mut prev = Address::INVALID;
        let mut count = 0u64;
        let mut bytes = 0u64;

        for info in &infos {
            if info.prev != prev {
                return Err(Error::address(
                    info.address,
                    format!("back link points to {} instead of {}", info.prev, prev),
                ));
            }
            if info.max_count != self.header.max_elements_per_page {
                return Err(Error::State(format!(
                    "page {} has capacity {}, file uses {}",
                    info.address, info.max_count, self.header.max_elements_per_page
                )));
            }
            if info.count == 0 && infos.len() > 1 {
                return Err(Error::State(format!("empty page {} left in chain", info.address)));
            }

            let page = self.cache.read(&self.sys, info.address)?;
            for handle in page.handles() {
                if handle.used > handle.reserved || (handle.used > 0 && !handle.chunk_address.is_valid()) {
                    return Err(Error::address(
                        handle.chunk_address,
                        format!("bad handle in page {}", info.address),
                    ));
                }
                bytes += handle.used;
            }
            count += info.count;
            prev = info.address;
        }

        if count != self.header.count || bytes != self.header.total_used_bytes {
            return Err(Error::State(format!(
                "pages hold {} elements / {} bytes, header records {} / {}",
                count, bytes, self.header.count, self.header.total_used_bytes
            )));
        }
        Ok(())
    }

    /// Return unused space at the end of the file to the filesystem
    pub fn compact(&mut self) -> Result<u64> {
        self.compact_with(&TrimTail)
    }

    /// Truncate the file at the tail `strategy` picks from the free list.
    /// Returns the number of bytes released.
    pub fn compact_with(&mut self, strategy: &dyn CompactionStrategy) -> Result<u64> {
        self.mark_dirty()?;
        self.sys.compact(strategy)
    }

    /// Write back cached pages, the free-space snapshot and the header
    pub fn sync(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.cache.flush(&self.sys)?;
        self.header.free_list_root = self.sys.store_allocator_state()?;
        self.sys.write_header(&self.header)?;
        self.sys.sync()?;
        self.dirty = false;

        debug!(
            count = self.header.count,
            total_used_bytes = self.header.total_used_bytes,
            free_list_root = %self.header.free_list_root,
            "synced array"
        );
        Ok(())
    }

    /// Sync and release the file, reporting any failure
    pub fn close(mut self) -> Result<()> {
        let result = self.sync();
        self.closed = true;
        info!(path = %self.path().display(), ok = result.is_ok(), "closed array");
        result
    }
}

impl Drop for LargeArray {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.sync() {
            error!(path = %self.path().display(), error = %err, "failed to sync array on drop");
        }
    }
}

/// Forward iterator over elements, yielding each payload or the error that
/// ended the walk
pub struct Iter<'a> {
    array: &'a mut LargeArray,
    position: u64,
    end: u64,
}

impl Iterator for Iter<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.end {
            return None;
        }
        let item = self.array.get(self.position);
        self.position = if item.is_ok() { self.position + 1 } else { self.end };
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.position) as usize;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir, max: u64) -> LargeArray {
        let config = Config::new()
            .with_max_elements_per_page(max)
            .with_min_allocation_size(64);
        LargeArray::open_with_config(dir.path().join("array.bin"), config).unwrap()
    }

    fn counts(array: &LargeArray) -> Vec<u64> {
        array.page_chain_info().unwrap().iter().map(|i| i.count).collect()
    }

    #[test]
    fn test_cursor_walks_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 3);
        for i in 0..10u8 {
            array.append(&[i]).unwrap();
        }
        assert_eq!(counts(&array), vec![3, 3, 3, 1]);
        assert_eq!(array.cursor.start, 9);

        assert_eq!(array.get(1).unwrap(), vec![1]);
        assert_eq!(array.cursor.start, 0);
        assert_eq!(array.get(7).unwrap(), vec![7]);
        assert_eq!(array.cursor.start, 6);
        assert_eq!(array.get(4).unwrap(), vec![4]);
        assert_eq!(array.cursor.start, 3);
    }

    #[test]
    fn test_insert_into_full_page_splits() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 4);
        for i in 0..4u8 {
            array.append(&[i]).unwrap();
        }
        array.insert(1, b"x").unwrap();
        assert_eq!(counts(&array), vec![3, 2]);

        let all: Vec<Vec<u8>> = array.iter().collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![vec![0], b"x".to_vec(), vec![1], vec![2], vec![3]]);
        array.check_integrity().unwrap();
    }

    #[test]
    fn test_removing_root_page_moves_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 2);
        for i in 0..4u8 {
            array.append(&[i]).unwrap();
        }
        let old_root = array.header.root_address;
        array.remove(0).unwrap();
        array.remove(0).unwrap();

        assert_ne!(array.header.root_address, old_root);
        assert_eq!(counts(&array), vec![2]);
        assert_eq!(array.cursor.start, 0);
        assert_eq!(array.get(0).unwrap(), vec![2]);
        array.check_integrity().unwrap();
    }

    #[test]
    fn test_last_element_keeps_root_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 2);
        let root = array.header.root_address;
        array.append(b"only").unwrap();
        array.remove(0).unwrap();

        assert!(array.is_empty());
        assert_eq!(array.header.root_address, root);
        assert_eq!(counts(&array), vec![0]);
        array.append(b"again").unwrap();
        assert_eq!(array.get(0).unwrap(), b"again");
    }

    #[test]
    fn test_set_in_place_keeps_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 4);
        array.append(&[7u8; 40]).unwrap();
        let page = array.header.root_address;
        let before = array.cache.read(&array.sys, page).unwrap().handle_at(0).unwrap();

        array.set(0, b"short").unwrap();
        let after = array.cache.read(&array.sys, page).unwrap().handle_at(0).unwrap();
        assert_eq!(after.chunk_address, before.chunk_address);
        assert_eq!(after.used, 5);
        assert_eq!(array.total_used_bytes(), 5);
        assert_eq!(array.get(0).unwrap(), b"short");

        array.set(0, &[1u8; 500]).unwrap();
        let grown = array.cache.read(&array.sys, page).unwrap().handle_at(0).unwrap();
        assert_ne!(grown.chunk_address, before.chunk_address);
        assert_eq!(array.total_used_bytes(), 500);
    }

    #[test]
    fn test_first_mutation_invalidates_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("array.bin");
        {
            let mut array = open(&dir, 4);
            array.append(b"a").unwrap();
            array.close().unwrap();
        }

        let mut array = open(&dir, 4);
        assert!(array.header.free_list_root.is_valid());
        array.append(b"b").unwrap();

        let on_disk = Header::read(&Disk::open(&path).unwrap()).unwrap();
        assert!(!on_disk.free_list_root.is_valid());
    }

    #[test]
    fn test_insert_follows_position_into_rebalanced_page() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 3);
        for i in 0..6u8 {
            array.append(&[i]).unwrap();
        }
        array.remove(5).unwrap();
        array.get(0).unwrap();
        assert_eq!(counts(&array), vec![3, 2]);
        assert_eq!(array.cursor.start, 0);

        // the first page pushes its last handle on, which fills the second
        array.insert(3, b"x").unwrap();
        let all: Vec<Vec<u8>> = array.iter().collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![vec![0], vec![1], vec![2], b"x".to_vec(), vec![3], vec![4]]);
        assert!(counts(&array).iter().all(|&c| c <= 3));
        array.check_integrity().unwrap();
    }

    #[test]
    fn test_iter_from_middle() {
        let dir = tempfile::tempdir().unwrap();
        let mut array = open(&dir, 3);
        for i in 0..7u8 {
            array.append(&[i]).unwrap();
        }
        let tail: Vec<Vec<u8>> = array.iter_from(4).collect::<Result<_>>().unwrap();
        assert_eq!(tail, vec![vec![4], vec![5], vec![6]]);
        assert_eq!(array.iter_from(7).count(), 0);
    }
}
