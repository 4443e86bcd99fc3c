pub mod page;

use tracing::debug;

use crate::config::RebalanceThreshold;
use crate::error::{Error, Result};
use crate::storage::StorageSystem;
use crate::storage::base::{Address, ElementHandle};
use crate::storage::cache::PageCache;
use self::page::{Dirty, PAGE_INFO_SIZE, Page, PageInfo};

fn info_handle(address: Address) -> ElementHandle {
    ElementHandle::new(address, PAGE_INFO_SIZE, PAGE_INFO_SIZE)
}

fn nodes_handle(info: &PageInfo) -> ElementHandle {
    let size = Page::nodes_size(info.max_count);
    ElementHandle::new(info.nodes_address, size, size)
}

/// Read a page's info block, checking it belongs to `address`
pub fn load_info(sys: &StorageSystem, address: Address) -> Result<PageInfo> {
    if !address.is_valid() {
        return Err(Error::address(address, "no such page"));
    }
    let bytes = sys.load_chain(&info_handle(address), None)?;
    let info = PageInfo::from_bytes(&bytes)?;
    if info.address != address {
        return Err(Error::address(
            address,
            format!("page info records address {}", info.address),
        ));
    }
    Ok(info)
}

pub fn load_page(sys: &StorageSystem, address: Address) -> Result<Page> {
    let info = load_info(sys, address)?;
    let nodes = sys.load_chain(&nodes_handle(&info), None)?;
    Page::decode(info, &nodes)
}

pub fn store_info(sys: &StorageSystem, info: &PageInfo) -> Result<()> {
    sys.update_chain(info.address, &info.to_bytes()?)?;
    Ok(())
}

/// Write the parts of `page` flagged in `dirty`
pub fn store_page(sys: &StorageSystem, page: &Page, dirty: Dirty) -> Result<()> {
    if dirty.nodes {
        sys.update_chain(page.info.nodes_address, &page.encode_nodes()?)?;
    }
    if dirty.info {
        store_info(sys, &page.info)?;
    }
    Ok(())
}

/// Allocate and persist a page holding `handles`, linked between `prev`
/// and `next`. Neighbors are not touched.
pub fn create_page(
    sys: &mut StorageSystem,
    max_count: u64,
    prev: Address,
    next: Address,
    handles: Vec<ElementHandle>,
) -> Result<Page> {
    let mut page = Page::new(PageInfo::new(max_count));
    page.extend(handles)?;

    let nodes = sys.store_chain(&page.encode_nodes()?)?;
    page.info.nodes_address = nodes.chunk_address;
    page.info.prev = prev;
    page.info.next = next;

    let info = match sys.store_chain(&page.info.to_bytes()?) {
        Ok(info) => info,
        Err(err) => {
            sys.free_chain(&nodes)?;
            return Err(err);
        }
    };
    page.info.address = info.chunk_address;
    store_info(sys, &page.info)?;

    debug!(address = %page.address(), count = page.count(), %prev, %next, "created page");
    Ok(page)
}

/// Move the back half of a full page into a new page linked right after it.
/// Returns the new page's address.
pub fn split(sys: &mut StorageSystem, cache: &mut PageCache, address: Address) -> Result<Address> {
    let info = cache.peek_info(sys, address)?;
    if info.count < 2 {
        return Err(Error::State(format!(
            "cannot split page {} holding {} handles",
            address, info.count
        )));
    }

    let keep = info.count - info.count / 2;
    let moved = cache.modify(sys, address, Dirty::ALL, |page| page.split_off(keep))?;
    let created = match create_page(sys, info.max_count, address, info.next, moved.clone()) {
        Ok(created) => created,
        Err(err) => {
            cache.modify(sys, address, Dirty::ALL, |page| page.extend(moved))?;
            return Err(err);
        }
    };

    let new_address = created.address();
    cache.modify_info(sys, address, |info| info.next = new_address)?;
    if info.next.is_valid() {
        cache.modify_info(sys, info.next, |info| info.prev = new_address)?;
    }

    debug!(%address, new = %new_address, kept = keep, moved = info.count - keep, "split page");
    Ok(new_address)
}

/// Make room in a full page, preferring to shift trailing handles into the
/// next page over splitting.
pub fn ensure_free_space(
    sys: &mut StorageSystem,
    cache: &mut PageCache,
    address: Address,
    threshold: RebalanceThreshold,
) -> Result<()> {
    let info = cache.peek_info(sys, address)?;
    if info.count < info.max_count {
        return Ok(());
    }

    if info.next.is_valid() {
        let next = cache.peek_info(sys, info.next)?;
        let free = next.free_slots();
        let shift = info.count.saturating_sub(next.count).div_ceil(2).min(free);
        if free >= threshold.min_free(next.max_count) && shift > 0 {
            let moved = cache.modify(sys, address, Dirty::ALL, |page| page.split_off(info.count - shift))?;
            if let Err(err) = cache.modify(sys, info.next, Dirty::ALL, |page| page.prepend(moved.clone())) {
                cache.modify(sys, address, Dirty::ALL, |page| page.extend(moved))?;
                return Err(err);
            }
            debug!(%address, next = %info.next, shift, "rebalanced into next page");
            return Ok(());
        }
    }

    split(sys, cache, address)?;
    Ok(())
}

/// Free an empty page and unlink it from its neighbors
pub fn deallocate(sys: &mut StorageSystem, cache: &mut PageCache, address: Address) -> Result<()> {
    let info = cache.peek_info(sys, address)?;
    if info.count != 0 {
        return Err(Error::State(format!(
            "page {} still holds {} handles",
            address, info.count
        )));
    }

    cache.purge(address);
    if info.prev.is_valid() {
        cache.modify_info(sys, info.prev, |prev| prev.next = info.next)?;
    }
    if info.next.is_valid() {
        cache.modify_info(sys, info.next, |next| next.prev = info.prev)?;
    }
    sys.free_chain(&nodes_handle(&info))?;
    sys.free_chain(&info_handle(address))?;

    debug!(%address, prev = %info.prev, next = %info.next, "deallocated page");
    Ok(())
}
