use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::base::{Address, ElementHandle, HANDLE_SIZE, MAX_ELEMENTS_PER_PAGE, decode_fixed, encode_fixed};

/// Encoded size of a page info record
pub const PAGE_INFO_SIZE: u64 = 48;

/// Per-page metadata, stored in its own chunk chain.
///
/// The chain's first chunk address is the page's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct PageInfo {
    pub address: Address,
    /// Chain holding the fixed-size node array
    pub nodes_address: Address,
    pub count: u64,
    pub max_count: u64,
    pub next: Address,
    pub prev: Address,
}

impl PageInfo {
    pub fn new(max_count: u64) -> Self {
        PageInfo {
            address: Address::INVALID,
            nodes_address: Address::INVALID,
            count: 0,
            max_count,
            next: Address::INVALID,
            prev: Address::INVALID,
        }
    }

    pub fn free_slots(&self) -> u64 {
        self.max_count.saturating_sub(self.count)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_fixed(self, PAGE_INFO_SIZE)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let info: PageInfo = decode_fixed(bytes)?;
        if info.max_count == 0 || info.max_count > MAX_ELEMENTS_PER_PAGE {
            return Err(Error::Format(format!(
                "page at {} has capacity {}",
                info.address, info.max_count
            )));
        }
        if info.count > info.max_count {
            return Err(Error::Format(format!(
                "page at {} holds {} of {} slots",
                info.address, info.count, info.max_count
            )));
        }
        Ok(info)
    }
}

/// Which parts of a cached page differ from disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dirty {
    pub info: bool,
    pub nodes: bool,
}

impl Dirty {
    pub const CLEAN: Dirty = Dirty { info: false, nodes: false };
    pub const INFO: Dirty = Dirty { info: true, nodes: false };
    pub const ALL: Dirty = Dirty { info: true, nodes: true };

    pub fn any(&self) -> bool {
        self.info || self.nodes
    }

    pub fn merge(&mut self, other: Dirty) {
        self.info |= other.info;
        self.nodes |= other.nodes;
    }
}

/// In-memory index page: its info plus the live element handles in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub info: PageInfo,
    handles: Vec<ElementHandle>,
}

impl Page {
    pub fn new(info: PageInfo) -> Self {
        Page {
            handles: Vec::with_capacity(info.max_count.min(1024) as usize),
            info,
        }
    }

    /// Rebuild a page from its info and the raw node array
    pub fn decode(info: PageInfo, nodes: &[u8]) -> Result<Self> {
        let needed = info.count * HANDLE_SIZE;
        if (nodes.len() as u64) < needed {
            return Err(Error::Size {
                expected: needed,
                actual: nodes.len() as u64,
            });
        }

        let mut page = Page::new(info);
        for slot in nodes.chunks_exact(HANDLE_SIZE as usize).take(info.count as usize) {
            page.handles.push(decode_fixed(slot)?);
        }
        Ok(page)
    }

    /// Node array for all `max_count` slots, unused slots zeroed
    pub fn encode_nodes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::nodes_size(self.info.max_count) as usize);
        for handle in &self.handles {
            buf.extend_from_slice(&encode_fixed(handle, HANDLE_SIZE)?);
        }
        buf.resize(Self::nodes_size(self.info.max_count) as usize, 0);
        Ok(buf)
    }

    pub fn nodes_size(max_count: u64) -> u64 {
        max_count * HANDLE_SIZE
    }

    pub fn address(&self) -> Address {
        self.info.address
    }

    pub fn count(&self) -> u64 {
        self.info.count
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.info.count >= self.info.max_count
    }

    pub fn handles(&self) -> &[ElementHandle] {
        &self.handles
    }

    fn check(&self, index: u64, inclusive: bool) -> Result<usize> {
        let limit = if inclusive { self.info.count } else { self.info.count.saturating_sub(1) };
        if index > limit || (!inclusive && self.handles.is_empty()) {
            return Err(Error::Bounds {
                position: index,
                count: self.info.count,
            });
        }
        Ok(index as usize)
    }

    fn sync_count(&mut self) {
        self.info.count = self.handles.len() as u64;
    }

    pub fn handle_at(&self, index: u64) -> Result<ElementHandle> {
        let i = self.check(index, false)?;
        Ok(self.handles[i])
    }

    /// Replace the handle at `index`, returning the old one
    pub fn set_handle(&mut self, index: u64, handle: ElementHandle) -> Result<ElementHandle> {
        let i = self.check(index, false)?;
        Ok(std::mem::replace(&mut self.handles[i], handle))
    }

    pub fn insert(&mut self, index: u64, handle: ElementHandle) -> Result<()> {
        if self.is_full() {
            return Err(Error::PageFull {
                address: self.info.address,
            });
        }
        let i = self.check(index, true)?;
        self.handles.insert(i, handle);
        self.sync_count();
        Ok(())
    }

    pub fn append(&mut self, handle: ElementHandle) -> Result<()> {
        self.insert(self.info.count, handle)
    }

    pub fn remove(&mut self, index: u64) -> Result<ElementHandle> {
        let i = self.check(index, false)?;
        let handle = self.handles.remove(i);
        self.sync_count();
        Ok(handle)
    }

    /// Detach the handles from `at` to the end
    pub fn split_off(&mut self, at: u64) -> Result<Vec<ElementHandle>> {
        let i = self.check(at, true)?;
        let tail = self.handles.split_off(i);
        self.sync_count();
        Ok(tail)
    }

    /// Put `handles` in front of the existing ones
    pub fn prepend(&mut self, handles: Vec<ElementHandle>) -> Result<()> {
        if self.info.count + handles.len() as u64 > self.info.max_count {
            return Err(Error::PageFull {
                address: self.info.address,
            });
        }
        self.handles.splice(0..0, handles);
        self.sync_count();
        Ok(())
    }

    pub fn extend(&mut self, handles: Vec<ElementHandle>) -> Result<()> {
        if self.info.count + handles.len() as u64 > self.info.max_count {
            return Err(Error::PageFull {
                address: self.info.address,
            });
        }
        self.handles.extend(handles);
        self.sync_count();
        Ok(())
    }
}
