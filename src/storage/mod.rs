pub mod allocator;
pub mod base;
pub mod cache;
mod chain;
pub mod index;
pub mod io;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use self::allocator::{CompactionStrategy, SpaceAllocator};
use self::base::{Address, HEADER_SIZE, Header};
use self::io::Disk;

/// Page cache counters since open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    /// Pages loaded from disk
    pub misses: u64,
    pub evictions: u64,
    pub write_backs: u64,
}

/// The backing file together with the allocator that carves it up
#[derive(Debug)]
pub struct StorageSystem {
    disk: Disk,
    allocator: Box<dyn SpaceAllocator>,
}

impl StorageSystem {
    pub fn new(disk: Disk, allocator: Box<dyn SpaceAllocator>) -> Self {
        StorageSystem { disk, allocator }
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn allocator(&self) -> &dyn SpaceAllocator {
        self.allocator.as_ref()
    }

    pub fn allocator_mut(&mut self) -> &mut dyn SpaceAllocator {
        self.allocator.as_mut()
    }

    /// Fail with an address error unless `len` bytes at `address` lie inside
    /// the allocated region of the file
    pub fn check_range(&self, address: Address, len: u64) -> Result<()> {
        if !address.is_valid() {
            return Err(Error::address(address, "invalid address"));
        }
        let file_len = self.disk.len()?;
        if address.raw() < HEADER_SIZE || address.raw().saturating_add(len) > file_len {
            return Err(Error::address(
                address,
                format!("{} bytes outside file of {} bytes", len, file_len),
            ));
        }
        Ok(())
    }

    pub fn write_header(&self, header: &Header) -> Result<()> {
        self.disk.write_at(0, &header.to_bytes()?)?;
        Ok(())
    }

    /// Persist the allocator's free list and return its address
    pub fn store_allocator_state(&mut self) -> Result<Address> {
        self.allocator.store_state(&self.disk)
    }

    pub fn compact(&mut self, strategy: &dyn CompactionStrategy) -> Result<u64> {
        let released = self.allocator.compact(&self.disk, strategy)?;
        debug!(released, "compacted storage");
        Ok(released)
    }

    pub fn sync(&self) -> Result<()> {
        self.disk.sync()?;
        Ok(())
    }
}
