use std::collections::BTreeMap;
use std::fmt;

use bincode::{Decode, Encode};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::base::{Address, HEADER_SIZE};
use crate::storage::io::{Disk, alloc_buffer};

/// Free fragments smaller than this many payload bytes are handed out
/// together with the chunk they were cut from.
const MIN_FRAGMENT_PAYLOAD: u64 = 32;

/// Bytes in front of a persisted allocator snapshot holding its length
const STATE_PREFIX_SIZE: u64 = 8;

/// One allocator-granted byte range; `len` includes the caller's overhead
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Chunk {
    pub address: Address,
    pub len: u64,
}

impl Chunk {
    pub fn new(address: Address, len: u64) -> Self {
        Chunk { address, len }
    }
}

/// Byte-range space manager for the region after the header
pub trait SpaceAllocator: fmt::Debug {
    /// Grant chunks whose combined capacity, after subtracting `overhead`
    /// from each chunk, holds `size` bytes. Every returned chunk receives at
    /// least one payload byte when filled in order.
    fn allocate(&mut self, size: u64, overhead: u64) -> Result<Vec<Chunk>>;

    fn deallocate(&mut self, chunks: &[Chunk]);

    fn free_byte_count(&self) -> u64;

    /// Persist the free list and return where it was written
    fn store_state(&mut self, disk: &Disk) -> Result<Address>;

    /// Give unused space back, truncating the file at the tail `strategy`
    /// picks; returns the number of bytes released
    fn compact(&mut self, disk: &Disk, strategy: &dyn CompactionStrategy) -> Result<u64>;
}

/// Picks the new logical end of the file during compaction.
///
/// Free extents at or beyond the returned tail are dropped from the free
/// list, so an implementation must only return addresses past which nothing
/// but free space lies.
pub trait CompactionStrategy: fmt::Debug {
    fn reclaim(&self, free: &BTreeMap<u64, u64>, tail: u64) -> u64;
}

/// Releases the free extent adjoining the end of the file, if any
#[derive(Debug, Default, Clone, Copy)]
pub struct TrimTail;

impl CompactionStrategy for TrimTail {
    fn reclaim(&self, free: &BTreeMap<u64, u64>, tail: u64) -> u64 {
        match free.iter().next_back() {
            Some((&address, &len)) if address + len == tail => address,
            _ => tail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorSettings {
    pub min_allocation_size: u64,
    pub max_chunk_size: u64,
    pub max_file_size: Option<u64>,
}

impl From<&Config> for AllocatorSettings {
    fn from(config: &Config) -> Self {
        AllocatorSettings {
            min_allocation_size: config.min_allocation_size,
            max_chunk_size: config.max_chunk_size,
            max_file_size: config.max_file_size,
        }
    }
}

#[derive(Debug, Encode, Decode)]
struct AllocatorState {
    tail: u64,
    extents: Vec<(u64, u64)>,
}

/// Address-ordered, coalescing free list in front of a growing file tail
#[derive(Debug)]
pub struct FreeListAllocator {
    settings: AllocatorSettings,
    /// First byte past the last allocated chunk
    tail: u64,
    /// address -> length
    free: BTreeMap<u64, u64>,
    free_bytes: u64,
}

impl FreeListAllocator {
    /// Allocator for a fresh file; everything from `start` on is unused
    pub fn new(settings: AllocatorSettings, start: u64) -> Self {
        FreeListAllocator {
            settings,
            tail: start.max(HEADER_SIZE),
            free: BTreeMap::new(),
            free_bytes: 0,
        }
    }

    /// Allocator for a file whose free list was never persisted. Free space
    /// inside the file is unknown and stays unused.
    pub fn recover(settings: AllocatorSettings, file_len: u64) -> Self {
        warn!(file_len, "no free-space snapshot, free space inside the file is leaked");
        Self::new(settings, file_len)
    }

    /// Restore a snapshot written by `store_state`. The snapshot area itself
    /// becomes the tail again.
    pub fn load_state(settings: AllocatorSettings, disk: &Disk, address: Address) -> Result<Self> {
        let file_len = disk.len()?;
        if !address.is_valid() || address.raw() < HEADER_SIZE || address.raw() + STATE_PREFIX_SIZE > file_len {
            return Err(Error::address(address, "free-space snapshot outside the file"));
        }

        let mut prefix = [0u8; STATE_PREFIX_SIZE as usize];
        disk.read_at(address.raw(), &mut prefix)?;
        let len = u64::from_le_bytes(prefix);
        if address.raw().saturating_add(STATE_PREFIX_SIZE).saturating_add(len) > file_len {
            return Err(Error::Format(format!(
                "free-space snapshot of {} bytes at {} runs past end of file",
                len, address
            )));
        }

        let mut buf = alloc_buffer(len)?;
        disk.read_at(address.raw() + STATE_PREFIX_SIZE, &mut buf)?;
        let (state, _): (AllocatorState, usize) =
            bincode::decode_from_slice(&buf, bincode::config::standard())?;

        if state.tail != address.raw() {
            return Err(Error::Format(format!(
                "free-space snapshot at {} records tail {:#x}",
                address, state.tail
            )));
        }

        let mut allocator = Self::new(settings, state.tail);
        for (start, len) in state.extents {
            if start < HEADER_SIZE || start.saturating_add(len) > state.tail {
                return Err(Error::Format(format!(
                    "free extent {:#x}+{} outside allocated region",
                    start, len
                )));
            }
            allocator.free.insert(start, len);
            allocator.free_bytes += len;
        }

        debug!(%address, free_bytes = allocator.free_bytes, extents = allocator.free.len(), "loaded allocator state");
        Ok(allocator)
    }

    pub fn tail(&self) -> u64 {
        self.tail
    }

    pub fn extent_count(&self) -> usize {
        self.free.len()
    }

    fn min_fragment(overhead: u64) -> u64 {
        overhead + MIN_FRAGMENT_PAYLOAD
    }

    /// Remove the extent at `address` and keep `want` bytes of it, returning
    /// the split-off remainder to the free list unless it is a sliver.
    fn carve(&mut self, address: u64, len: u64, want: u64, overhead: u64) -> u64 {
        self.free.remove(&address);
        let taken = if len <= self.settings.max_chunk_size && len < want + Self::min_fragment(overhead) {
            len
        } else {
            want
        };
        if taken < len {
            self.free.insert(address + taken, len - taken);
        }
        self.free_bytes -= taken;
        taken
    }

    fn best_fit(&self, want: u64) -> Option<(u64, u64)> {
        self.free
            .iter()
            .filter(|&(_, &len)| len >= want)
            .min_by_key(|&(&address, &len)| (len, address))
            .map(|(&address, &len)| (address, len))
    }

    /// Undo a partially satisfied request
    fn rollback(&mut self, chunks: &[Chunk], tail_before: u64) {
        let holes: Vec<Chunk> = chunks
            .iter()
            .copied()
            .filter(|chunk| chunk.address.raw() < tail_before)
            .collect();
        self.tail = tail_before;
        self.deallocate(&holes);
    }
}

impl SpaceAllocator for FreeListAllocator {
    fn allocate(&mut self, size: u64, overhead: u64) -> Result<Vec<Chunk>> {
        if size == 0 {
            return Err(Error::State("zero-length allocation".to_string()));
        }
        let max_chunk = self.settings.max_chunk_size;
        let min_alloc = self.settings.min_allocation_size;
        if max_chunk <= overhead {
            return Err(Error::Capacity(format!(
                "chunks of {} bytes cannot carry {} bytes of overhead",
                max_chunk, overhead
            )));
        }

        // Single chunk from the free list
        if size + overhead <= max_chunk {
            let want = (size + overhead).max(min_alloc).min(max_chunk);
            if let Some((address, len)) = self.best_fit(want) {
                let taken = self.carve(address, len, want, overhead);
                return Ok(vec![Chunk::new(Address::new(address), taken)]);
            }
        }

        let tail_before = self.tail;
        let mut chunks = Vec::new();
        let mut remaining = size;

        // Holes in address order, then the tail
        let min_hole = min_alloc.min(size + overhead).max(overhead + 1);
        let holes: Vec<(u64, u64)> = self
            .free
            .iter()
            .filter(|&(_, &len)| len >= min_hole)
            .map(|(&address, &len)| (address, len))
            .collect();
        for (address, len) in holes {
            if remaining == 0 {
                break;
            }
            let want = (remaining + overhead).max(min_alloc).min(max_chunk).min(len);
            let taken = self.carve(address, len, want, overhead);
            remaining -= (taken - overhead).min(remaining);
            chunks.push(Chunk::new(Address::new(address), taken));
        }

        while remaining > 0 {
            let want = (remaining + overhead).max(min_alloc).min(max_chunk);
            if let Some(limit) = self.settings.max_file_size {
                if self.tail + want > limit {
                    self.rollback(&chunks, tail_before);
                    return Err(Error::Capacity(format!(
                        "allocating {} bytes would grow the file past {} bytes",
                        size, limit
                    )));
                }
            }
            chunks.push(Chunk::new(Address::new(self.tail), want));
            self.tail += want;
            remaining -= (want - overhead).min(remaining);
        }

        if self.tail > tail_before {
            debug!(size, chunks = chunks.len(), tail = self.tail, "grew file tail");
        }
        Ok(chunks)
    }

    fn deallocate(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            let mut start = chunk.address.raw();
            let mut len = chunk.len;
            let end = start + len;

            let prev = self.free.range(..start).next_back().map(|(&a, &l)| (a, l));
            let next = self.free.range(start..).next().map(|(&a, &l)| (a, l));
            let overlaps_prev = prev.is_some_and(|(a, l)| a + l > start);
            let overlaps_next = next.is_some_and(|(a, _)| a < end);
            if overlaps_prev || overlaps_next || end > self.tail {
                warn!(address = %chunk.address, len, "ignoring release of space that is already free");
                continue;
            }

            self.free_bytes += len;
            if let Some((a, l)) = prev {
                if a + l == start {
                    self.free.remove(&a);
                    start = a;
                    len += l;
                }
            }
            if let Some((a, l)) = next {
                if a == end {
                    self.free.remove(&a);
                    len += l;
                }
            }
            self.free.insert(start, len);
        }
    }

    fn free_byte_count(&self) -> u64 {
        self.free_bytes
    }

    fn store_state(&mut self, disk: &Disk) -> Result<Address> {
        let state = AllocatorState {
            tail: self.tail,
            extents: self.free.iter().map(|(&a, &l)| (a, l)).collect(),
        };
        let encoded = bincode::encode_to_vec(&state, bincode::config::standard())?;

        let mut buf = Vec::with_capacity(STATE_PREFIX_SIZE as usize + encoded.len());
        buf.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
        buf.extend_from_slice(&encoded);
        disk.write_at(self.tail, &buf)?;

        let address = Address::new(self.tail);
        debug!(%address, bytes = buf.len(), extents = state.extents.len(), "stored allocator state");
        Ok(address)
    }

    fn compact(&mut self, disk: &Disk, strategy: &dyn CompactionStrategy) -> Result<u64> {
        let new_tail = strategy.reclaim(&self.free, self.tail).max(HEADER_SIZE);
        if new_tail >= self.tail {
            return Ok(0);
        }

        let dropped = self.free.split_off(&new_tail);
        let dropped_bytes: u64 = dropped.values().sum();
        if dropped_bytes != self.tail - new_tail {
            // Strategy picked a tail with live data behind it
            self.free.extend(dropped);
            return Err(Error::State(format!(
                "compaction to {:#x} would drop live data below tail {:#x}",
                new_tail, self.tail
            )));
        }

        let released = self.tail - new_tail;
        self.free_bytes -= dropped_bytes;
        self.tail = new_tail;
        disk.set_len(new_tail)?;
        debug!(released, tail = new_tail, "compacted file tail");
        Ok(released)
    }
}
