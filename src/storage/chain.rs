use tracing::trace;

use crate::error::{Error, Result};
use crate::storage::StorageSystem;
use crate::storage::allocator::Chunk;
use crate::storage::base::{Address, ChunkLink, ElementHandle, LINK_HEADER_SIZE, decode_fixed, encode_fixed};

/// Chunk chains: a byte blob spread across allocator chunks, each prefixed
/// by a `ChunkLink` pointing at the next one.
impl StorageSystem {
    pub(crate) fn read_link(&self, address: Address) -> Result<ChunkLink> {
        self.check_range(address, LINK_HEADER_SIZE)?;
        let mut buf = [0u8; LINK_HEADER_SIZE as usize];
        self.disk().read_at(address.raw(), &mut buf)?;
        let link: ChunkLink = decode_fixed(&buf)?;
        if link.reserved <= LINK_HEADER_SIZE || link.used > link.payload_capacity() {
            return Err(Error::address(
                address,
                format!("corrupt chunk link (used {}, reserved {})", link.used, link.reserved),
            ));
        }
        self.check_range(address, link.reserved)?;
        Ok(link)
    }

    /// With `fill`, the write covers the whole chunk so the file always
    /// extends past every allocated byte.
    fn write_link(&self, address: Address, link: &ChunkLink, payload: &[u8], fill: bool) -> Result<()> {
        let mut buf = encode_fixed(link, LINK_HEADER_SIZE)?;
        buf.extend_from_slice(payload);
        if fill {
            buf.resize(link.reserved as usize, 0);
        }
        self.disk().write_at(address.raw(), &buf)?;
        Ok(())
    }

    /// Write `data` into freshly allocated chunks. Empty data gets the empty
    /// handle and touches nothing on disk.
    pub fn store_chain(&mut self, data: &[u8]) -> Result<ElementHandle> {
        if data.is_empty() {
            return Ok(ElementHandle::empty());
        }

        let chunks = self.allocator_mut().allocate(data.len() as u64, LINK_HEADER_SIZE)?;
        match self.write_chunks(&chunks, data) {
            Ok(reserved) => {
                trace!(address = %chunks[0].address, len = data.len(), links = chunks.len(), "stored chain");
                Ok(ElementHandle::new(chunks[0].address, data.len() as u64, reserved))
            }
            Err(err) => {
                self.allocator_mut().deallocate(&chunks);
                Err(err)
            }
        }
    }

    fn write_chunks(&self, chunks: &[Chunk], data: &[u8]) -> Result<u64> {
        let mut offset = 0usize;
        let mut reserved = 0u64;
        for (i, chunk) in chunks.iter().enumerate() {
            let capacity = chunk.len - LINK_HEADER_SIZE;
            let take = (capacity as usize).min(data.len() - offset);
            let link = ChunkLink {
                next: chunks.get(i + 1).map_or(Address::INVALID, |c| c.address),
                used: take as u64,
                reserved: chunk.len,
                terminal: i + 1 == chunks.len(),
            };
            self.write_link(chunk.address, &link, &data[offset..offset + take], true)?;
            offset += take;
            reserved += capacity;
        }
        if offset != data.len() {
            return Err(Error::Size {
                expected: data.len() as u64,
                actual: offset as u64,
            });
        }
        Ok(reserved)
    }

    /// Read the payload behind `handle`, stopping after `limit` bytes when
    /// given.
    pub fn load_chain(&self, handle: &ElementHandle, limit: Option<u64>) -> Result<Vec<u8>> {
        if handle.used == 0 {
            return Ok(Vec::new());
        }
        if !handle.chunk_address.is_valid() {
            return Err(Error::address(handle.chunk_address, "non-empty element without a chain"));
        }

        let want = limit.map_or(handle.used, |limit| limit.min(handle.used));
        let mut out = Vec::new();

        let mut address = handle.chunk_address;
        let mut hops = 0u64;
        loop {
            hops += 1;
            if hops > handle.used {
                return Err(Error::address(address, "chain longer than its payload, likely a cycle"));
            }

            let link = self.read_link(address)?;
            let take = link.used.min(want - out.len() as u64);
            if take > 0 {
                let start = out.len();
                out.resize(start + take as usize, 0);
                self.disk()
                    .read_at(address.offset(LINK_HEADER_SIZE).raw(), &mut out[start..])?;
            }

            if out.len() as u64 == want && (limit.is_some() || link.terminal) {
                break;
            }
            if link.terminal {
                return Err(Error::Size {
                    expected: want,
                    actual: out.len() as u64,
                });
            }
            if out.len() as u64 == want {
                return Err(Error::address(address, "chain continues past its recorded length"));
            }
            if !link.next.is_valid() {
                return Err(Error::address(address, "chain ends before its terminal link"));
            }
            address = link.next;
        }

        Ok(out)
    }

    /// Rewrite the chain at `start` with `data` without reallocating.
    /// Links past the new end keep their chunks but carry no payload.
    pub fn update_chain(&self, start: Address, data: &[u8]) -> Result<ElementHandle> {
        if data.is_empty() {
            return Err(Error::State("in-place update with empty data".to_string()));
        }

        let links = self.chain_links(start)?;
        let capacity: u64 = links.iter().map(|(_, link)| link.payload_capacity()).sum();
        if (data.len() as u64) > capacity {
            return Err(Error::Size {
                expected: data.len() as u64,
                actual: capacity,
            });
        }

        let mut offset = 0usize;
        for (address, link) in &links {
            let take = (link.payload_capacity() as usize).min(data.len() - offset);
            let was_open = offset < data.len();
            offset += take;
            let updated = ChunkLink {
                next: link.next,
                used: take as u64,
                reserved: link.reserved,
                terminal: was_open && offset == data.len(),
            };
            self.write_link(*address, &updated, &data[offset - take..offset], false)?;
        }

        Ok(ElementHandle::new(start, data.len() as u64, capacity))
    }

    /// Every link reachable from `start`, terminal or not
    pub fn chain_links(&self, start: Address) -> Result<Vec<(Address, ChunkLink)>> {
        let file_len = self.disk().len()?;
        let mut links = Vec::new();
        let mut address = start;
        while address.is_valid() {
            // every link occupies more than a link header
            if links.len() as u64 > file_len / LINK_HEADER_SIZE {
                return Err(Error::address(start, "chain does not terminate"));
            }
            let link = self.read_link(address)?;
            links.push((address, link));
            address = link.next;
        }
        Ok(links)
    }

    /// Return every chunk of the chain behind `handle` to the allocator
    pub fn free_chain(&mut self, handle: &ElementHandle) -> Result<()> {
        if !handle.chunk_address.is_valid() {
            return Ok(());
        }
        let chunks: Vec<Chunk> = self
            .chain_links(handle.chunk_address)?
            .into_iter()
            .map(|(address, link)| Chunk::new(address, link.reserved))
            .collect();
        self.allocator_mut().deallocate(&chunks);
        trace!(address = %handle.chunk_address, links = chunks.len(), "freed chain");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::allocator::{AllocatorSettings, FreeListAllocator, SpaceAllocator};
    use crate::storage::base::HEADER_SIZE;
    use crate::storage::io::Disk;

    fn system(dir: &tempfile::TempDir, min: u64, max: u64) -> StorageSystem {
        let disk = Disk::open(dir.path().join("chain.bin")).unwrap();
        let allocator = FreeListAllocator::new(
            AllocatorSettings {
                min_allocation_size: min,
                max_chunk_size: max,
                max_file_size: None,
            },
            HEADER_SIZE,
        );
        StorageSystem::new(disk, Box::new(allocator))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_store_and_load_single_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 4096);
        let handle = sys.store_chain(b"hello").unwrap();
        assert_eq!(handle.used, 5);
        assert_eq!(handle.reserved, 64 - LINK_HEADER_SIZE);
        assert_eq!(sys.load_chain(&handle, None).unwrap(), b"hello");
    }

    #[test]
    fn test_store_spans_multiple_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 100);
        let data = pattern(500);
        let handle = sys.store_chain(&data).unwrap();

        let links = sys.chain_links(handle.chunk_address).unwrap();
        assert!(links.len() > 1);
        assert!(links.iter().all(|(_, link)| link.used > 0));
        assert_eq!(links.iter().filter(|(_, link)| link.terminal).count(), 1);
        assert!(links.last().unwrap().1.terminal);

        assert_eq!(sys.load_chain(&handle, None).unwrap(), data);
        assert_eq!(sys.load_chain(&handle, Some(123)).unwrap(), &data[..123]);
    }

    #[test]
    fn test_three_chunk_element_has_one_terminal_link() {
        // 132-byte chunks hold 100 payload bytes each
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 132);
        let data = pattern(250);
        let handle = sys.store_chain(&data).unwrap();

        let links = sys.chain_links(handle.chunk_address).unwrap();
        let used: Vec<u64> = links.iter().map(|(_, link)| link.used).collect();
        assert_eq!(used, vec![100, 100, 50]);
        let terminal: Vec<bool> = links.iter().map(|(_, link)| link.terminal).collect();
        assert_eq!(terminal, vec![false, false, true]);
        assert_eq!(sys.load_chain(&handle, None).unwrap(), data);
    }

    #[test]
    fn test_empty_payload_has_no_chain() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 4096);
        let handle = sys.store_chain(&[]).unwrap();
        assert!(handle.is_empty());
        assert!(!handle.chunk_address.is_valid());
        assert!(sys.load_chain(&handle, None).unwrap().is_empty());
        sys.free_chain(&handle).unwrap();
    }

    #[test]
    fn test_update_shrinks_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 100);
        let handle = sys.store_chain(&pattern(300)).unwrap();

        let updated = sys.update_chain(handle.chunk_address, b"short").unwrap();
        assert_eq!(updated.chunk_address, handle.chunk_address);
        assert_eq!(updated.reserved, handle.reserved);
        assert_eq!(sys.load_chain(&updated, None).unwrap(), b"short");

        let links = sys.chain_links(handle.chunk_address).unwrap();
        assert!(links[0].1.terminal);
        assert!(links[1..].iter().all(|(_, link)| link.used == 0 && !link.terminal));

        // grows back into the trailing links
        let data = pattern(280);
        let regrown = sys.update_chain(handle.chunk_address, &data).unwrap();
        assert_eq!(sys.load_chain(&regrown, None).unwrap(), data);
    }

    #[test]
    fn test_update_beyond_capacity_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 4096);
        let handle = sys.store_chain(b"abc").unwrap();
        let err = sys.update_chain(handle.chunk_address, &pattern(200)).unwrap_err();
        assert!(matches!(err, Error::Size { .. }));
    }

    #[test]
    fn test_free_returns_all_links() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 100);
        let handle = sys.store_chain(&pattern(300)).unwrap();
        let _guard = sys.store_chain(b"guard").unwrap();
        let total: u64 = sys
            .chain_links(handle.chunk_address)
            .unwrap()
            .iter()
            .map(|(_, link)| link.reserved)
            .sum();

        sys.free_chain(&handle).unwrap();
        assert_eq!(sys.allocator().free_byte_count(), total);
    }

    #[test]
    fn test_invalid_address_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 4096);
        sys.store_chain(b"data").unwrap();
        let bogus = ElementHandle::new(Address::new(1 << 30), 4, 32);
        assert!(matches!(sys.load_chain(&bogus, None), Err(Error::Address { .. })));

        let dangling = ElementHandle::new(Address::INVALID, 4, 32);
        assert!(matches!(sys.load_chain(&dangling, None), Err(Error::Address { .. })));
    }

    #[test]
    fn test_handle_longer_than_chain_is_size_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sys = system(&dir, 64, 4096);
        let handle = sys.store_chain(b"data").unwrap();
        let lying = ElementHandle::new(handle.chunk_address, 10, handle.reserved);
        assert!(matches!(sys.load_chain(&lying, None), Err(Error::Size { .. })));
    }
}
