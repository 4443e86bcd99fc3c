use std::fmt;

use bincode::config::{Configuration, Fixint, LittleEndian, NoLimit};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::io::Disk;

/// On-disk format version written by this build
pub const FORMAT_VERSION: u32 = 1;

/// Reserved bytes at file offset 0 for the header
pub const HEADER_SIZE: u64 = 64;

/// Reserved bytes in front of every chunk's payload
pub const LINK_HEADER_SIZE: u64 = 32;

/// Encoded size of an element handle inside a node array
pub const HANDLE_SIZE: u64 = 24;

/// Largest page capacity a file may record
pub const MAX_ELEMENTS_PER_PAGE: u64 = 1 << 32;

const HEADER_MAGIC: u32 = 0x4C415259; // "LARY"

/// Fixed-width little-endian encoding used for every persisted record
pub(crate) type FixedCodec = Configuration<LittleEndian, Fixint, NoLimit>;

pub(crate) fn codec() -> FixedCodec {
    bincode::config::standard().with_fixed_int_encoding()
}

/// Encode `value` into a zero-padded buffer of exactly `size` bytes
pub(crate) fn encode_fixed<T: Encode>(value: &T, size: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    bincode::encode_into_slice(value, &mut buf, codec())?;
    Ok(buf)
}

pub(crate) fn decode_fixed<T: Decode<()>>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::decode_from_slice(bytes, codec())?;
    Ok(value)
}

/// Byte offset into the backing file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode, Serialize, Deserialize)]
pub struct Address(u64);

impl Address {
    /// Marks "no page", "no chunk" and "not yet written"
    pub const INVALID: Address = Address(u64::MAX);

    pub fn new(offset: u64) -> Self {
        Address(offset)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub fn offset(&self, bytes: u64) -> Address {
        Address(self.0 + bytes)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Locates one element's chunk chain.
///
/// `used` is the logical payload length, `reserved` the payload capacity of
/// the whole chain. A zero-length element has no chain at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ElementHandle {
    pub chunk_address: Address,
    pub used: u64,
    pub reserved: u64,
}

impl ElementHandle {
    pub fn new(chunk_address: Address, used: u64, reserved: u64) -> Self {
        ElementHandle {
            chunk_address,
            used,
            reserved,
        }
    }

    pub fn empty() -> Self {
        ElementHandle::new(Address::INVALID, 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }
}

impl Default for ElementHandle {
    fn default() -> Self {
        ElementHandle::empty()
    }
}

/// Header written in front of each chunk's payload.
///
/// `reserved` is the full size of the allocated chunk including this header,
/// so freeing a chain never needs the allocator's help to find chunk sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct ChunkLink {
    pub next: Address,
    /// Payload bytes stored in this chunk
    pub used: u64,
    pub reserved: u64,
    /// Last link holding payload
    pub terminal: bool,
}

impl ChunkLink {
    pub fn payload_capacity(&self) -> u64 {
        self.reserved.saturating_sub(LINK_HEADER_SIZE)
    }
}

/// Root record at offset 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub magic: u32,
    pub version: u32,
    /// Page capacity the file was created with
    pub max_elements_per_page: u64,
    /// Live element count
    pub count: u64,
    /// Sum of payload lengths of all live elements
    pub total_used_bytes: u64,
    /// Info address of the first index page
    pub root_address: Address,
    /// Allocator snapshot, INVALID while the in-memory state is ahead of disk
    pub free_list_root: Address,
}

impl Header {
    pub fn new(max_elements_per_page: u64) -> Self {
        Header {
            magic: HEADER_MAGIC,
            version: FORMAT_VERSION,
            max_elements_per_page,
            count: 0,
            total_used_bytes: 0,
            root_address: Address::INVALID,
            free_list_root: Address::INVALID,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != HEADER_MAGIC {
            return Err(Error::Format(format!("Invalid header magic {:#x}", self.magic)));
        }
        if self.version > FORMAT_VERSION {
            return Err(Error::Format(format!(
                "Unsupported format version {} (supported up to {})",
                self.version, FORMAT_VERSION
            )));
        }
        if !(2..=MAX_ELEMENTS_PER_PAGE).contains(&self.max_elements_per_page) {
            return Err(Error::Format(format!(
                "Invalid page capacity {}",
                self.max_elements_per_page
            )));
        }
        if !self.root_address.is_valid() {
            return Err(Error::Format("Header has no root page".to_string()));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        encode_fixed(self, HEADER_SIZE)
    }

    /// Decode the header at offset 0 of `disk` without validating it
    pub fn read(disk: &Disk) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE as usize];
        disk.read_at(0, &mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        decode_fixed(bytes)
    }
}
