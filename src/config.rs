use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::base::{LINK_HEADER_SIZE, MAX_ELEMENTS_PER_PAGE};

pub const DEFAULT_MAX_ELEMENTS_PER_PAGE: u64 = 32;
pub const DEFAULT_MIN_ALLOCATION_SIZE: u64 = 512;
pub const DEFAULT_MAX_CHUNK_SIZE: u64 = 1024 * 1024;

const MIN_PAGE_CACHE_CAPACITY: usize = 8;
const MAX_PAGE_CACHE_CAPACITY: usize = 256;

/// How much spare room the next page must have before a full page pushes
/// handles into it instead of splitting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RebalanceThreshold {
    /// `max_count / 2`, rounded down
    #[default]
    HalfFloor,
    /// `max_count / 2`, rounded up
    HalfCeil,
}

impl RebalanceThreshold {
    pub fn min_free(&self, max_count: u64) -> u64 {
        match self {
            RebalanceThreshold::HalfFloor => max_count / 2,
            RebalanceThreshold::HalfCeil => max_count.div_ceil(2),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub(crate) max_elements_per_page: u64,
    pub(crate) min_allocation_size: u64,
    pub(crate) max_chunk_size: u64,
    pub(crate) capacity_hint: u64,
    pub(crate) page_cache_capacity: Option<usize>,
    pub(crate) write_back_threshold: Option<u32>,
    pub(crate) rebalance_threshold: RebalanceThreshold,
    pub(crate) max_file_size: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_elements_per_page: DEFAULT_MAX_ELEMENTS_PER_PAGE,
            min_allocation_size: DEFAULT_MIN_ALLOCATION_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            capacity_hint: 0,
            page_cache_capacity: None,
            write_back_threshold: None,
            rebalance_threshold: RebalanceThreshold::default(),
            max_file_size: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_elements_per_page(mut self, max: u64) -> Self {
        self.max_elements_per_page = max;
        self
    }

    pub fn with_min_allocation_size(mut self, size: u64) -> Self {
        self.min_allocation_size = size;
        self
    }

    pub fn with_max_chunk_size(mut self, size: u64) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_capacity_hint(mut self, elements: u64) -> Self {
        self.capacity_hint = elements;
        self
    }

    pub fn with_page_cache_capacity(mut self, pages: usize) -> Self {
        self.page_cache_capacity = Some(pages);
        self
    }

    /// Write a cached page back once it has accumulated this many changes.
    pub fn with_write_back_threshold(mut self, changes: u32) -> Self {
        self.write_back_threshold = Some(changes);
        self
    }

    pub fn with_rebalance_threshold(mut self, threshold: RebalanceThreshold) -> Self {
        self.rebalance_threshold = threshold;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = Some(bytes);
        self
    }

    pub fn max_elements_per_page(&self) -> u64 {
        self.max_elements_per_page
    }

    pub fn min_allocation_size(&self) -> u64 {
        self.min_allocation_size
    }

    pub fn max_chunk_size(&self) -> u64 {
        self.max_chunk_size
    }

    pub fn rebalance_threshold(&self) -> RebalanceThreshold {
        self.rebalance_threshold
    }

    /// Number of page slots the cache gets. An explicit capacity wins,
    /// otherwise enough pages to keep `capacity_hint` elements resident.
    pub fn effective_page_cache_capacity(&self) -> usize {
        if let Some(pages) = self.page_cache_capacity {
            return pages;
        }
        let per_page = self.max_elements_per_page.max(1);
        let pages = self.capacity_hint.div_ceil(per_page) as usize;
        pages.clamp(MIN_PAGE_CACHE_CAPACITY, MAX_PAGE_CACHE_CAPACITY)
    }

    pub fn validate(&self) -> Result<()> {
        if !(2..=MAX_ELEMENTS_PER_PAGE).contains(&self.max_elements_per_page) {
            return Err(Error::Config(format!(
                "max_elements_per_page must be between 2 and {}, got {}",
                MAX_ELEMENTS_PER_PAGE, self.max_elements_per_page
            )));
        }
        if self.max_chunk_size <= LINK_HEADER_SIZE {
            return Err(Error::Config(format!(
                "max_chunk_size must exceed the {} byte link header, got {}",
                LINK_HEADER_SIZE, self.max_chunk_size
            )));
        }
        if self.min_allocation_size > self.max_chunk_size {
            return Err(Error::Config(format!(
                "min_allocation_size {} exceeds max_chunk_size {}",
                self.min_allocation_size, self.max_chunk_size
            )));
        }
        if self.page_cache_capacity == Some(0) {
            return Err(Error::Config("page cache needs at least one slot".to_string()));
        }
        if self.write_back_threshold == Some(0) {
            return Err(Error::Config("write_back_threshold must be positive".to_string()));
        }
        Ok(())
    }
}
