#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use largearray::{Config, LargeArray};
use tempfile::TempDir;

/// TestArray manages an isolated array file for integration testing
pub struct TestArray {
    dir: TempDir,
    config: Config,
    array: Option<LargeArray>,
}

impl TestArray {
    /// Fresh array with small allocations so chains and pages stay cheap
    pub fn new(max_elements_per_page: u64) -> Self {
        let config = Config::new()
            .with_max_elements_per_page(max_elements_per_page)
            .with_min_allocation_size(64);
        Self::with_config(config)
    }

    pub fn with_config(config: Config) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let array = LargeArray::open_with_config(dir.path().join("data.la"), config.clone())
            .expect("failed to create array");
        TestArray {
            dir,
            config,
            array: Some(array),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().join("data.la")
    }

    pub fn array(&mut self) -> &mut LargeArray {
        self.array.as_mut().expect("array is closed")
    }

    /// Close the array cleanly and open it again from the same file
    pub fn reopen(&mut self) {
        if let Some(array) = self.array.take() {
            array.close().expect("close failed");
        }
        let array = LargeArray::open_with_config(self.path(), self.config.clone()).expect("reopen failed");
        self.array = Some(array);
    }

    /// Drop the array without syncing, as if the process died
    pub fn crash(&mut self) {
        if let Some(array) = self.array.take() {
            std::mem::forget(array);
        }
    }

    pub fn file_len(&self) -> u64 {
        fs::metadata(self.path()).expect("missing array file").len()
    }

    /// Every element in order
    pub fn contents(&mut self) -> Vec<Vec<u8>> {
        self.array()
            .iter()
            .collect::<largearray::Result<Vec<_>>>()
            .expect("iteration failed")
    }

    pub fn page_counts(&mut self) -> Vec<u64> {
        self.array()
            .page_chain_info()
            .expect("page chain walk failed")
            .iter()
            .map(|info| info.count)
            .collect()
    }
}

/// `len` bytes all equal to `tag`
pub fn blob(tag: u8, len: usize) -> Vec<u8> {
    vec![tag; len]
}
