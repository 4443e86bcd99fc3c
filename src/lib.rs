//! A persistent array of variable-length byte blobs kept in a single file.
//!
//! ```no_run
//! use largearray::LargeArray;
//!
//! let mut array = LargeArray::open("blobs.la")?;
//! array.append(b"first")?;
//! array.insert(0, b"zeroth")?;
//! assert_eq!(array.get(1)?, b"first");
//! array.close()?;
//! # Ok::<(), largearray::Error>(())
//! ```

pub mod array;
pub mod config;
pub mod error;
pub mod storage;

pub use array::{Inspection, Iter, LargeArray};
pub use config::{Config, RebalanceThreshold};
pub use error::{Error, Result};
pub use storage::CacheStats;
pub use storage::allocator::{CompactionStrategy, TrimTail};
pub use storage::base::{Address, ElementHandle};
pub use storage::index::page::PageInfo;
