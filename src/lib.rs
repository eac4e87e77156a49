#![doc = include_str!("../README.md")]

mod config;
mod raw;

pub use config::{Config, Error, Populate};
pub use raw::bins::{DereferenceTable, TinyPtr, NULL_PTR, OVERFLOW_PTR};
pub use raw::bush::SkulkerTable;
pub use raw::chained::{ChainedTable, ConcurrentChainedTable};
pub use raw::cloud::CloudTable;
pub use raw::partitioned::{Handle, PartitionedTable, Shard};
pub use raw::{Placed, Stats};
