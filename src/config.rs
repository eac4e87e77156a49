use std::io;

/// An error constructing a table.
///
/// Steady-state outcomes (an absent key, a full cloud) are reported through
/// `bool`/`Option` returns, not through this type; `Error` only covers
/// failures to set a table up in the first place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Mapping the backing memory for a table failed.
    #[error("failed to map table memory")]
    Io(#[from] io::Error),

    /// The requested capacity cannot be represented.
    #[error("table capacity overflow: {requested} entries")]
    Capacity { requested: usize },
}

/// Population policy for the anonymous maps backing a table.
///
/// Front tables fault all their pages in up front; resize targets are mapped
/// lazily so allocating the next table does not stall the thread that
/// happened to win the resize race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Populate {
    Eager,
    Lazy,
}

/// Per-table configuration.
///
/// Every hash seed a table uses is carried here explicitly, so two tables
/// built from the same `Config` hash identically. [`Config::with_capacity`]
/// draws fresh random seeds; tests that want reproducible layouts construct
/// the seeds by hand.
#[derive(Debug, Clone)]
pub struct Config {
    /// The number of entries the table is expected to hold.
    pub capacity: usize,

    /// Slots per bin, at most 127 (in-bin indices are 7 bits).
    pub bin_size: u8,

    /// Seed for the invertible quotient mix and partition routing.
    pub seed: u64,

    /// Independent seeds for the two candidate-bin hashes.
    pub bin_seeds: [u64; 2],

    /// Seed for one-byte fingerprints.
    pub fingerprint_seed: u64,

    /// Partition count for [`PartitionedTable`](crate::PartitionedTable),
    /// rounded up to a power of two.
    pub parts: usize,

    /// Occupancy fraction at which a partition grows.
    pub grow_threshold: f64,

    /// Population policy for the initial backing maps.
    pub populate: Populate,
}

impl Config {
    /// A configuration for roughly `capacity` entries, with random seeds.
    pub fn with_capacity(capacity: usize) -> Config {
        Config {
            capacity,
            bin_size: 127,
            seed: rand::random(),
            bin_seeds: [rand::random(), rand::random()],
            fingerprint_seed: rand::random(),
            parts: 8,
            grow_threshold: 0.75,
            populate: Populate::Eager,
        }
    }

    /// Same configuration with the given partition count.
    pub fn parts(mut self, parts: usize) -> Config {
        self.parts = parts;
        self
    }

    /// Same configuration with the given bin size.
    ///
    /// # Panics
    ///
    /// Panics if `bin_size` is zero or greater than 127.
    pub fn bin_size(mut self, bin_size: u8) -> Config {
        assert!(
            (1..=127).contains(&bin_size),
            "bin size must be in 1..=127"
        );
        self.bin_size = bin_size;
        self
    }
}
