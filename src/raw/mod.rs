pub(crate) mod alloc;
pub(crate) mod bins;
pub(crate) mod bush;
pub(crate) mod chained;
pub(crate) mod cloud;
pub(crate) mod hash;
pub(crate) mod partitioned;
pub(crate) mod utils;

/// The outcome of an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placed {
    /// A new entry was created.
    Inserted,

    /// The key existed and its value was overwritten.
    Updated,

    /// The table cannot take another entry; the caller must grow it.
    Full,
}

/// A point-in-time snapshot of a table's storage.
///
/// Counts are exact for sequential tables and best-effort under concurrent
/// mutation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Live entries.
    pub entries: usize,

    /// Entries the table can hold before it must grow.
    pub capacity: usize,

    /// Entries that escalated past the bins into the overflow map.
    pub overflow: usize,
}
