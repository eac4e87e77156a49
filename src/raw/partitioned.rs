use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::{hint, ptr};

use atomic_wait::{wait, wake_all};
use log::debug;
use seize::{reclaim, Collector, Guard, Linked};

use crate::config::{Config, Error, Populate};
use crate::raw::bush::SkulkerTable;
use crate::raw::chained::ConcurrentChainedTable;
use crate::raw::cloud::CloudTable;
use crate::raw::hash;
use crate::raw::utils::CachePadded;
use crate::raw::{Placed, Stats};

/// Buckets migrated per claimed stride.
const STRIDE: usize = 1024;

/// Marker value for a handle not inside any partition.
const IDLE: usize = usize::MAX;

/// Maximum simultaneously live handles per table.
const MAX_HANDLES: usize = 512;

/// How far a handle's local insert-minus-free delta may drift before it
/// is flushed to the partition's shared counter.
const FLUSH_DELTA: i32 = 64;

// Resize status values. The status doubles as the futex word threads park
// on while waiting out a migration.
const STABLE: u32 = 0;
const RESIZING: u32 = 1;

/// A table design the partitioned wrapper can shard and grow online.
pub trait Shard: Send + Sync + Sized {
    /// Builds a shard expected to hold `capacity` entries.
    fn with_capacity(capacity: usize, cfg: &Config, populate: Populate) -> Result<Self, Error>;

    fn insert(&self, key: u64, value: u64) -> Placed;

    /// Infallible insert, used only while migrating into a fresh shard.
    fn force_insert(&self, key: u64, value: u64);

    fn get(&self, key: u64) -> Option<u64>;

    fn update(&self, key: u64, value: u64) -> bool;

    fn remove(&self, key: u64) -> bool;

    /// Entries this shard can hold; the resize threshold applies to it.
    fn capacity(&self) -> usize;

    fn stats(&self) -> Stats;

    /// The capacity to request for this shard's doubled replacement.
    fn grow_capacity(&self) -> usize;

    /// Number of migration strides covering this shard.
    fn stride_count(&self) -> usize;

    /// Re-inserts every live entry of `stride` into `dst`. The resize
    /// protocol guarantees no concurrent mutation of `self`.
    fn migrate_stride(&self, stride: usize, dst: &Self);
}

impl Shard for ConcurrentChainedTable {
    fn with_capacity(capacity: usize, cfg: &Config, populate: Populate) -> Result<Self, Error> {
        ConcurrentChainedTable::with_capacity(capacity, cfg, populate)
    }

    fn insert(&self, key: u64, value: u64) -> Placed {
        self.place(key, value)
    }

    fn force_insert(&self, key: u64, value: u64) {
        self.place(key, value);
    }

    fn get(&self, key: u64) -> Option<u64> {
        self.get(key)
    }

    fn update(&self, key: u64, value: u64) -> bool {
        self.update(key, value)
    }

    fn remove(&self, key: u64) -> bool {
        self.remove(key)
    }

    fn capacity(&self) -> usize {
        self.buckets()
    }

    fn stats(&self) -> Stats {
        self.stats()
    }

    fn grow_capacity(&self) -> usize {
        self.buckets() * 2
    }

    fn stride_count(&self) -> usize {
        self.buckets().div_ceil(STRIDE)
    }

    fn migrate_stride(&self, stride: usize, dst: &Self) {
        let start = stride * STRIDE;
        let end = (start + STRIDE).min(self.buckets());
        self.for_each_in(start..end, |key, value| dst.force_insert(key, value));
    }
}

impl Shard for CloudTable {
    fn with_capacity(capacity: usize, cfg: &Config, populate: Populate) -> Result<Self, Error> {
        CloudTable::with_capacity(capacity, cfg, populate)
    }

    fn insert(&self, key: u64, value: u64) -> Placed {
        self.insert(key, value)
    }

    fn force_insert(&self, key: u64, value: u64) {
        self.force_insert(key, value)
    }

    fn get(&self, key: u64) -> Option<u64> {
        self.get(key)
    }

    fn update(&self, key: u64, value: u64) -> bool {
        self.update(key, value)
    }

    fn remove(&self, key: u64) -> bool {
        self.remove(key)
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }

    fn stats(&self) -> Stats {
        self.stats()
    }

    fn grow_capacity(&self) -> usize {
        // capacity() is already 2x the nominal construction capacity, so
        // requesting it doubles the cloud count
        self.capacity()
    }

    // one extra stride drains the overflow map
    fn stride_count(&self) -> usize {
        self.clouds().div_ceil(STRIDE) + 1
    }

    fn migrate_stride(&self, stride: usize, dst: &Self) {
        let start = stride * STRIDE;
        if start >= self.clouds() {
            self.for_each_overflow(|key, value| dst.force_insert(key, value));
        } else {
            let end = (start + STRIDE).min(self.clouds());
            self.for_each_in(start..end, |key, value| dst.force_insert(key, value));
        }
    }
}

impl Shard for SkulkerTable {
    fn with_capacity(capacity: usize, cfg: &Config, populate: Populate) -> Result<Self, Error> {
        SkulkerTable::with_capacity(capacity, cfg, populate)
    }

    fn insert(&self, key: u64, value: u64) -> Placed {
        self.insert(key, value)
    }

    fn force_insert(&self, key: u64, value: u64) {
        self.force_insert(key, value)
    }

    fn get(&self, key: u64) -> Option<u64> {
        self.get(key)
    }

    fn update(&self, key: u64, value: u64) -> bool {
        self.update(key, value)
    }

    fn remove(&self, key: u64) -> bool {
        self.remove(key)
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }

    fn stats(&self) -> Stats {
        self.stats()
    }

    fn grow_capacity(&self) -> usize {
        self.bushes() * 12
    }

    fn stride_count(&self) -> usize {
        self.bushes().div_ceil(STRIDE) + 1
    }

    fn migrate_stride(&self, stride: usize, dst: &Self) {
        let start = stride * STRIDE;
        if start >= self.bushes() {
            self.for_each_overflow(|key, value| dst.force_insert(key, value));
        } else {
            let end = (start + STRIDE).min(self.bushes());
            self.for_each_in(start..end, |key, value| dst.force_insert(key, value));
        }
    }
}

/// Per-partition resize coordination: the explicit `{Stable, Resizing}`
/// state machine.
///
/// The winner of the status CAS allocates the next shard and publishes it;
/// every thread that touches the partition afterwards claims strides from
/// `claim` until `completed` reaches `total`, at which point the last
/// finisher promotes the new shard.
struct ResizeState<T> {
    status: AtomicU32,
    next: AtomicPtr<Linked<T>>,
    claim: AtomicUsize,
    completed: AtomicUsize,
    total: AtomicUsize,
}

impl<T> Default for ResizeState<T> {
    fn default() -> ResizeState<T> {
        ResizeState {
            status: AtomicU32::new(STABLE),
            next: AtomicPtr::new(ptr::null_mut()),
            claim: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }
}

struct Partition<T> {
    table: AtomicPtr<Linked<T>>,
    count: AtomicIsize,
    resize: ResizeState<T>,
}

/// Per-handle "current partition" markers.
///
/// An operation publishes the partition it is about to touch; a resize
/// winner waits for every marker to leave the partition before migration
/// starts, so no in-flight write can land in an already-copied stride.
struct Markers {
    slots: Box<[CachePadded<AtomicUsize>]>,
    free: Mutex<Vec<usize>>,
}

impl Markers {
    fn new() -> Markers {
        Markers {
            slots: (0..MAX_HANDLES)
                .map(|_| CachePadded::from(AtomicUsize::new(IDLE)))
                .collect(),
            free: Mutex::new((0..MAX_HANDLES).rev().collect()),
        }
    }

    fn register(&self) -> usize {
        self.free
            .lock()
            .unwrap()
            .pop()
            .expect("too many live table handles")
    }

    fn release(&self, slot: usize) {
        self.slots[slot].value.store(IDLE, Ordering::SeqCst);
        self.free.lock().unwrap().push(slot);
    }

    fn wait_clear(&self, partition: usize) {
        for slot in self.slots.iter() {
            while slot.value.load(Ordering::SeqCst) == partition {
                hint::spin_loop();
            }
        }
    }
}

/// Shards a table design across independent partitions and grows each
/// partition online.
///
/// Keys route to a partition by a seeded multiplicative hash. All
/// operations go through a per-thread [`Handle`], which buffers occupancy
/// deltas and carries the marker slot the resize protocol synchronizes
/// on. When a partition's estimated occupancy crosses the configured
/// threshold (or a fixed-capacity shard rejects an insert), exactly one
/// thread becomes the resizer; everyone else arriving at that partition
/// helps migrate strides until the copy finishes, then proceeds against
/// the new shard. Replaced shards are retired through the collector and
/// freed once no operation can still reach them.
pub struct PartitionedTable<T: Shard> {
    collector: Collector,
    parts: Box<[CachePadded<Partition<T>>]>,
    mask: usize,
    seed: u64,
    grow_threshold: f64,
    markers: Markers,
    cfg: Config,
}

impl<T: Shard> PartitionedTable<T> {
    pub fn with_config(cfg: Config) -> Result<PartitionedTable<T>, Error> {
        let part_num = cfg.parts.max(1).next_power_of_two();
        let per_part = (cfg.capacity / part_num).max(8);

        // build the shards first so a failure mid-way drops cleanly
        let shards = (0..part_num)
            .map(|_| T::with_capacity(per_part, &cfg, cfg.populate))
            .collect::<Result<Vec<_>, _>>()?;

        let collector = Collector::new().epoch_frequency(None);
        let parts = shards
            .into_iter()
            .map(|shard| {
                CachePadded::from(Partition {
                    table: AtomicPtr::new(collector.link_boxed(shard)),
                    count: AtomicIsize::new(0),
                    resize: ResizeState::default(),
                })
            })
            .collect();

        Ok(PartitionedTable {
            collector,
            parts,
            mask: part_num - 1,
            seed: cfg.seed,
            grow_threshold: cfg.grow_threshold,
            markers: Markers::new(),
            cfg,
        })
    }

    /// Acquires per-thread state for operating on the table.
    ///
    /// # Panics
    ///
    /// Panics if more than 512 handles are simultaneously live.
    pub fn handle(&self) -> Handle<'_, T> {
        Handle {
            slot: self.markers.register(),
            deltas: vec![0_i32; self.parts.len()].into_boxed_slice(),
            table: self,
        }
    }

    /// The number of partitions.
    pub fn partitions(&self) -> usize {
        self.parts.len()
    }

    /// Best-effort entry count (unflushed handle deltas are not included).
    pub fn len(&self) -> usize {
        self.parts
            .iter()
            .map(|p| p.value.count.load(Ordering::Relaxed))
            .sum::<isize>()
            .try_into()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current capacity of one partition's shard.
    pub fn shard_capacity(&self, partition: usize) -> usize {
        let guard = self.collector.enter();
        let raw = guard.protect(&self.parts[partition].value.table, Ordering::Acquire);
        unsafe { (*raw).value.capacity() }
    }

    /// Total capacity across all partitions.
    pub fn capacity(&self) -> usize {
        (0..self.parts.len()).map(|p| self.shard_capacity(p)).sum()
    }

    pub fn stats(&self) -> Stats {
        let guard = self.collector.enter();
        let mut total = Stats::default();
        for part in self.parts.iter() {
            let raw = guard.protect(&part.value.table, Ordering::Acquire);
            let stats = unsafe { (*raw).value.stats() };
            total.entries += stats.entries;
            total.capacity += stats.capacity;
            total.overflow += stats.overflow;
        }
        total
    }
}

impl<T: Shard> Drop for PartitionedTable<T> {
    fn drop(&mut self) {
        // handles borrow the table, so no operation or resize is in
        // flight; retired shards are released by the collector
        for part in self.parts.iter() {
            let raw = part.value.table.load(Ordering::Relaxed);
            if !raw.is_null() {
                drop(unsafe { Box::from_raw(raw) });
            }
            let next = part.value.resize.next.load(Ordering::Relaxed);
            if !next.is_null() {
                drop(unsafe { Box::from_raw(next) });
            }
        }
    }
}

/// Per-thread state for a [`PartitionedTable`].
///
/// Dropping the handle flushes its buffered occupancy deltas and frees its
/// marker slot.
pub struct Handle<'t, T: Shard> {
    table: &'t PartitionedTable<T>,
    slot: usize,
    deltas: Box<[i32]>,
}

impl<T: Shard> Handle<'_, T> {
    #[inline]
    fn marker(&self) -> &AtomicUsize {
        &self.table.markers.slots[self.slot].value
    }

    /// Publishes intent to operate on `partition`, then runs `op` against
    /// its shard under a collector guard.
    ///
    /// Returns `None` (with the marker cleared) if the partition is
    /// mid-resize; the caller must help and retry. The marker store and
    /// status load are both sequentially consistent, pairing with the
    /// resizer's status-store / marker-scan: either this operation sees
    /// the resize, or the resizer waits for its marker.
    #[inline]
    fn try_run<R>(&self, partition: usize, op: impl FnOnce(&T) -> R) -> Option<R> {
        let part = &self.table.parts[partition].value;

        self.marker().store(partition, Ordering::SeqCst);

        if part.resize.status.load(Ordering::SeqCst) == RESIZING {
            self.marker().store(IDLE, Ordering::SeqCst);
            return None;
        }

        let guard = self.table.collector.enter();
        let raw = guard.protect(&part.table, Ordering::Acquire);
        let result = op(unsafe { &(*raw).value });

        self.marker().store(IDLE, Ordering::Release);
        Some(result)
    }

    /// Inserts or overwrites `key`, growing the partition when the shard
    /// is out of room or past the occupancy threshold.
    pub fn insert(&mut self, key: u64, value: u64) -> bool {
        let partition = hash::route(key, self.table.seed, self.table.mask);

        loop {
            let Some((outcome, capacity)) =
                self.try_run(partition, |shard| (shard.insert(key, value), shard.capacity()))
            else {
                self.help(partition);
                continue;
            };

            match outcome {
                Placed::Full => self.grow(partition, capacity),
                Placed::Inserted => {
                    self.record(partition, 1);
                    let threshold = (capacity as f64 * self.table.grow_threshold) as isize;
                    if self.estimate(partition) >= threshold {
                        self.grow(partition, capacity);
                    }
                    return true;
                }
                Placed::Updated => return true,
            }
        }
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        let partition = hash::route(key, self.table.seed, self.table.mask);

        loop {
            match self.try_run(partition, |shard| shard.get(key)) {
                Some(value) => return value,
                None => self.help(partition),
            }
        }
    }

    /// Replaces the value for `key`, returning `false` if it is absent.
    pub fn update(&self, key: u64, value: u64) -> bool {
        let partition = hash::route(key, self.table.seed, self.table.mask);

        loop {
            match self.try_run(partition, |shard| shard.update(key, value)) {
                Some(updated) => return updated,
                None => self.help(partition),
            }
        }
    }

    /// Removes `key`. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: u64) -> bool {
        let partition = hash::route(key, self.table.seed, self.table.mask);

        loop {
            match self.try_run(partition, |shard| shard.remove(key)) {
                Some(removed) => {
                    if removed {
                        self.record(partition, -1);
                    }
                    return removed;
                }
                None => self.help(partition),
            }
        }
    }

    #[inline]
    fn record(&mut self, partition: usize, delta: i32) {
        self.deltas[partition] += delta;
        if self.deltas[partition].abs() >= FLUSH_DELTA {
            self.flush(partition);
        }
    }

    #[inline]
    fn flush(&mut self, partition: usize) {
        let delta = std::mem::take(&mut self.deltas[partition]);
        if delta != 0 {
            self.table.parts[partition]
                .value
                .count
                .fetch_add(delta as isize, Ordering::Relaxed);
        }
    }

    #[inline]
    fn estimate(&self, partition: usize) -> isize {
        self.table.parts[partition].value.count.load(Ordering::Relaxed)
            + self.deltas[partition] as isize
    }

    /// Starts (or joins) a resize of `partition`.
    ///
    /// `seen_capacity` is the capacity that motivated the grow; if the
    /// shard has already been replaced with a larger one, the request is
    /// stale and becomes a no-op.
    fn grow(&mut self, partition: usize, seen_capacity: usize) {
        let part = &self.table.parts[partition].value;
        let state = &part.resize;

        if state
            .status
            .compare_exchange(STABLE, RESIZING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let guard = self.table.collector.enter();
            let old_raw = guard.protect(&part.table, Ordering::Acquire);
            let old = unsafe { &(*old_raw).value };

            if old.capacity() > seen_capacity {
                // a concurrent resize already grew this partition
                state.status.store(STABLE, Ordering::SeqCst);
                wake_all(&state.status);
            } else {
                debug!(
                    "partition {partition}: growing past {} entries",
                    old.capacity()
                );

                // exclude in-flight operations before any stride is copied
                self.table.markers.wait_clear(partition);

                let next = T::with_capacity(old.grow_capacity(), &self.table.cfg, Populate::Lazy)
                    .expect("failed to allocate resize target");

                state.total.store(old.stride_count(), Ordering::Relaxed);
                state.claim.store(0, Ordering::Relaxed);
                state.completed.store(0, Ordering::Relaxed);
                state
                    .next
                    .store(self.table.collector.link_boxed(next), Ordering::Release);
            }
        }

        self.help(partition);
    }

    /// Claims and migrates strides until the partition's resize finishes.
    ///
    /// Threads that find no stride left to claim park on the status word
    /// instead of spinning on the stragglers.
    fn help(&self, partition: usize) {
        let part = &self.table.parts[partition].value;
        let state = &part.resize;

        loop {
            if state.status.load(Ordering::SeqCst) == STABLE {
                return;
            }

            let next_raw = state.next.load(Ordering::Acquire);
            if next_raw.is_null() {
                // the winner is still allocating or draining markers
                hint::spin_loop();
                continue;
            }

            let total = state.total.load(Ordering::Relaxed);
            if state.claim.load(Ordering::Relaxed) < total {
                let claim = state.claim.fetch_add(1, Ordering::AcqRel);
                if claim < total {
                    // our claim is unfinished, so promotion cannot have
                    // happened yet: the root pointer is still the old shard
                    let guard = self.table.collector.enter();
                    let old_raw = guard.protect(&part.table, Ordering::Acquire);
                    let old = unsafe { &(*old_raw).value };
                    let next = unsafe { &(*next_raw).value };

                    old.migrate_stride(claim, next);

                    let done = state.completed.fetch_add(1, Ordering::AcqRel) + 1;
                    if done == total {
                        self.promote(partition, old_raw, next_raw);
                        return;
                    }
                    continue;
                }
            }

            if state.status.load(Ordering::SeqCst) == RESIZING {
                wait(&state.status, RESIZING);
            }
        }
    }

    /// Swaps the migrated shard in and retires the old one. Runs on
    /// whichever thread completed the final stride.
    fn promote(&self, partition: usize, old_raw: *mut Linked<T>, next_raw: *mut Linked<T>) {
        let part = &self.table.parts[partition].value;

        part.table.store(next_raw, Ordering::SeqCst);
        part.resize.next.store(ptr::null_mut(), Ordering::Relaxed);
        part.resize.status.store(STABLE, Ordering::SeqCst);
        wake_all(&part.resize.status);

        // freed once no operation can still reach it
        unsafe {
            self.table
                .collector
                .retire(old_raw, reclaim::boxed::<Linked<T>>)
        };

        debug!("partition {partition}: resize complete");
    }
}

impl<T: Shard> Drop for Handle<'_, T> {
    fn drop(&mut self) {
        for partition in 0..self.deltas.len() {
            self.flush(partition);
        }
        self.table.markers.release(self.slot);
    }
}
