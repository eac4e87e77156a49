use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crate::config::{Config, Error, Populate};
use crate::raw::alloc::Arena;
use crate::raw::bins::{DereferenceTable, Entry, TinyPtr, NULL_PTR};
use crate::raw::hash::{self, Quotient};
use crate::raw::utils::{read_consistent, write_seq};
use crate::raw::Stats;

// Safety bound on chain walks. A reader racing a writer can observe a torn
// next pointer and wander; the version re-check discards whatever it
// produced, this just guarantees it stops walking.
const MAX_CHAIN: usize = 1 << 16;

// Base-array buckets covered by one version byte in the concurrent table.
const REGION_BUCKETS: usize = 64;

/// The shared chain machinery: a direct-addressed base array of tiny
/// pointers, one per quotient bucket, with collision chains threaded
/// through the bins.
///
/// Entries store the key *remainder* only; the bucket index supplies the
/// bits the quotient mix masked off. The n-th entry of a bucket's chain is
/// allocated under a key derived from `(bucket, n)`, so a walker can
/// re-derive every bin address from the bucket alone. Chain positions are
/// stable because removal always vacates the tail (compaction-on-free).
struct Chains {
    base: Arena,
    quot: Quotient,
    deref: DereferenceTable,
}

// Overflow entries are named by their chain position. Positions stay well
// below 2^16 outside of adversarial layouts; buckets use the low bits.
#[inline]
fn ow_key(bucket: usize, pos: usize) -> u64 {
    debug_assert!(pos < 1 << 16);
    ((pos as u64) << 48) | bucket as u64
}

#[inline]
fn bin_key(bucket: usize, pos: usize) -> u64 {
    hash::combine(bucket as u64, pos as u64)
}

/// One visited chain entry.
#[derive(Clone, Copy)]
struct Visit {
    pos: usize,
    ptr: TinyPtr,
    entry: Entry,
}

enum Walk {
    /// The remainder was found at this entry.
    Found(Visit),
    /// The chain ended; the last entry (if any) and its length.
    Absent(Option<Visit>, usize),
    /// The walk hit the step bound or a dangling pointer (torn read).
    Inconsistent,
}

impl Chains {
    fn new(capacity: usize, cfg: &Config, populate: Populate) -> Result<Chains, Error> {
        let buckets = capacity.max(2).next_power_of_two();

        Ok(Chains {
            base: Arena::zeroed(buckets, populate)?,
            quot: Quotient::new(buckets, cfg.seed),
            deref: DereferenceTable::new(capacity, cfg.bin_size, cfg.bin_seeds, populate)?,
        })
    }

    #[inline]
    fn buckets(&self) -> usize {
        self.quot.buckets()
    }

    #[inline]
    fn head(&self, bucket: usize) -> &AtomicU8 {
        &self.base.bytes()[bucket]
    }

    #[inline]
    fn entry_at(&self, bucket: usize, pos: usize, ptr: TinyPtr) -> Option<Entry> {
        self.deref.entry(bin_key(bucket, pos), ow_key(bucket, pos), ptr)
    }

    /// Walks the bucket's chain looking for `rem`.
    fn walk(&self, bucket: usize, rem: u64) -> Walk {
        let mut ptr = self.head(bucket).load(Ordering::Acquire);
        let mut pos = 0;
        let mut last = None;

        while ptr != NULL_PTR {
            if pos >= MAX_CHAIN {
                return Walk::Inconsistent;
            }

            let entry = match self.entry_at(bucket, pos, ptr) {
                Some(entry) => entry,
                None => return Walk::Inconsistent,
            };

            let visit = Visit { pos, ptr, entry };
            if entry.key == rem {
                return Walk::Found(visit);
            }

            last = Some(visit);
            ptr = entry.next;
            pos += 1;
        }

        Walk::Absent(last, pos)
    }

    /// Upserts `key`, returning `true` if a new entry was created.
    fn insert(&self, key: u64, value: u64) -> bool {
        let (bucket, rem) = self.quot.split(key);

        match self.walk(bucket, rem) {
            Walk::Found(visit) => {
                self.deref
                    .set_value(bin_key(bucket, visit.pos), ow_key(bucket, visit.pos), visit.ptr, value);
                false
            }
            Walk::Absent(last, len) => {
                let entry = Entry { key: rem, value, next: NULL_PTR };
                let ptr = self
                    .deref
                    .allocate_entry(bin_key(bucket, len), ow_key(bucket, len), entry);

                match last {
                    Some(tail) => self.deref.set_next(
                        bin_key(bucket, tail.pos),
                        ow_key(bucket, tail.pos),
                        tail.ptr,
                        ptr,
                    ),
                    None => self.head(bucket).store(ptr, Ordering::Release),
                }
                true
            }
            // writers are serialized per bucket; they never observe
            // inconsistent chains
            Walk::Inconsistent => unreachable!("torn chain under writer lock"),
        }
    }

    fn query(&self, key: u64) -> Option<u64> {
        let (bucket, rem) = self.quot.split(key);

        match self.walk(bucket, rem) {
            Walk::Found(visit) => Some(visit.entry.value),
            _ => None,
        }
    }

    fn update(&self, key: u64, value: u64) -> bool {
        let (bucket, rem) = self.quot.split(key);

        match self.walk(bucket, rem) {
            Walk::Found(visit) => {
                self.deref
                    .set_value(bin_key(bucket, visit.pos), ow_key(bucket, visit.pos), visit.ptr, value);
                true
            }
            _ => false,
        }
    }

    /// Removes `key`, compacting the chain so no interior hole remains:
    /// the tail entry is copied over the vacated entry and the tail's slot
    /// is the one returned to its bin. Only the tail predecessor's next
    /// pointer is ever rewritten.
    fn free(&self, key: u64) -> bool {
        let (bucket, rem) = self.quot.split(key);

        let target = match self.walk(bucket, rem) {
            Walk::Found(visit) => visit,
            Walk::Absent(..) => return false,
            Walk::Inconsistent => unreachable!("torn chain under writer lock"),
        };

        // find the tail by continuing from the target
        let mut tail = target;
        let mut prev_of_tail = None;
        while tail.entry.next != NULL_PTR {
            let pos = tail.pos + 1;
            let ptr = tail.entry.next;
            let entry = self
                .entry_at(bucket, pos, ptr)
                .expect("dangling chain pointer under writer lock");
            prev_of_tail = Some(tail);
            tail = Visit { pos, ptr, entry };
        }

        if tail.pos == target.pos {
            // the target is the tail: unlink it from its predecessor, which
            // is the base slot for a single-entry chain
            match self.walk_to(bucket, target.pos.checked_sub(1)) {
                Some(prev) => self.deref.set_next(
                    bin_key(bucket, prev.pos),
                    ow_key(bucket, prev.pos),
                    prev.ptr,
                    NULL_PTR,
                ),
                None => self.head(bucket).store(NULL_PTR, Ordering::Release),
            }
        } else {
            // copy the tail over the target, keeping the target's link
            // unless the target itself precedes the tail
            let prev = prev_of_tail.expect("tail beyond target has a predecessor");
            let next = if prev.pos == target.pos { NULL_PTR } else { target.entry.next };

            self.deref.write_entry(
                bin_key(bucket, target.pos),
                ow_key(bucket, target.pos),
                target.ptr,
                Entry { key: tail.entry.key, value: tail.entry.value, next },
            );

            if prev.pos != target.pos {
                self.deref
                    .set_next(bin_key(bucket, prev.pos), ow_key(bucket, prev.pos), prev.ptr, NULL_PTR);
            }
        }

        self.deref
            .free_entry(bin_key(bucket, tail.pos), ow_key(bucket, tail.pos), tail.ptr);
        true
    }

    /// Walks to the entry at `pos`, `None` meaning the base slot.
    fn walk_to(&self, bucket: usize, pos: Option<usize>) -> Option<Visit> {
        let pos = pos?;
        let mut ptr = self.head(bucket).load(Ordering::Acquire);
        let mut at = 0;

        loop {
            debug_assert!(ptr != NULL_PTR);
            let entry = self
                .entry_at(bucket, at, ptr)
                .expect("dangling chain pointer under writer lock");
            if at == pos {
                return Some(Visit { pos, ptr, entry });
            }
            ptr = entry.next;
            at += 1;
        }
    }

    /// Visits every `(key, value)` in the bucket range. The caller holds
    /// exclusive access (migration).
    fn for_each_in(&self, buckets: std::ops::Range<usize>, mut f: impl FnMut(u64, u64)) {
        for bucket in buckets {
            let mut ptr = self.head(bucket).load(Ordering::Acquire);
            let mut pos = 0;
            while ptr != NULL_PTR {
                let entry = self
                    .entry_at(bucket, pos, ptr)
                    .expect("dangling chain pointer during migration");
                f(self.quot.rejoin(bucket, entry.key), entry.value);
                ptr = entry.next;
                pos += 1;
            }
        }
    }
}

/// A sequential chained hash table over quotiented keys and tiny-pointer
/// chains.
///
/// Inserts never fail: allocation escalates to the overflow map before it
/// would refuse an entry.
pub struct ChainedTable {
    chains: Chains,
    len: usize,
}

impl ChainedTable {
    pub fn with_config(cfg: &Config) -> Result<ChainedTable, Error> {
        Ok(ChainedTable {
            chains: Chains::new(cfg.capacity, cfg, cfg.populate)?,
            len: 0,
        })
    }

    /// Inserts or overwrites `key`.
    pub fn insert(&mut self, key: u64, value: u64) -> bool {
        if self.chains.insert(key, value) {
            self.len += 1;
        }
        true
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        self.chains.query(key)
    }

    /// Replaces the value for `key`, returning `false` if it is absent.
    pub fn update(&mut self, key: u64, value: u64) -> bool {
        self.chains.update(key, value)
    }

    /// Removes `key`. Removing an absent key is a no-op.
    pub fn remove(&mut self, key: u64) -> bool {
        let removed = self.chains.free(key);
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.len,
            capacity: self.chains.buckets(),
            overflow: self.chains.deref.overflow().len(),
        }
    }
}

/// The concurrent chained table: lock-free readers via per-region version
/// counters, writers serialized per region.
///
/// Each version byte covers [`REGION_BUCKETS`] base slots. A writer spins
/// the region's version odd, mutates, and bumps it even again; readers
/// snapshot the version, walk, and retry if it moved. Bins are shared
/// across regions, so bin mutation additionally takes the per-bin locks
/// inside the dereference table.
pub struct ConcurrentChainedTable {
    chains: Chains,
    versions: Arena,
    len: AtomicUsize,
}

impl ConcurrentChainedTable {
    pub fn with_config(cfg: &Config) -> Result<ConcurrentChainedTable, Error> {
        Self::with_capacity(cfg.capacity, cfg, cfg.populate)
    }

    pub(crate) fn with_capacity(
        capacity: usize,
        cfg: &Config,
        populate: Populate,
    ) -> Result<ConcurrentChainedTable, Error> {
        let chains = Chains::new(capacity, cfg, populate)?;
        let versions = Arena::zeroed(chains.buckets().div_ceil(REGION_BUCKETS), populate)?;

        Ok(ConcurrentChainedTable { chains, versions, len: AtomicUsize::new(0) })
    }

    #[inline]
    fn version(&self, bucket: usize) -> &AtomicU8 {
        &self.versions.bytes()[bucket / REGION_BUCKETS]
    }

    pub fn insert(&self, key: u64, value: u64) -> bool {
        self.place(key, value);
        true
    }

    pub(crate) fn place(&self, key: u64, value: u64) -> crate::raw::Placed {
        let (bucket, _) = self.chains.quot.split(key);
        let _write = write_seq(self.version(bucket));

        if self.chains.insert(key, value) {
            self.len.fetch_add(1, Ordering::Relaxed);
            crate::raw::Placed::Inserted
        } else {
            crate::raw::Placed::Updated
        }
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        let (bucket, _) = self.chains.quot.split(key);
        read_consistent(self.version(bucket), || self.chains.query(key))
    }

    pub fn update(&self, key: u64, value: u64) -> bool {
        let (bucket, _) = self.chains.quot.split(key);
        let _write = write_seq(self.version(bucket));
        self.chains.update(key, value)
    }

    pub fn remove(&self, key: u64) -> bool {
        let (bucket, _) = self.chains.quot.split(key);
        let _write = write_seq(self.version(bucket));

        let removed = self.chains.free(key);
        if removed {
            self.len.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.len(),
            capacity: self.chains.buckets(),
            overflow: self.chains.deref.overflow().len(),
        }
    }

    pub(crate) fn buckets(&self) -> usize {
        self.chains.buckets()
    }

    pub(crate) fn for_each_in(&self, buckets: std::ops::Range<usize>, f: impl FnMut(u64, u64)) {
        self.chains.for_each_in(buckets, f)
    }
}
