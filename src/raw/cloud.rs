use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::config::{Config, Error, Populate};
use crate::raw::alloc::Arena;
use crate::raw::bins::{DereferenceTable, Entry, NULL_PTR, OVERFLOW_PTR};
use crate::raw::hash::{self, Quotient};
use crate::raw::utils::simd;
use crate::raw::utils::{read_consistent, write_seq};
use crate::raw::{Placed, Stats};

// One cloud is a self-contained 64-byte unit: eight 64-bit words.
//
//   word 0   control byte | version byte | six unused bytes
//   word 1   eight fingerprint lanes
//   words 2..8   storage, shared between crystals and bolts
//
// Crystals (inline remainder/value pairs) fill the storage from the front,
// two words each: crystal i lives in words 2+2i and 3+2i. Bolt tiny
// pointers are byte lanes of word 7, filled from lane 7 downward, so a
// third crystal (which needs word 7) and bolts are mutually exclusive.
//
// Fingerprint lanes mirror the storage: crystal i owns lane i, and the
// bolt whose pointer sits in lane l of word 7 owns fingerprint lane l.
// One masked SWAR compare of word 1 therefore covers every occupied
// fingerprint.
//
// Word 0 is only ever accessed byte-wide and words 1..8 only word-wide;
// no location is shared between access widths.
//
// Byte 2 of word 0 counts *spilled* entries: residents of the overflow map
// with no fingerprint lane at all. Ordinary inserts never spill (a full
// cloud rejects them); only resize migration does, since a migrated entry
// has nowhere else to go.
const CLOUD_WORDS: usize = 8;
const LANES: usize = 8;
const MAX_CRYSTALS: usize = 3;

#[inline]
fn counts(ctrl: u8) -> (usize, usize) {
    ((ctrl & 0x0f) as usize, (ctrl >> 4) as usize)
}

#[inline]
fn pack(crystals: usize, bolts: usize) -> u8 {
    (crystals as u8) | ((bolts as u8) << 4)
}

// A reader can observe a torn control byte; anything outside the reachable
// states is discarded by the version re-check.
#[inline]
fn valid(crystals: usize, bolts: usize) -> bool {
    crystals <= MAX_CRYSTALS
        && crystals + bolts <= LANES
        && (crystals < MAX_CRYSTALS || bolts == 0)
}

#[inline]
fn bin_key(cloud: usize, fp: u8) -> u64 {
    hash::combine(cloud as u64, fp as u64)
}

/// A concurrent hash table of fixed 64-byte clouds.
///
/// Each quotient id maps to one cloud holding up to three inline *crystals*
/// and up to eight *bolt* tiny pointers into the bin table, with one-byte
/// fingerprints scanned by a single masked byte-compare. Mutations hold the
/// cloud's version byte odd (writers are mutually exclusive per cloud
/// only); readers are lock-free and validate against the version.
///
/// Unlike the chained designs, a cloud can legitimately reject an insert
/// once all its fingerprint lanes are occupied; callers pair this table
/// with [`PartitionedTable`](crate::PartitionedTable) to grow past that.
pub struct CloudTable {
    arena: Arena,
    quot: Quotient,
    deref: DereferenceTable,
    fp_seed: u64,
    len: AtomicUsize,
}

impl CloudTable {
    pub fn with_config(cfg: &Config) -> Result<CloudTable, Error> {
        Self::with_capacity(cfg.capacity, cfg, cfg.populate)
    }

    pub(crate) fn with_capacity(
        capacity: usize,
        cfg: &Config,
        populate: Populate,
    ) -> Result<CloudTable, Error> {
        let clouds = (capacity / 4).max(2).next_power_of_two();
        let bytes = clouds
            .checked_mul(CLOUD_WORDS * 8)
            .ok_or(Error::Capacity { requested: capacity })?;

        Ok(CloudTable {
            arena: Arena::zeroed(bytes, populate)?,
            quot: Quotient::new(clouds, cfg.seed),
            deref: DereferenceTable::new(capacity, cfg.bin_size, cfg.bin_seeds, populate)?,
            fp_seed: cfg.fingerprint_seed,
            len: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn ctrl(&self, cloud: usize) -> &AtomicU8 {
        &self.arena.bytes()[cloud * CLOUD_WORDS * 8]
    }

    #[inline]
    fn version(&self, cloud: usize) -> &AtomicU8 {
        &self.arena.bytes()[cloud * CLOUD_WORDS * 8 + 1]
    }

    #[inline]
    fn spill(&self, cloud: usize) -> &AtomicU8 {
        &self.arena.bytes()[cloud * CLOUD_WORDS * 8 + 2]
    }

    #[inline]
    fn word(&self, cloud: usize, w: usize) -> &AtomicU64 {
        debug_assert!((1..CLOUD_WORDS).contains(&w));
        &self.arena.words()[cloud * CLOUD_WORDS + w]
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        let (cloud, rem) = self.quot.split(key);
        let fp = hash::fingerprint(rem, self.fp_seed);

        read_consistent(self.version(cloud), || self.scan(cloud, rem, fp))
    }

    /// One pass over the cloud's fingerprint lanes.
    ///
    /// Fingerprints may collide, so a lane hit is authoritative only after
    /// the full remainder comparison.
    fn scan(&self, cloud: usize, rem: u64, fp: u8) -> Option<u64> {
        let (crystals, bolts) = counts(self.ctrl(cloud).load(Ordering::Relaxed));
        if !valid(crystals, bolts) {
            return None;
        }

        let fps = self.word(cloud, 1).load(Ordering::Relaxed);
        let ptrs = self.word(cloud, 7).load(Ordering::Relaxed);

        for lane in simd::match_byte(fps, fp) {
            if lane < crystals {
                if self.word(cloud, 2 + 2 * lane).load(Ordering::Relaxed) == rem {
                    return Some(self.word(cloud, 3 + 2 * lane).load(Ordering::Relaxed));
                }
            } else if lane >= LANES - bolts {
                let ptr = simd::lane(ptrs, lane);
                if ptr == NULL_PTR {
                    continue;
                }
                if ptr == OVERFLOW_PTR {
                    let m = self.quot.remix(cloud, rem);
                    if let Some(entry) = self.deref.overflow().get(m) {
                        debug_assert_eq!(entry.key, rem);
                        return Some(entry.value);
                    }
                } else if let Some(entry) = self.deref.bins().entry(bin_key(cloud, fp), ptr) {
                    if entry.key == rem {
                        return Some(entry.value);
                    }
                }
            }
        }

        if self.spill(cloud).load(Ordering::Relaxed) > 0 {
            let m = self.quot.remix(cloud, rem);
            if let Some(entry) = self.deref.overflow().get(m) {
                debug_assert_eq!(entry.key, rem);
                return Some(entry.value);
            }
        }

        None
    }

    /// Inserts or overwrites `key`.
    ///
    /// Returns [`Placed::Full`] when the cloud cannot take another entry
    /// even after rebalancing a crystal into a bolt; the caller must grow
    /// the table.
    pub fn insert(&self, key: u64, value: u64) -> Placed {
        self.place(key, value, false)
    }

    /// Migration-only insert that spills to the overflow map instead of
    /// failing when the cloud is full.
    pub(crate) fn force_insert(&self, key: u64, value: u64) {
        let placed = self.place(key, value, true);
        debug_assert!(!matches!(placed, Placed::Full));
    }

    fn place(&self, key: u64, value: u64, force: bool) -> Placed {
        let (cloud, rem) = self.quot.split(key);
        let fp = hash::fingerprint(rem, self.fp_seed);

        let _write = write_seq(self.version(cloud));

        if self.write_existing(cloud, rem, fp, value) {
            return Placed::Updated;
        }

        for attempt in 0..2 {
            let (crystals, bolts) = counts(self.ctrl(cloud).load(Ordering::Relaxed));

            // a third crystal would claim word 7, so it requires no bolts
            if crystals < MAX_CRYSTALS
                && crystals + bolts < LANES
                && (crystals < MAX_CRYSTALS - 1 || bolts == 0)
            {
                self.word(cloud, 2 + 2 * crystals).store(rem, Ordering::Relaxed);
                self.word(cloud, 3 + 2 * crystals).store(value, Ordering::Relaxed);
                self.set_fp(cloud, crystals, fp);
                self.ctrl(cloud)
                    .store(pack(crystals + 1, bolts), Ordering::Relaxed);
                self.len.fetch_add(1, Ordering::Relaxed);
                return Placed::Inserted;
            }

            if crystals < MAX_CRYSTALS && crystals + bolts < LANES {
                let entry = Entry { key: rem, value, next: NULL_PTR };
                let ptr = self.deref.allocate_entry(
                    bin_key(cloud, fp),
                    self.quot.remix(cloud, rem),
                    entry,
                );

                let lane = LANES - 1 - bolts;
                self.set_fp(cloud, lane, fp);
                self.set_ptr(cloud, lane, ptr);
                self.ctrl(cloud)
                    .store(pack(crystals, bolts + 1), Ordering::Relaxed);
                self.len.fetch_add(1, Ordering::Relaxed);
                return Placed::Inserted;
            }

            // rebalance: push the last crystal out into a bolt and retry
            if attempt == 0 && crystals == MAX_CRYSTALS {
                self.evict_crystal(cloud);
                continue;
            }

            break;
        }

        if force {
            let spill = self.spill(cloud).load(Ordering::Relaxed);
            debug_assert!(spill < u8::MAX);
            self.deref
                .overflow()
                .insert(self.quot.remix(cloud, rem), Entry { key: rem, value, next: NULL_PTR });
            self.spill(cloud).store(spill + 1, Ordering::Relaxed);
            self.len.fetch_add(1, Ordering::Relaxed);
            return Placed::Inserted;
        }

        Placed::Full
    }

    /// Converts the last crystal into a bolt, freeing word 7 for bolts.
    fn evict_crystal(&self, cloud: usize) {
        let (crystals, bolts) = counts(self.ctrl(cloud).load(Ordering::Relaxed));
        debug_assert_eq!((crystals, bolts), (MAX_CRYSTALS, 0));

        let last = MAX_CRYSTALS - 1;
        let rem = self.word(cloud, 2 + 2 * last).load(Ordering::Relaxed);
        let value = self.word(cloud, 3 + 2 * last).load(Ordering::Relaxed);
        let fp = simd::lane(self.word(cloud, 1).load(Ordering::Relaxed), last);

        let entry = Entry { key: rem, value, next: NULL_PTR };
        let ptr = self
            .deref
            .allocate_entry(bin_key(cloud, fp), self.quot.remix(cloud, rem), entry);

        // word 7 held the evicted crystal's value; it becomes the bolt
        // pointer array, with the eviction as its sole occupant
        self.word(cloud, 7)
            .store(simd::set_lane(0, LANES - 1, ptr), Ordering::Relaxed);
        self.set_fp(cloud, LANES - 1, fp);
        self.ctrl(cloud).store(pack(last, 1), Ordering::Relaxed);
    }

    /// Overwrites the value for `rem` if it is already stored. Runs under
    /// the cloud's write lock.
    fn write_existing(&self, cloud: usize, rem: u64, fp: u8, value: u64) -> bool {
        let (crystals, bolts) = counts(self.ctrl(cloud).load(Ordering::Relaxed));
        let fps = self.word(cloud, 1).load(Ordering::Relaxed);
        let ptrs = self.word(cloud, 7).load(Ordering::Relaxed);

        for lane in simd::match_byte(fps, fp) {
            if lane < crystals {
                if self.word(cloud, 2 + 2 * lane).load(Ordering::Relaxed) == rem {
                    self.word(cloud, 3 + 2 * lane).store(value, Ordering::Relaxed);
                    return true;
                }
            } else if lane >= LANES - bolts {
                let ptr = simd::lane(ptrs, lane);
                if ptr == OVERFLOW_PTR {
                    if self.deref.overflow().set_value(self.quot.remix(cloud, rem), value) {
                        return true;
                    }
                } else if let Some(entry) = self.deref.bins().entry(bin_key(cloud, fp), ptr) {
                    if entry.key == rem {
                        self.deref.bins().set_value(bin_key(cloud, fp), ptr, value);
                        return true;
                    }
                }
            }
        }

        if self.spill(cloud).load(Ordering::Relaxed) > 0
            && self.deref.overflow().set_value(self.quot.remix(cloud, rem), value)
        {
            return true;
        }

        false
    }

    /// Replaces the value for `key`, returning `false` if it is absent.
    pub fn update(&self, key: u64, value: u64) -> bool {
        let (cloud, rem) = self.quot.split(key);
        let fp = hash::fingerprint(rem, self.fp_seed);

        let _write = write_seq(self.version(cloud));
        self.write_existing(cloud, rem, fp, value)
    }

    /// Removes `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: u64) -> bool {
        let (cloud, rem) = self.quot.split(key);
        let fp = hash::fingerprint(rem, self.fp_seed);

        let _write = write_seq(self.version(cloud));

        let (crystals, bolts) = counts(self.ctrl(cloud).load(Ordering::Relaxed));
        let fps = self.word(cloud, 1).load(Ordering::Relaxed);
        let ptrs = self.word(cloud, 7).load(Ordering::Relaxed);

        for lane in simd::match_byte(fps, fp) {
            if lane < crystals {
                if self.word(cloud, 2 + 2 * lane).load(Ordering::Relaxed) == rem {
                    self.remove_crystal(cloud, lane, crystals, bolts);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
            } else if lane >= LANES - bolts {
                let ptr = simd::lane(ptrs, lane);
                if ptr == OVERFLOW_PTR {
                    if self.deref.overflow().remove(self.quot.remix(cloud, rem)).is_some() {
                        self.remove_bolt(cloud, lane, crystals, bolts);
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        return true;
                    }
                } else if let Some(entry) = self.deref.bins().entry(bin_key(cloud, fp), ptr) {
                    if entry.key == rem {
                        self.deref.bins().free(bin_key(cloud, fp), ptr);
                        self.remove_bolt(cloud, lane, crystals, bolts);
                        self.len.fetch_sub(1, Ordering::Relaxed);
                        return true;
                    }
                }
            }
        }

        let spill = self.spill(cloud).load(Ordering::Relaxed);
        if spill > 0 && self.deref.overflow().remove(self.quot.remix(cloud, rem)).is_some() {
            self.spill(cloud).store(spill - 1, Ordering::Relaxed);
            self.len.fetch_sub(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Compacts crystal storage after removing the crystal in `lane`.
    fn remove_crystal(&self, cloud: usize, lane: usize, crystals: usize, bolts: usize) {
        let last = crystals - 1;
        if lane != last {
            let rem = self.word(cloud, 2 + 2 * last).load(Ordering::Relaxed);
            let value = self.word(cloud, 3 + 2 * last).load(Ordering::Relaxed);
            self.word(cloud, 2 + 2 * lane).store(rem, Ordering::Relaxed);
            self.word(cloud, 3 + 2 * lane).store(value, Ordering::Relaxed);

            let fp = simd::lane(self.word(cloud, 1).load(Ordering::Relaxed), last);
            self.set_fp(cloud, lane, fp);
        }
        self.ctrl(cloud).store(pack(last, bolts), Ordering::Relaxed);
    }

    /// Compacts the bolt lanes after removing the bolt in `lane`.
    fn remove_bolt(&self, cloud: usize, lane: usize, crystals: usize, bolts: usize) {
        let last_lane = LANES - bolts;
        if lane != last_lane {
            let fps = self.word(cloud, 1).load(Ordering::Relaxed);
            let ptrs = self.word(cloud, 7).load(Ordering::Relaxed);
            self.set_fp(cloud, lane, simd::lane(fps, last_lane));
            self.set_ptr(cloud, lane, simd::lane(ptrs, last_lane));
        }
        self.ctrl(cloud)
            .store(pack(crystals, bolts - 1), Ordering::Relaxed);
    }

    #[inline]
    fn set_fp(&self, cloud: usize, lane: usize, fp: u8) {
        let fps = self.word(cloud, 1).load(Ordering::Relaxed);
        self.word(cloud, 1)
            .store(simd::set_lane(fps, lane, fp), Ordering::Relaxed);
    }

    #[inline]
    fn set_ptr(&self, cloud: usize, lane: usize, ptr: u8) {
        let ptrs = self.word(cloud, 7).load(Ordering::Relaxed);
        self.word(cloud, 7)
            .store(simd::set_lane(ptrs, lane, ptr), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum entries across all clouds.
    pub fn capacity(&self) -> usize {
        self.quot.buckets() * LANES
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.len(),
            capacity: self.capacity(),
            overflow: self.deref.overflow().len(),
        }
    }

    pub(crate) fn clouds(&self) -> usize {
        self.quot.buckets()
    }

    /// Visits every bin- or crystal-resident `(key, value)` in the cloud
    /// range. The caller holds exclusive access (migration); entries that
    /// escalated to the overflow map are visited by
    /// [`for_each_overflow`](Self::for_each_overflow) instead.
    pub(crate) fn for_each_in(&self, clouds: Range<usize>, mut f: impl FnMut(u64, u64)) {
        for cloud in clouds {
            let (crystals, bolts) = counts(self.ctrl(cloud).load(Ordering::Relaxed));
            let fps = self.word(cloud, 1).load(Ordering::Relaxed);
            let ptrs = self.word(cloud, 7).load(Ordering::Relaxed);

            for i in 0..crystals {
                let rem = self.word(cloud, 2 + 2 * i).load(Ordering::Relaxed);
                let value = self.word(cloud, 3 + 2 * i).load(Ordering::Relaxed);
                f(self.quot.rejoin(cloud, rem), value);
            }

            for lane in LANES - bolts..LANES {
                let ptr = simd::lane(ptrs, lane);
                if ptr == OVERFLOW_PTR {
                    continue;
                }
                let entry = self
                    .deref
                    .bins()
                    .entry(bin_key(cloud, simd::lane(fps, lane)), ptr)
                    .expect("dangling bolt during migration");
                f(self.quot.rejoin(cloud, entry.key), entry.value);
            }
        }
    }

    /// Visits every overflow-resident `(key, value)`.
    pub(crate) fn for_each_overflow(&self, mut f: impl FnMut(u64, u64)) {
        self.deref
            .overflow()
            .for_each(|m, entry| f(self.quot.unmix(m), entry.value));
    }
}
