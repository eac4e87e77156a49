use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::config::{Config, Error, Populate};
use crate::raw::alloc::Arena;
use crate::raw::bins::{DereferenceTable, Entry, NULL_PTR, OVERFLOW_PTR};
use crate::raw::hash::{self, Quotient};
use crate::raw::utils::simd;
use crate::raw::utils::{read_consistent, write_seq};
use crate::raw::{Placed, Stats};

// One bush is a 64-byte unit like a cloud, but occupancy is a 16-bit
// bitmap of logical slots instead of a control byte:
//
//   word 0   bitmap low byte | bitmap high byte | version byte | unused
//   words 1..7   up to three inline "exhibitor" entries (two words each)
//   word 7   up to eight "skulker" tiny-pointer lanes, lane 7 downward
//
// Entries are stored in bitmap-rank order. There is no stored boundary
// between exhibitors and skulkers: an entry of rank r is inline iff
// r < min(occupancy, 3), so every operation derives the boundary with one
// popcount. A logical slot is assigned at insert (lowest clear bit) and
// held until the entry is freed, which keeps skulker dereference keys
// stable while ranks shift around them.
//
// Word 0 is byte-width only and words 1..8 word-width only. Byte 3 counts
// *spilled* entries: overflow-map residents holding no logical slot at
// all. Ordinary inserts never spill (a full bush rejects them); only
// resize migration does.
const BUSH_WORDS: usize = 8;
const LANES: usize = 8;
const MAX_EXHIBITORS: usize = 3;
const MAX_RESIDENTS: usize = MAX_EXHIBITORS + LANES;

#[inline]
fn boundary(occupancy: usize) -> usize {
    occupancy.min(MAX_EXHIBITORS)
}

#[inline]
fn bin_key(bush: usize, slot: u32) -> u64 {
    hash::combine(bush as u64, slot as u64)
}

/// Where a resident lives, with its content when the bush knows it.
///
/// Overflow placeholders are opaque: the bush stores only the sentinel
/// byte, and the entries themselves sit in the overflow map keyed by their
/// mixed key. Placeholders of one bush are interchangeable.
enum Loc {
    /// Content in hand, not yet (or no longer) in a bin.
    Val(u64, u64),
    /// A bin slot, with its content loaded.
    Bin(u8, u64, u64),
    /// Escalated to the overflow map.
    Ow,
}

struct Resident {
    slot: u32,
    loc: Loc,
}

/// The bitmap-occupancy variant of the cloud design.
///
/// Trades the cloud's fingerprint lanes for denser packing: a bush holds up
/// to eleven entries per 64 bytes, at the cost of dereferencing skulkers
/// during scans and one popcount per operation.
pub struct SkulkerTable {
    arena: Arena,
    quot: Quotient,
    deref: DereferenceTable,
    len: AtomicUsize,
}

impl SkulkerTable {
    pub fn with_config(cfg: &Config) -> Result<SkulkerTable, Error> {
        Self::with_capacity(cfg.capacity, cfg, cfg.populate)
    }

    pub(crate) fn with_capacity(
        capacity: usize,
        cfg: &Config,
        populate: Populate,
    ) -> Result<SkulkerTable, Error> {
        let bushes = (capacity / 6).max(2).next_power_of_two();
        let bytes = bushes
            .checked_mul(BUSH_WORDS * 8)
            .ok_or(Error::Capacity { requested: capacity })?;

        Ok(SkulkerTable {
            arena: Arena::zeroed(bytes, populate)?,
            quot: Quotient::new(bushes, cfg.seed),
            deref: DereferenceTable::new(capacity, cfg.bin_size, cfg.bin_seeds, populate)?,
            len: AtomicUsize::new(0),
        })
    }

    #[inline]
    fn byte(&self, bush: usize, offset: usize) -> &AtomicU8 {
        &self.arena.bytes()[bush * BUSH_WORDS * 8 + offset]
    }

    #[inline]
    fn version(&self, bush: usize) -> &AtomicU8 {
        self.byte(bush, 2)
    }

    #[inline]
    fn spill(&self, bush: usize) -> &AtomicU8 {
        self.byte(bush, 3)
    }

    #[inline]
    fn word(&self, bush: usize, w: usize) -> &AtomicU64 {
        debug_assert!((1..BUSH_WORDS).contains(&w));
        &self.arena.words()[bush * BUSH_WORDS + w]
    }

    #[inline]
    fn bitmap(&self, bush: usize) -> u16 {
        let lo = self.byte(bush, 0).load(Ordering::Relaxed) as u16;
        let hi = self.byte(bush, 1).load(Ordering::Relaxed) as u16;
        lo | (hi << 8)
    }

    pub fn get(&self, key: u64) -> Option<u64> {
        let (bush, rem) = self.quot.split(key);
        let m = self.quot.remix(bush, rem);

        read_consistent(self.version(bush), || self.scan(bush, rem, m))
    }

    fn scan(&self, bush: usize, rem: u64, m: u64) -> Option<u64> {
        let mut bits = self.bitmap(bush);
        let occupancy = bits.count_ones() as usize;
        if occupancy > MAX_RESIDENTS {
            // torn bitmap; the version re-check discards this pass
            return None;
        }

        let exhibitors = boundary(occupancy);
        let ptrs = self.word(bush, 7).load(Ordering::Relaxed);

        let mut rank = 0;
        while bits != 0 {
            let slot = bits.trailing_zeros();
            bits &= bits - 1;

            if rank < exhibitors {
                if self.word(bush, 1 + 2 * rank).load(Ordering::Relaxed) == rem {
                    return Some(self.word(bush, 2 + 2 * rank).load(Ordering::Relaxed));
                }
            } else {
                let ptr = simd::lane(ptrs, LANES - 1 - (rank - exhibitors));
                if ptr == OVERFLOW_PTR {
                    if let Some(entry) = self.deref.overflow().get(m) {
                        debug_assert_eq!(entry.key, rem);
                        return Some(entry.value);
                    }
                } else if ptr != NULL_PTR {
                    if let Some(entry) = self.deref.bins().entry(bin_key(bush, slot), ptr) {
                        if entry.key == rem {
                            return Some(entry.value);
                        }
                    }
                }
            }

            rank += 1;
        }

        if self.spill(bush).load(Ordering::Relaxed) > 0 {
            if let Some(entry) = self.deref.overflow().get(m) {
                debug_assert_eq!(entry.key, rem);
                return Some(entry.value);
            }
        }

        None
    }

    /// Materializes the bush's residents in rank order. Runs under the
    /// bush's write lock.
    fn load_residents(&self, bush: usize) -> Vec<Resident> {
        let mut bits = self.bitmap(bush);
        let occupancy = bits.count_ones() as usize;
        debug_assert!(occupancy <= MAX_RESIDENTS);

        let exhibitors = boundary(occupancy);
        let ptrs = self.word(bush, 7).load(Ordering::Relaxed);
        let mut residents = Vec::with_capacity(occupancy);

        let mut rank = 0;
        while bits != 0 {
            let slot = bits.trailing_zeros();
            bits &= bits - 1;

            let loc = if rank < exhibitors {
                Loc::Val(
                    self.word(bush, 1 + 2 * rank).load(Ordering::Relaxed),
                    self.word(bush, 2 + 2 * rank).load(Ordering::Relaxed),
                )
            } else {
                let ptr = simd::lane(ptrs, LANES - 1 - (rank - exhibitors));
                if ptr == OVERFLOW_PTR {
                    Loc::Ow
                } else {
                    let entry = self
                        .deref
                        .bins()
                        .entry(bin_key(bush, slot), ptr)
                        .expect("dangling skulker under writer lock");
                    Loc::Bin(ptr, entry.key, entry.value)
                }
            };

            residents.push(Resident { slot, loc });
            rank += 1;
        }

        residents
    }

    /// Writes the residents back, promoting or demoting entries whose rank
    /// crossed the exhibitor boundary.
    fn store_residents(&self, bush: usize, residents: &[Resident]) {
        let exhibitors = boundary(residents.len());
        let mut bits: u16 = 0;
        let mut ptrs: u64 = 0;

        for (rank, resident) in residents.iter().enumerate() {
            bits |= 1 << resident.slot;

            if rank < exhibitors {
                let (rem, value) = match resident.loc {
                    Loc::Val(rem, value) => (rem, value),
                    Loc::Bin(ptr, rem, value) => {
                        // promoted: the entry moves inline
                        self.deref.bins().free(bin_key(bush, resident.slot), ptr);
                        (rem, value)
                    }
                    Loc::Ow => {
                        // promoted out of the overflow map; placeholders of
                        // one bush are interchangeable, so claim any
                        let (_, entry) = self
                            .deref
                            .overflow()
                            .remove_where(|m| (m & (self.quot.buckets() as u64 - 1)) == bush as u64)
                            .expect("overflow placeholder without map entry");
                        (entry.key, entry.value)
                    }
                };
                self.word(bush, 1 + 2 * rank).store(rem, Ordering::Relaxed);
                self.word(bush, 2 + 2 * rank).store(value, Ordering::Relaxed);
            } else {
                let ptr = match resident.loc {
                    // demoted: the entry leaves the inline area
                    Loc::Val(rem, value) => self.deref.allocate_entry(
                        bin_key(bush, resident.slot),
                        self.quot.remix(bush, rem),
                        Entry { key: rem, value, next: NULL_PTR },
                    ),
                    Loc::Bin(ptr, ..) => ptr,
                    Loc::Ow => OVERFLOW_PTR,
                };
                ptrs = simd::set_lane(ptrs, LANES - 1 - (rank - exhibitors), ptr);
            }
        }

        self.word(bush, 7).store(ptrs, Ordering::Relaxed);
        self.byte(bush, 0).store(bits as u8, Ordering::Relaxed);
        self.byte(bush, 1).store((bits >> 8) as u8, Ordering::Relaxed);
    }

    /// Overwrites in place if `rem` is already resident. Runs under the
    /// write lock; never changes ranks.
    fn write_existing(&self, bush: usize, rem: u64, m: u64, value: u64) -> bool {
        if self.deref.overflow().set_value(m, value) {
            return true;
        }

        let residents = self.load_residents(bush);
        let exhibitors = boundary(residents.len());

        for (rank, resident) in residents.iter().enumerate() {
            match resident.loc {
                Loc::Val(r, _) if r == rem => {
                    debug_assert!(rank < exhibitors);
                    self.word(bush, 2 + 2 * rank).store(value, Ordering::Relaxed);
                    return true;
                }
                Loc::Bin(ptr, r, _) if r == rem => {
                    self.deref.bins().set_value(bin_key(bush, resident.slot), ptr, value);
                    return true;
                }
                _ => {}
            }
        }

        false
    }

    /// Inserts or overwrites `key`; [`Placed::Full`] once the bush holds
    /// eleven entries.
    pub fn insert(&self, key: u64, value: u64) -> Placed {
        self.place(key, value, false)
    }

    /// Migration-only insert that spills to the overflow map instead of
    /// failing when the bush is full.
    pub(crate) fn force_insert(&self, key: u64, value: u64) {
        let placed = self.place(key, value, true);
        debug_assert!(!matches!(placed, Placed::Full));
    }

    fn place(&self, key: u64, value: u64, force: bool) -> Placed {
        let (bush, rem) = self.quot.split(key);
        let m = self.quot.remix(bush, rem);

        let _write = write_seq(self.version(bush));

        if self.write_existing(bush, rem, m, value) {
            return Placed::Updated;
        }

        let mut residents = self.load_residents(bush);
        if residents.len() == MAX_RESIDENTS {
            if force {
                let spill = self.spill(bush).load(Ordering::Relaxed);
                debug_assert!(spill < u8::MAX);
                self.deref
                    .overflow()
                    .insert(m, Entry { key: rem, value, next: NULL_PTR });
                self.spill(bush).store(spill + 1, Ordering::Relaxed);
                self.len.fetch_add(1, Ordering::Relaxed);
                return Placed::Inserted;
            }
            return Placed::Full;
        }

        let bits = residents.iter().fold(0_u16, |b, r| b | 1 << r.slot);
        let slot = (!bits).trailing_zeros();
        debug_assert!(slot < 16);

        let at = residents.partition_point(|r| r.slot < slot);
        residents.insert(at, Resident { slot, loc: Loc::Val(rem, value) });
        self.store_residents(bush, &residents);

        self.len.fetch_add(1, Ordering::Relaxed);
        Placed::Inserted
    }

    /// Replaces the value for `key`, returning `false` if it is absent.
    pub fn update(&self, key: u64, value: u64) -> bool {
        let (bush, rem) = self.quot.split(key);
        let m = self.quot.remix(bush, rem);

        let _write = write_seq(self.version(bush));
        self.write_existing(bush, rem, m, value)
    }

    /// Removes `key`. Removing an absent key is a no-op.
    pub fn remove(&self, key: u64) -> bool {
        let (bush, rem) = self.quot.split(key);
        let m = self.quot.remix(bush, rem);

        let _write = write_seq(self.version(bush));

        let mut residents = self.load_residents(bush);

        let at = if self.deref.overflow().remove(m).is_some() {
            // the entry was in the overflow map; retire any one of this
            // bush's placeholders for it, or a spill credit if the bush
            // holds none (placeholders and spills are interchangeable)
            match residents.iter().position(|r| matches!(r.loc, Loc::Ow)) {
                Some(at) => at,
                None => {
                    let spill = self.spill(bush).load(Ordering::Relaxed);
                    debug_assert!(spill > 0, "overflow entry with no placeholder or spill");
                    self.spill(bush).store(spill.saturating_sub(1), Ordering::Relaxed);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
            }
        } else {
            let found = residents.iter().position(|r| match r.loc {
                Loc::Val(r, _) | Loc::Bin(_, r, _) => r == rem,
                Loc::Ow => false,
            });
            let Some(at) = found else { return false };

            if let Loc::Bin(ptr, ..) = residents[at].loc {
                self.deref.bins().free(bin_key(bush, residents[at].slot), ptr);
            }
            at
        };

        residents.remove(at);
        self.store_residents(bush, &residents);

        self.len.fetch_sub(1, Ordering::Relaxed);
        true
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum entries across all bushes.
    pub fn capacity(&self) -> usize {
        self.quot.buckets() * MAX_RESIDENTS
    }

    pub fn stats(&self) -> Stats {
        Stats {
            entries: self.len(),
            capacity: self.capacity(),
            overflow: self.deref.overflow().len(),
        }
    }

    pub(crate) fn bushes(&self) -> usize {
        self.quot.buckets()
    }

    /// Visits every inline- or bin-resident `(key, value)` in the bush
    /// range. The caller holds exclusive access (migration).
    pub(crate) fn for_each_in(&self, bushes: Range<usize>, mut f: impl FnMut(u64, u64)) {
        for bush in bushes {
            for resident in self.load_residents(bush) {
                match resident.loc {
                    Loc::Val(rem, value) | Loc::Bin(_, rem, value) => {
                        f(self.quot.rejoin(bush, rem), value)
                    }
                    Loc::Ow => {}
                }
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn config(capacity: usize) -> Config {
        Config {
            capacity,
            bin_size: 127,
            seed: 0xb115,
            bin_seeds: [8, 9],
            fingerprint_seed: 10,
            parts: 1,
            grow_threshold: 0.75,
            populate: Populate::Eager,
        }
    }

    #[test]
    fn round_trip_with_shadow() {
        let table = SkulkerTable::with_config(&config(1 << 12)).unwrap();
        let mut shadow = HashMap::new();

        let mut x = 0xdead_beef_cafe_f00d_u64;
        let mut rng = move || {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x
        };

        for _ in 0..30_000_u64 {
            match rng() % 4 {
                0 | 1 => {
                    let (k, v) = (rng() % 2048, rng());
                    match table.insert(k, v) {
                        Placed::Full => continue,
                        _ => {
                            shadow.insert(k, v);
                        }
                    }
                }
                2 => {
                    let (k, v) = (rng() % 2048, rng());
                    assert_eq!(table.update(k, v), shadow.get_mut(&k).map(|s| *s = v).is_some());
                }
                _ => {
                    let k = rng() % 2048;
                    assert_eq!(table.remove(k), shadow.remove(&k).is_some());
                }
            }
        }

        for (&k, &v) in &shadow {
            assert_eq!(table.get(k), Some(v));
        }
        assert_eq!(table.len(), shadow.len());
    }

    #[test]
    fn boundary_demotion_and_promotion() {
        // two bushes: fill one past the exhibitor boundary, then drain it
        let table = SkulkerTable::with_config(&config(8)).unwrap();

        let mut stored = Vec::new();
        for k in 0..64_u64 {
            if matches!(table.insert(k, k * 5), Placed::Inserted) {
                stored.push(k);
            }
        }
        assert!(stored.len() > MAX_EXHIBITORS, "skulkers were never exercised");

        for &k in &stored {
            assert_eq!(table.get(k), Some(k * 5), "key {k}");
        }

        // removing from the front of ranks promotes skulkers back inline
        let (front, back) = stored.split_at(stored.len() / 2);
        for &k in front {
            assert!(table.remove(k));
        }
        for &k in back {
            assert_eq!(table.get(k), Some(k * 5), "key {k} after promotion");
        }
        for &k in front {
            assert_eq!(table.get(k), None);
        }
    }

    #[test]
    fn free_then_refill() {
        let table = SkulkerTable::with_config(&config(1 << 10)).unwrap();

        let keys: Vec<u64> = (0..700).map(|i| i * 3 + 2).collect();
        for &k in &keys {
            assert!(!matches!(table.insert(k, k), Placed::Full));
        }
        for &k in &keys {
            assert!(table.remove(k));
            assert!(!table.remove(k));
        }
        assert_eq!(table.len(), 0);
        assert_eq!(table.stats().overflow, 0);

        for &k in &keys {
            assert!(!matches!(table.insert(k, k ^ 1), Placed::Full));
        }
        for &k in &keys {
            assert_eq!(table.get(k), Some(k ^ 1));
        }
    }

    #[test]
    fn concurrent_mixed_buckets() {
        let table = Arc::new(SkulkerTable::with_config(&config(1 << 14)).unwrap());
        let threads = 8;
        let per_thread = 1024_u64;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let mut stored = Vec::new();
                    for i in 0..per_thread {
                        let k = ((t as u64) * per_thread + i) * 97 + 13;
                        if !matches!(table.insert(k, k << 1), Placed::Full) {
                            stored.push(k);
                        }
                    }
                    for &k in &stored {
                        assert_eq!(table.get(k), Some(k << 1));
                    }
                    stored.len()
                })
            })
            .collect();

        let stored: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(stored >= (threads as usize * per_thread as usize) * 99 / 100);
    }
}
