use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;

use log::trace;

use crate::config::{Error, Populate};
use crate::raw::alloc::Arena;
use crate::raw::hash;
use crate::raw::utils::lock_byte;

/// A narrow reference to a stored entry.
///
/// Combined with a re-hash of the key it was allocated under, a tiny
/// pointer locates one bin slot; no full-width pointer is ever stored.
pub type TinyPtr = u8;

/// The null tiny pointer. Never issued by an allocation.
pub const NULL_PTR: TinyPtr = 0;

/// The entry escalated past the bins into the overflow map.
pub const OVERFLOW_PTR: TinyPtr = 255;

// In-bin slot indices are 1-based 7-bit values. Candidate bin 1 owns the
// range 1..=127 and candidate bin 2 owns 128..=254, so the high bit of a
// pointer selects the candidate and the full 127-slot bin size remains
// usable without colliding with the overflow sentinel.
#[inline]
fn encode(choice: usize, slot: u8) -> TinyPtr {
    debug_assert!((1..=127).contains(&slot));
    match choice {
        0 => slot,
        _ => 127 + slot,
    }
}

#[inline]
fn decode(ptr: TinyPtr) -> (usize, u8) {
    debug_assert!(ptr != NULL_PTR && ptr != OVERFLOW_PTR);
    if ptr & 0x80 != 0 {
        (1, ptr - 127)
    } else {
        (0, ptr)
    }
}

/// One stored entry: a key (or key remainder), its value, and the tiny
/// pointer linking it to the next entry of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Entry {
    pub key: u64,
    pub value: u64,
    pub next: TinyPtr,
}

/// The number of bins needed to hold `capacity` entries with two-choice
/// slack left over.
fn bins_for(capacity: usize, bin_size: u8) -> usize {
    let slots = capacity.saturating_mul(5) / 4;
    (slots / bin_size as usize).max(2).next_power_of_two()
}

// Per-bin layout inside the arena. The header word is accessed as four
// individual bytes and the slot words as whole words; the two views never
// overlap.
//
//   byte 0          count
//   byte 1          free-list head (0 = empty)
//   byte 2          high-water mark (slots 1..=hw have been handed out)
//   byte 3          lock
//   bytes 4..8      unused
//   then per slot   key word, value word, link word (next / free-list link)
const HEADER_WORDS: usize = 1;
const SLOT_WORDS: usize = 3;

/// An array of fixed-capacity bins with two-choice load balancing.
///
/// Each bin is an internal free list of slots addressed by 7-bit indices.
/// Mutation takes the owning bin's byte lock; reads are raw atomic loads
/// validated by the caller's version counter.
pub struct BinTable {
    arena: Arena,
    mask: usize,
    bin_size: u8,
    bin_words: usize,
    seeds: [u64; 2],
}

impl BinTable {
    pub fn new(
        capacity: usize,
        bin_size: u8,
        seeds: [u64; 2],
        populate: Populate,
    ) -> Result<BinTable, Error> {
        assert!((1..=127).contains(&bin_size), "bin size must be in 1..=127");

        let bins = bins_for(capacity, bin_size);
        let bin_words = HEADER_WORDS + SLOT_WORDS * bin_size as usize;
        let bytes = bins
            .checked_mul(bin_words * 8)
            .ok_or(Error::Capacity { requested: capacity })?;

        Ok(BinTable {
            arena: Arena::zeroed(bytes, populate)?,
            mask: bins - 1,
            bin_size,
            bin_words,
            seeds,
        })
    }

    #[inline]
    pub fn bin_size(&self) -> u8 {
        self.bin_size
    }

    #[inline]
    fn candidate(&self, key: u64, choice: usize) -> usize {
        hash::hash_word(key, self.seeds[choice]) as usize & self.mask
    }

    #[inline]
    fn header(&self, bin: usize, offset: usize) -> &AtomicU8 {
        &self.arena.bytes()[bin * self.bin_words * 8 + offset]
    }

    #[inline]
    fn slot_word(&self, bin: usize, slot: u8, word: usize) -> &AtomicU64 {
        debug_assert!((1..=self.bin_size).contains(&slot));
        let base = bin * self.bin_words + HEADER_WORDS + SLOT_WORDS * (slot as usize - 1);
        &self.arena.words()[base + word]
    }

    /// Places `entry` in the less-loaded of the key's two candidate bins,
    /// returning `None` if both are full.
    pub fn allocate(&self, key: u64, entry: Entry) -> Option<TinyPtr> {
        let bins = [self.candidate(key, 0), self.candidate(key, 1)];

        // two-choice: racy counts are fine, the lock re-checks
        let c0 = self.header(bins[0], 0).load(Ordering::Relaxed);
        let c1 = self.header(bins[1], 0).load(Ordering::Relaxed);
        let first = usize::from(c1 < c0);

        for choice in [first, 1 - first] {
            if let Some(slot) = self.try_push(bins[choice], entry) {
                return Some(encode(choice, slot));
            }
        }

        None
    }

    fn try_push(&self, bin: usize, entry: Entry) -> Option<u8> {
        let _lock = lock_byte(self.header(bin, 3));

        let count = self.header(bin, 0).load(Ordering::Relaxed);
        if count >= self.bin_size {
            return None;
        }

        let slot = {
            let head = self.header(bin, 1).load(Ordering::Relaxed);
            if head != NULL_PTR {
                // pop the free list; the link rides in the slot's link word
                let link = self.slot_word(bin, head, 2).load(Ordering::Relaxed) as u8;
                self.header(bin, 1).store(link, Ordering::Relaxed);
                head
            } else {
                // a zeroed bin needs no free-list setup: slots above the
                // high-water mark have never been handed out
                let hw = self.header(bin, 2).load(Ordering::Relaxed);
                debug_assert!(hw < self.bin_size);
                self.header(bin, 2).store(hw + 1, Ordering::Relaxed);
                hw + 1
            }
        };

        self.slot_word(bin, slot, 0).store(entry.key, Ordering::Relaxed);
        self.slot_word(bin, slot, 1).store(entry.value, Ordering::Relaxed);
        self.slot_word(bin, slot, 2)
            .store(entry.next as u64, Ordering::Release);
        self.header(bin, 0).store(count + 1, Ordering::Relaxed);

        Some(slot)
    }

    /// Returns the freed slot to its bin's free list.
    pub fn free(&self, key: u64, ptr: TinyPtr) {
        let (choice, slot) = decode(ptr);
        let bin = self.candidate(key, choice);
        debug_assert!(slot <= self.bin_size);

        let _lock = lock_byte(self.header(bin, 3));

        let head = self.header(bin, 1).load(Ordering::Relaxed);
        self.slot_word(bin, slot, 2).store(head as u64, Ordering::Relaxed);
        self.header(bin, 1).store(slot, Ordering::Relaxed);

        let count = self.header(bin, 0).load(Ordering::Relaxed);
        debug_assert!(count > 0);
        self.header(bin, 0).store(count - 1, Ordering::Relaxed);
    }

    /// Reads the entry a tiny pointer refers to.
    ///
    /// Returns `None` for a slot index beyond this table's bin size, which
    /// a reader can observe mid-mutation; the caller's version check
    /// discards the result either way.
    pub fn entry(&self, key: u64, ptr: TinyPtr) -> Option<Entry> {
        let (choice, slot) = decode(ptr);
        if slot > self.bin_size {
            return None;
        }
        let bin = self.candidate(key, choice);

        Some(Entry {
            key: self.slot_word(bin, slot, 0).load(Ordering::Relaxed),
            value: self.slot_word(bin, slot, 1).load(Ordering::Relaxed),
            next: self.slot_word(bin, slot, 2).load(Ordering::Acquire) as u8,
        })
    }

    pub fn set_value(&self, key: u64, ptr: TinyPtr, value: u64) {
        let (choice, slot) = decode(ptr);
        debug_assert!(slot <= self.bin_size);
        let bin = self.candidate(key, choice);
        self.slot_word(bin, slot, 1).store(value, Ordering::Release);
    }

    pub fn set_next(&self, key: u64, ptr: TinyPtr, next: TinyPtr) {
        let (choice, slot) = decode(ptr);
        debug_assert!(slot <= self.bin_size);
        let bin = self.candidate(key, choice);
        self.slot_word(bin, slot, 2)
            .store(next as u64, Ordering::Release);
    }

    pub fn write_entry(&self, key: u64, ptr: TinyPtr, entry: Entry) {
        let (choice, slot) = decode(ptr);
        debug_assert!(slot <= self.bin_size);
        let bin = self.candidate(key, choice);
        self.slot_word(bin, slot, 0).store(entry.key, Ordering::Relaxed);
        self.slot_word(bin, slot, 1).store(entry.value, Ordering::Relaxed);
        self.slot_word(bin, slot, 2)
            .store(entry.next as u64, Ordering::Release);
    }
}

/// The escape hatch for entries the bins cannot place.
///
/// A plain locked map: escalation is rare by construction, and taking a
/// lock here keeps allocation infallible without complicating the bins.
#[derive(Default)]
pub struct OverflowTable {
    map: Mutex<HashMap<u64, Entry>>,
}

impl OverflowTable {
    pub fn insert(&self, key: u64, entry: Entry) {
        self.map.lock().unwrap().insert(key, entry);
    }

    pub fn get(&self, key: u64) -> Option<Entry> {
        self.map.lock().unwrap().get(&key).copied()
    }

    pub fn set_value(&self, key: u64, value: u64) -> bool {
        match self.map.lock().unwrap().get_mut(&key) {
            Some(entry) => {
                entry.value = value;
                true
            }
            None => false,
        }
    }

    pub fn set_next(&self, key: u64, next: TinyPtr) -> bool {
        match self.map.lock().unwrap().get_mut(&key) {
            Some(entry) => {
                entry.next = next;
                true
            }
            None => false,
        }
    }

    pub fn write(&self, key: u64, entry: Entry) -> bool {
        match self.map.lock().unwrap().get_mut(&key) {
            Some(slot) => {
                *slot = entry;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, key: u64) -> Option<Entry> {
        self.map.lock().unwrap().remove(&key)
    }

    /// Removes and returns any entry whose key satisfies `pred`.
    pub fn remove_where(&self, mut pred: impl FnMut(u64) -> bool) -> Option<(u64, Entry)> {
        let mut map = self.map.lock().unwrap();
        let key = map.keys().copied().find(|&k| pred(k))?;
        let entry = map.remove(&key).unwrap();
        Some((key, entry))
    }

    pub fn len(&self) -> usize {
        self.map.lock().unwrap().len()
    }

    /// Visits every escalated entry. Callers hold exclusive access to the
    /// owning table (this is the migration path).
    pub fn for_each(&self, mut f: impl FnMut(u64, Entry)) {
        for (&key, &entry) in self.map.lock().unwrap().iter() {
            f(key, entry);
        }
    }
}

/// The tiny-pointer allocation engine: bins with an overflow fallback.
///
/// `allocate` hands out an 8-bit pointer that, together with the allocation
/// key, resolves back to the entry. Allocation never fails: when both
/// candidate bins are full the entry escalates to the overflow map and the
/// pointer is [`OVERFLOW_PTR`].
///
/// Two keys parameterize every operation: the *bin key* is re-hashed to
/// locate candidate bins and must be recomputable by any reader holding the
/// pointer; the *overflow key* must be unique per live entry and names the
/// entry in the overflow map.
pub struct DereferenceTable {
    bins: BinTable,
    overflow: OverflowTable,
}

impl DereferenceTable {
    pub fn new(
        capacity: usize,
        bin_size: u8,
        seeds: [u64; 2],
        populate: Populate,
    ) -> Result<DereferenceTable, Error> {
        Ok(DereferenceTable {
            bins: BinTable::new(capacity, bin_size, seeds, populate)?,
            overflow: OverflowTable::default(),
        })
    }

    #[inline]
    pub fn bins(&self) -> &BinTable {
        &self.bins
    }

    #[inline]
    pub fn overflow(&self) -> &OverflowTable {
        &self.overflow
    }

    pub fn allocate_entry(&self, bin_key: u64, ow_key: u64, entry: Entry) -> TinyPtr {
        match self.bins.allocate(bin_key, entry) {
            Some(ptr) => ptr,
            None => {
                trace!("bins full for key {bin_key:#x}, escalating to overflow");
                self.overflow.insert(ow_key, entry);
                OVERFLOW_PTR
            }
        }
    }

    pub fn entry(&self, bin_key: u64, ow_key: u64, ptr: TinyPtr) -> Option<Entry> {
        debug_assert!(ptr != NULL_PTR, "dereferenced a null tiny pointer");
        if ptr == OVERFLOW_PTR {
            self.overflow.get(ow_key)
        } else {
            self.bins.entry(bin_key, ptr)
        }
    }

    pub fn set_value(&self, bin_key: u64, ow_key: u64, ptr: TinyPtr, value: u64) {
        debug_assert!(ptr != NULL_PTR);
        if ptr == OVERFLOW_PTR {
            self.overflow.set_value(ow_key, value);
        } else {
            self.bins.set_value(bin_key, ptr, value);
        }
    }

    pub fn set_next(&self, bin_key: u64, ow_key: u64, ptr: TinyPtr, next: TinyPtr) {
        debug_assert!(ptr != NULL_PTR);
        if ptr == OVERFLOW_PTR {
            self.overflow.set_next(ow_key, next);
        } else {
            self.bins.set_next(bin_key, ptr, next);
        }
    }

    pub fn write_entry(&self, bin_key: u64, ow_key: u64, ptr: TinyPtr, entry: Entry) {
        debug_assert!(ptr != NULL_PTR);
        if ptr == OVERFLOW_PTR {
            self.overflow.write(ow_key, entry);
        } else {
            self.bins.write_entry(bin_key, ptr, entry);
        }
    }

    pub fn free_entry(&self, bin_key: u64, ow_key: u64, ptr: TinyPtr) {
        debug_assert!(ptr != NULL_PTR);
        if ptr == OVERFLOW_PTR {
            self.overflow.remove(ow_key);
        } else {
            self.bins.free(bin_key, ptr);
        }
    }

    // The standalone dereference-table contract: one allocation per key.

    /// Allocates a slot holding `value` under `key`.
    pub fn allocate(&self, key: u64, value: u64) -> TinyPtr {
        self.allocate_entry(key, key, Entry { key, value, next: NULL_PTR })
    }

    /// Resolves a pointer previously returned by [`allocate`](Self::allocate)
    /// for this key.
    pub fn query(&self, key: u64, ptr: TinyPtr) -> Option<u64> {
        let entry = self.entry(key, key, ptr)?;
        (entry.key == key).then_some(entry.value)
    }

    /// Replaces the value behind a pointer. Returns `false` if the slot no
    /// longer holds this key.
    pub fn update(&self, key: u64, ptr: TinyPtr, value: u64) -> bool {
        match self.entry(key, key, ptr) {
            Some(entry) if entry.key == key => {
                self.set_value(key, key, ptr, value);
                true
            }
            _ => false,
        }
    }

    /// Releases the slot behind a pointer.
    pub fn free(&self, key: u64, ptr: TinyPtr) {
        self.free_entry(key, key, ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(capacity: usize, bin_size: u8) -> DereferenceTable {
        DereferenceTable::new(capacity, bin_size, [1, 2], Populate::Eager).unwrap()
    }

    #[test]
    fn allocate_query_free() {
        let table = table(1024, 127);

        let ptr = table.allocate(42, 7);
        assert_ne!(ptr, NULL_PTR);
        assert_eq!(table.query(42, ptr), Some(7));

        assert!(table.update(42, ptr, 8));
        assert_eq!(table.query(42, ptr), Some(8));

        table.free(42, ptr);
    }

    #[test]
    fn slots_are_reused_after_free() {
        let table = table(256, 8);

        for round in 0..10 {
            let ptrs: Vec<_> = (0..256_u64)
                .map(|k| (k, table.allocate(k, k + round)))
                .collect();

            for &(k, ptr) in &ptrs {
                assert_eq!(table.query(k, ptr), Some(k + round));
            }

            for &(k, ptr) in &ptrs {
                table.free(k, ptr);
            }
        }
    }

    #[test]
    fn tiny_bins_escalate_to_overflow() {
        // 2 bins of 1 slot each: most allocations must overflow
        let table = DereferenceTable::new(2, 1, [3, 4], Populate::Eager).unwrap();

        let ptrs: Vec<_> = (0..32_u64).map(|k| (k, table.allocate(k, k * 2))).collect();

        assert!(ptrs.iter().any(|&(_, p)| p == OVERFLOW_PTR));
        for &(k, ptr) in &ptrs {
            assert_eq!(table.query(k, ptr), Some(k * 2));
        }

        for &(k, ptr) in &ptrs {
            table.free(k, ptr);
        }
        assert_eq!(table.overflow().len(), 0);
    }

    #[test]
    fn encode_decode_cover_both_candidates() {
        assert_eq!(decode(encode(0, 1)), (0, 1));
        assert_eq!(decode(encode(0, 127)), (0, 127));
        assert_eq!(decode(encode(1, 1)), (1, 1));
        assert_eq!(decode(encode(1, 127)), (1, 127));
        assert_ne!(encode(1, 127), OVERFLOW_PTR);
    }
}
