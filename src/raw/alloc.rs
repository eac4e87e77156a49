use std::slice;
use std::sync::atomic::{AtomicU64, AtomicU8};

use memmap2::{MmapMut, MmapOptions};

use crate::config::{Error, Populate};

/// A fixed-size, zeroed, anonymous mapping backing one table array.
///
/// The arena is allocated once at table construction and never grows; tiny
/// pointers and bucket ids are indices into it. All access goes through the
/// atomic views below, so an arena can be shared freely across threads. The
/// zero state is meaningful for every structure stored here (null tiny
/// pointers, even version bytes, empty bins), which is what makes lazy
/// population safe: an untouched page reads as an empty region.
pub struct Arena {
    map: MmapMut,
    len: usize,
}

impl Arena {
    /// Maps `len` bytes of zeroed memory, rounded up to a whole word.
    pub fn zeroed(len: usize, populate: Populate) -> Result<Arena, Error> {
        let len = len.max(8).next_multiple_of(8);

        let mut options = MmapOptions::new();
        options.len(len);

        #[cfg(target_os = "linux")]
        if populate == Populate::Eager {
            options.populate();
        }
        #[cfg(not(target_os = "linux"))]
        let _ = populate;

        let map = options.map_anon()?;
        Ok(Arena { map, len })
    }

    /// The arena viewed as atomic words.
    #[inline]
    pub fn words(&self) -> &[AtomicU64] {
        // Safety: the mapping is page-aligned, zero-initialized, lives as
        // long as `self`, and is only ever accessed through these atomic
        // views after construction.
        unsafe { slice::from_raw_parts(self.map.as_ptr().cast::<AtomicU64>(), self.len / 8) }
    }

    /// The arena viewed as atomic bytes.
    ///
    /// Word and byte views must not overlap: each region of an arena is
    /// accessed at exactly one width for its entire lifetime, since mixed
    /// size atomic accesses to the same memory are not portable.
    #[inline]
    pub fn bytes(&self) -> &[AtomicU8] {
        // Safety: as for `words`.
        unsafe { slice::from_raw_parts(self.map.as_ptr().cast::<AtomicU8>(), self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn zeroed_and_word_addressable() {
        let arena = Arena::zeroed(4096, Populate::Eager).unwrap();
        assert_eq!(arena.len(), 4096);
        assert_eq!(arena.words().len(), 512);

        assert!(arena.words().iter().all(|w| w.load(Ordering::Relaxed) == 0));

        arena.words()[17].store(u64::MAX, Ordering::Relaxed);
        assert_eq!(arena.words()[17].load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn lazy_mapping_reads_zero() {
        let arena = Arena::zeroed(1 << 20, Populate::Lazy).unwrap();
        assert_eq!(arena.bytes()[(1 << 20) - 1].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn rounds_up_to_words() {
        let arena = Arena::zeroed(3, Populate::Eager).unwrap();
        assert_eq!(arena.len(), 8);
    }
}
