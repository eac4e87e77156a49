pub(crate) mod simd;

use std::hint;
use std::sync::atomic::{fence, AtomicU8, Ordering};

/// Pads and aligns a value to the length of a cache line.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
// Source: https://github.com/crossbeam-rs/crossbeam/blob/master/crossbeam-utils/src/cache_padded.rs#L63.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "s390x",
    )),
    repr(align(64))
)]
pub struct CachePadded<T> {
    pub value: T,
}

impl<T> From<T> for CachePadded<T> {
    fn from(value: T) -> CachePadded<T> {
        CachePadded { value }
    }
}

/// Acquires a byte spinlock.
///
/// The lock byte must only ever hold 0 (unlocked) or 1 (locked). Critical
/// sections are short (a free-list pop or push), so contention is resolved
/// by spinning with quadratic backoff rather than parking.
#[inline]
pub fn lock_byte(byte: &AtomicU8) -> ByteLockGuard<'_> {
    let mut spun = 0_usize;

    loop {
        if byte
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return ByteLockGuard { byte };
        }

        for _ in 0..(spun * spun) {
            hint::spin_loop();
        }

        spun = (spun + 1).min(16);
    }
}

pub struct ByteLockGuard<'a> {
    byte: &'a AtomicU8,
}

impl Drop for ByteLockGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.byte.store(0, Ordering::Release);
    }
}

/// Runs `read` under a one-byte optimistic version counter, retrying until
/// a consistent snapshot is observed.
///
/// Writers hold the version odd for the duration of a mutation (see
/// [`write_seq`]); readers snapshot an even version, read, and retry if the
/// version moved. All data reached from `read` must be accessed through
/// atomics: a closure running concurrently with a writer can observe a torn
/// *logical* state, and its result is discarded, but the individual loads
/// are still racing with stores.
#[inline]
pub fn read_consistent<T>(version: &AtomicU8, mut read: impl FnMut() -> T) -> T {
    loop {
        let begin = version.load(Ordering::Acquire);

        // a writer is inside the critical section
        if begin & 1 != 0 {
            hint::spin_loop();
            continue;
        }

        let value = read();

        // order the data loads before the version re-check
        fence(Ordering::Acquire);

        if version.load(Ordering::Relaxed) == begin {
            return value;
        }
    }
}

/// Enters a seqlock write section, spinning until the version is even and
/// this thread wins the odd transition.
///
/// Dropping the guard publishes the mutation by bumping the version back to
/// even. Writers on the same version byte are mutually exclusive; readers
/// using [`read_consistent`] never block.
#[inline]
pub fn write_seq(version: &AtomicU8) -> SeqWriteGuard<'_> {
    let mut spun = 0_usize;

    loop {
        let v = version.load(Ordering::Relaxed);

        if v & 1 == 0
            && version
                .compare_exchange_weak(v, v.wrapping_add(1), Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            // order the odd transition before the data stores, so a reader
            // that observed any of them must also observe the odd version
            // on its re-check
            fence(Ordering::Release);
            return SeqWriteGuard { version, begin: v };
        }

        for _ in 0..(spun * spun) {
            hint::spin_loop();
        }

        spun = (spun + 1).min(16);
    }
}

pub struct SeqWriteGuard<'a> {
    version: &'a AtomicU8,
    begin: u8,
}

impl Drop for SeqWriteGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.version
            .store(self.begin.wrapping_add(2), Ordering::Release);
    }
}
