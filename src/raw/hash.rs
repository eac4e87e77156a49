use xxhash_rust::xxh3::xxh3_64_with_seed;

// 2^64 / phi, odd, so multiplication is invertible mod 2^64.
const GOLDEN: u64 = 0x9E3779B97F4A7C15;

// Modular inverse of GOLDEN.
const GOLDEN_INV: u64 = 0xF1DE83E19937733D;

/// A keyed, *invertible* multiplicative mix splitting keys into a quotient
/// bucket and a remainder.
///
/// Tables store only the remainder; the bucket index supplies the low bits.
/// Because the mix is invertible, resize migration can reconstruct the full
/// key from `(bucket, remainder)` alone, which a one-way hash could not do.
#[derive(Debug, Clone, Copy)]
pub struct Quotient {
    seed: u64,
    bits: u32,
    mask: u64,
}

impl Quotient {
    /// A quotient split over `buckets` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `buckets` is not a power of two.
    pub fn new(buckets: usize, seed: u64) -> Quotient {
        assert!(buckets.is_power_of_two());

        Quotient {
            seed,
            bits: buckets.trailing_zeros(),
            mask: (buckets as u64) - 1,
        }
    }

    #[inline]
    pub fn buckets(&self) -> usize {
        (self.mask as usize) + 1
    }

    #[inline]
    pub fn mix(&self, key: u64) -> u64 {
        (key ^ self.seed).wrapping_mul(GOLDEN)
    }

    /// Splits a key into its bucket index and stored remainder.
    #[inline]
    pub fn split(&self, key: u64) -> (usize, u64) {
        let m = self.mix(key);
        ((m & self.mask) as usize, m >> self.bits)
    }

    /// Reassembles the mixed value from a bucket index and remainder.
    #[inline]
    pub fn remix(&self, bucket: usize, rem: u64) -> u64 {
        (rem << self.bits) | bucket as u64
    }

    /// Inverts a mixed value back to the original key.
    #[inline]
    pub fn unmix(&self, m: u64) -> u64 {
        m.wrapping_mul(GOLDEN_INV) ^ self.seed
    }

    /// Reconstructs the original key from a bucket index and remainder.
    #[inline]
    pub fn rejoin(&self, bucket: usize, rem: u64) -> u64 {
        self.unmix(self.remix(bucket, rem))
    }
}

/// A keyed 64-bit avalanche hash of a word-sized key.
#[inline]
pub fn hash_word(key: u64, seed: u64) -> u64 {
    xxh3_64_with_seed(&key.to_le_bytes(), seed)
}

/// A one-byte fingerprint of a stored remainder.
#[inline]
pub fn fingerprint(rem: u64, seed: u64) -> u8 {
    (hash_word(rem, seed) >> 56) as u8
}

/// Routes a key to one of `mask + 1` partitions.
#[inline]
pub fn route(key: u64, seed: u64, mask: usize) -> usize {
    (((key ^ seed).wrapping_mul(GOLDEN) >> 32) as usize) & mask
}

/// Combines a bucket id with a per-entry discriminant into one allocation
/// key. The result is re-hashed for bin selection, so this only needs to
/// separate the inputs, not avalanche them.
#[inline]
pub fn combine(bucket: u64, discriminant: u64) -> u64 {
    (bucket ^ discriminant.rotate_left(32)).wrapping_mul(GOLDEN)
}
