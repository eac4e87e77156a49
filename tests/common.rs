#![allow(dead_code)]

use stratus::{CloudTable, Config, ConcurrentChainedTable, Placed, SkulkerTable};

/// A fresh configuration with random seeds; tests must hold for any seeds.
pub fn config(capacity: usize) -> Config {
    Config::with_capacity(capacity)
}

/// Number of threads to use for stress testing.
pub fn threads() -> usize {
    num_cpus::get_physical().clamp(2, 16)
}

/// A simple xorshift generator so tests control their own sequences.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Rng {
        Rng(seed | 1)
    }

    pub fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

/// The uniform face of every concurrent table variant, so one test body
/// can run against all of them.
pub trait AnyTable: Send + Sync + Sized {
    fn build(capacity: usize) -> Self;
    fn insert(&self, key: u64, value: u64) -> bool;
    fn get(&self, key: u64) -> Option<u64>;
    fn update(&self, key: u64, value: u64) -> bool;
    fn remove(&self, key: u64) -> bool;
}

impl AnyTable for ConcurrentChainedTable {
    fn build(capacity: usize) -> Self {
        ConcurrentChainedTable::with_config(&config(capacity)).unwrap()
    }

    fn insert(&self, key: u64, value: u64) -> bool {
        self.insert(key, value)
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
}

impl AnyTable for CloudTable {
    fn build(capacity: usize) -> Self {
        CloudTable::with_config(&config(capacity)).unwrap()
    }

    fn insert(&self, key: u64, value: u64) -> bool {
        !matches!(self.insert(key, value), Placed::Full)
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
}

impl AnyTable for SkulkerTable {
    fn build(capacity: usize) -> Self {
        SkulkerTable::with_config(&config(capacity)).unwrap()
    }

    fn insert(&self, key: u64, value: u64) -> bool {
        !matches!(self.insert(key, value), Placed::Full)
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
}
