mod common;

use std::collections::{HashMap, HashSet};

use common::{config, AnyTable, Rng};
use stratus::{ChainedTable, CloudTable, ConcurrentChainedTable, DereferenceTable, SkulkerTable};

// Every observable value must equal the most recent successful
// insert/update, or be absent after a remove, exactly as a shadow map
// predicts.
fn shadow_round_trip<T: AnyTable>(seed: u64) {
    let table = T::build(1 << 12);
    let mut shadow: HashMap<u64, u64> = HashMap::new();
    let mut rng = Rng::new(seed);

    for step in 0..40_000_u64 {
        match rng.next() % 5 {
            0 | 1 => {
                let (k, v) = (rng.next() % 3000, rng.next());
                if table.insert(k, v) {
                    shadow.insert(k, v);
                }
            }
            2 => {
                let (k, v) = (rng.next() % 3000, rng.next());
                let expect = shadow.get_mut(&k).map(|s| *s = v).is_some();
                assert_eq!(table.update(k, v), expect);
            }
            3 => {
                let k = rng.next() % 3000;
                assert_eq!(table.remove(k), shadow.remove(&k).is_some());
            }
            _ => {
                let k = rng.next() % 3000;
                assert_eq!(table.get(k), shadow.get(&k).copied());
            }
        }

        if step % 5000 == 0 {
            for (&k, &v) in &shadow {
                assert_eq!(table.get(k), Some(v));
            }
        }
    }
}

#[test]
fn concurrent_chained_matches_shadow() {
    shadow_round_trip::<ConcurrentChainedTable>(0x1111);
}

#[test]
fn cloud_matches_shadow() {
    shadow_round_trip::<CloudTable>(0x2222);
}

#[test]
fn skulker_matches_shadow() {
    shadow_round_trip::<SkulkerTable>(0x3333);
}

#[test]
fn sequential_chained_matches_shadow() {
    let mut table = ChainedTable::with_config(&config(1 << 12)).unwrap();
    let mut shadow: HashMap<u64, u64> = HashMap::new();
    let mut rng = Rng::new(0x4444);

    for _ in 0..40_000_u64 {
        match rng.next() % 5 {
            0 | 1 => {
                let (k, v) = (rng.next() % 3000, rng.next());
                assert!(table.insert(k, v));
                shadow.insert(k, v);
            }
            2 => {
                let (k, v) = (rng.next() % 3000, rng.next());
                let expect = shadow.get_mut(&k).map(|s| *s = v).is_some();
                assert_eq!(table.update(k, v), expect);
            }
            3 => {
                let k = rng.next() % 3000;
                assert_eq!(table.remove(k), shadow.remove(&k).is_some());
            }
            _ => {
                let k = rng.next() % 3000;
                assert_eq!(table.get(k), shadow.get(&k).copied());
            }
        }
    }

    assert_eq!(table.len(), shadow.len());
}

#[test]
fn no_false_positives() {
    fn check<T: AnyTable>() {
        let table = T::build(1 << 10);
        let mut inserted = HashSet::new();
        let mut rng = Rng::new(0x5555);

        for _ in 0..500 {
            let k = rng.next() % 100_000;
            if table.insert(k, k) {
                inserted.insert(k);
            }
        }

        // keys never inserted must not resolve, fingerprint collisions or not
        for k in 100_000..110_000_u64 {
            assert_eq!(table.get(k), None);
        }

        // freed keys must not resolve either
        for &k in &inserted {
            assert!(table.remove(k));
            assert_eq!(table.get(k), None);
        }
    }

    check::<ConcurrentChainedTable>();
    check::<CloudTable>();
    check::<SkulkerTable>();
}

#[test]
fn remove_is_idempotent() {
    fn check<T: AnyTable>() {
        let table = T::build(256);

        assert!(!table.remove(7), "removing an absent key is a no-op");

        assert!(table.insert(7, 70));
        assert!(table.insert(8, 80));
        assert!(table.remove(7));
        assert!(!table.remove(7));

        // the second remove disturbed nothing
        assert_eq!(table.get(8), Some(80));
    }

    check::<ConcurrentChainedTable>();
    check::<CloudTable>();
    check::<SkulkerTable>();
}

#[test]
fn dereference_table_contract() {
    let table = DereferenceTable::new(4096, 127, [rand::random(), rand::random()], stratus::Populate::Eager).unwrap();

    let mut ptrs = Vec::new();
    for k in 0..4096_u64 {
        let ptr = table.allocate(k, k * 13);
        assert_ne!(ptr, stratus::NULL_PTR, "allocation never fails");
        ptrs.push((k, ptr));
    }

    for &(k, ptr) in &ptrs {
        assert_eq!(table.query(k, ptr), Some(k * 13));
        assert!(table.update(k, ptr, k));
        assert_eq!(table.query(k, ptr), Some(k));
    }

    for &(k, ptr) in &ptrs {
        table.free(k, ptr);
    }

    // every slot came back: the same load succeeds again
    for &(k, _) in &ptrs {
        assert_ne!(table.allocate(k, k), stratus::NULL_PTR);
    }
}

// The repository smoke test: a 16384-capacity chained table with 127-slot
// bins absorbs a million random odd keys, hands every one back, and
// after freeing them all accepts the same load again without capacity
// errors.
#[test]
fn million_key_smoke() {
    let mut table = ChainedTable::with_config(&config(16384)).unwrap();
    let mut rng = Rng::new(0xabcdef);

    let keys: HashSet<u64> = (0..1_000_000).map(|_| rng.next() | 1).collect();

    for &k in &keys {
        let v = k.wrapping_mul(0x9e37);
        assert!(table.insert(k, v));
        assert_eq!(table.get(k), Some(v), "immediate re-query of {k}");
    }
    assert_eq!(table.len(), keys.len());

    for &k in &keys {
        assert!(table.remove(k));
    }
    assert_eq!(table.len(), 0);
    assert_eq!(table.stats().overflow, 0);

    for &k in &keys {
        assert!(table.insert(k, k));
    }
    assert_eq!(table.len(), keys.len());
}
