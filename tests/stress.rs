mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::{config, threads, AnyTable, Rng};
use stratus::{
    CloudTable, ConcurrentChainedTable, PartitionedTable, Shard, SkulkerTable,
};

// The fill-then-run workload: disjoint keys written across many threads,
// then every key read back concurrently. Each read must observe exactly
// the fill-phase value (linearizable per key).
#[test]
fn fill_then_read_partitioned_cloud() {
    let keys: u64 = if cfg!(miri) {
        1 << 10
    } else if cfg!(stratus_stress) {
        1 << 22
    } else {
        1 << 20
    };
    let value_of = |k: u64| k.wrapping_mul(0x2545f4914f6cdd1d);

    let table: Arc<PartitionedTable<CloudTable>> =
        Arc::new(PartitionedTable::with_config(config(keys as usize)).unwrap());

    let n = threads() as u64;
    let writers: Vec<_> = (0..n)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                let mut handle = table.handle();
                let mut i = t;
                while i < keys {
                    let k = i * 233;
                    assert!(handle.insert(k, value_of(k)));
                    i += n;
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let readers: Vec<_> = (0..n)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                let handle = table.handle();
                let mut i = t;
                while i < keys {
                    let k = i * 233;
                    assert_eq!(handle.get(k), Some(value_of(k)), "key {k}");
                    i += n;
                }
            })
        })
        .collect();
    for r in readers {
        r.join().unwrap();
    }

    assert_eq!(table.len(), keys as usize);
}

// Resize transparency: while writers push a partition well past 10x its
// initial capacity, readers polling the warm-up keys must never observe
// one missing, and at least one partition must grow.
fn resize_transparency<T: Shard + 'static>() {
    let table: Arc<PartitionedTable<T>> =
        Arc::new(PartitionedTable::with_config(config(512)).unwrap());
    let before: Vec<_> = (0..table.partitions())
        .map(|p| table.shard_capacity(p))
        .collect();

    let warm: Arc<Vec<u64>> = Arc::new((0..512).map(|i| i * 7 + 3).collect());
    {
        let mut handle = table.handle();
        for &k in warm.iter() {
            assert!(handle.insert(k, !k));
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let table = table.clone();
            let warm = warm.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let handle = table.handle();
                while !stop.load(Ordering::Relaxed) {
                    for &k in warm.iter() {
                        assert_eq!(handle.get(k), Some(!k), "warm key {k} went missing");
                    }
                }
            })
        })
        .collect();

    let n = threads() as u64;
    let extra: u64 = if cfg!(miri) { 1 << 10 } else { 1 << 16 };
    let writers: Vec<_> = (0..n)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                let mut handle = table.handle();
                let mut rng = Rng::new(t * 77 + 1);
                let mut i = t;
                while i < extra {
                    // stay clear of the warm keys
                    let k = (1 << 32) | (i * 11);
                    assert!(handle.insert(k, rng.next()));
                    i += n;
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    for r in readers {
        r.join().unwrap();
    }

    let grew = (0..table.partitions()).any(|p| table.shard_capacity(p) > before[p]);
    assert!(grew, "10x the initial capacity must trigger a resize");
}

#[test]
fn resize_transparency_cloud() {
    resize_transparency::<CloudTable>();
}

#[test]
fn resize_transparency_skulker() {
    resize_transparency::<SkulkerTable>();
}

#[test]
fn resize_transparency_chained() {
    resize_transparency::<ConcurrentChainedTable>();
}

// A single partition under write pressure from every thread at once:
// each resize must be won by exactly one thread and joined by the rest,
// and no insert may be lost across the repeated migrations.
#[test]
fn resize_storm_single_partition() {
    let mut cfg = config(64);
    cfg.parts = 1;
    let table: Arc<PartitionedTable<SkulkerTable>> =
        Arc::new(PartitionedTable::with_config(cfg).unwrap());
    let before = table.shard_capacity(0);

    let n = threads() as u64;
    let per_thread: u64 = if cfg!(miri) { 256 } else { 1 << 13 };

    let writers: Vec<_> = (0..n)
        .map(|t| {
            let table = table.clone();
            thread::spawn(move || {
                let mut handle = table.handle();
                for i in 0..per_thread {
                    let k = t * per_thread + i;
                    assert!(handle.insert(k, k ^ t));
                    // read-back keeps readers in the join path too
                    if i % 7 == 0 {
                        assert_eq!(handle.get(k), Some(k ^ t));
                    }
                }
            })
        })
        .collect();
    for w in writers {
        w.join().unwrap();
    }

    let handle = table.handle();
    for t in 0..n {
        for i in 0..per_thread {
            let k = t * per_thread + i;
            assert_eq!(handle.get(k), Some(k ^ t), "key {k}");
        }
    }
    drop(handle);

    assert_eq!(table.len(), (n * per_thread) as usize);
    assert!(table.shard_capacity(0) > before);
}

// Per-key linearizability under churn: every thread owns a disjoint key
// space and continuously inserts, overwrites, verifies, and removes its
// own keys while sharing bins and version regions with everyone else.
#[test]
fn disjoint_churn() {
    fn churn<T: AnyTable + 'static>(seed: u64) {
        let table = Arc::new(T::build(1 << 14));
        let n = threads() as u64;
        let rounds = if cfg!(miri) {
            50
        } else if cfg!(stratus_stress) {
            20_000
        } else {
            2000
        };

        let workers: Vec<_> = (0..n)
            .map(|t| {
                let table = table.clone();
                thread::spawn(move || {
                    let mut rng = Rng::new(seed ^ (t * 0x9e37 + 1));
                    let base = t * 1_000_000;

                    for _ in 0..rounds {
                        let mut live = Vec::new();
                        for _ in 0..64_u64 {
                            let k = base + (rng.next() % 512);
                            let v = rng.next();
                            if table.insert(k, v) {
                                live.push((k, v));
                            }
                        }
                        // the most recent write for each key must win
                        let mut latest = std::collections::HashMap::new();
                        for &(k, v) in &live {
                            latest.insert(k, v);
                        }
                        for (&k, &v) in &latest {
                            assert_eq!(table.get(k), Some(v), "key {k}");
                        }
                        for (&k, _) in &latest {
                            assert!(table.remove(k));
                        }
                        for (&k, _) in &latest {
                            assert_eq!(table.get(k), None);
                        }
                    }
                })
            })
            .collect();

        for w in workers {
            w.join().unwrap();
        }
    }

    churn::<ConcurrentChainedTable>(0xaa);
    churn::<CloudTable>(0xbb);
    churn::<SkulkerTable>(0xcc);
}
