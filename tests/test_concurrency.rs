mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use rand::Rng;

use authkv::{ShardedMap, Status, Storage};

use common::unlimited_config;

const N_THREADS: usize = 8;
const N_OPS: usize = 500;
const KEYS_PER_THREAD: usize = 16;

fn kv_state(storage: &Storage) -> BTreeMap<String, Vec<u8>> {
    let mut ret = BTreeMap::new();
    storage
        .for_each_kv(|key, value| {
            ret.insert(key.to_owned(), value.to_vec());
        })
        .unwrap();
    ret
}

// Each thread owns a disjoint set of keys and keeps its own model of
// them, so the final table must equal the union of every model.
fn run_disjoint_writer(
    storage: &Storage,
    id: usize,
) -> BTreeMap<String, Vec<u8>> {
    let mut rng = rand::rng();
    let mut model = BTreeMap::new();

    for op in 0..N_OPS {
        let key = format!("t{id}_k{}", rng.random_range(0..KEYS_PER_THREAD));
        let value = format!("{id}:{op}").into_bytes();

        match rng.random_range(0..3) {
            0 => {
                let status =
                    storage.kv_insert("user", "pw", &key, &value).unwrap();
                if model.contains_key(&key) {
                    assert_eq!(status, Status::ErrKey);
                } else {
                    assert_eq!(status, Status::Ok);
                    model.insert(key, value);
                }
            }
            1 => {
                let status =
                    storage.kv_upsert("user", "pw", &key, &value).unwrap();
                let expected = if model.contains_key(&key) {
                    Status::OkUpdated
                } else {
                    Status::OkInserted
                };
                assert_eq!(status, expected);
                model.insert(key, value);
            }
            _ => {
                let status = storage.kv_delete("user", "pw", &key).unwrap();
                let expected = if model.remove(&key).is_some() {
                    Status::Ok
                } else {
                    Status::ErrKey
                };
                assert_eq!(status, expected);
            }
        }
    }

    model
}

#[test]
fn concurrent_disjoint_writers() {
    common::setup_logger();

    let dir = tempdir::TempDir::new("disjoint_writers").unwrap();
    let path = dir.path().join("db");

    let storage = unlimited_config(&path).open().unwrap();
    storage.register("user", "pw").unwrap();

    let expected: BTreeMap<String, Vec<u8>> = thread::scope(|s| {
        let writers: Vec<_> = (0..N_THREADS)
            .map(|id| {
                let storage = &storage;
                s.spawn(move || run_disjoint_writer(storage, id))
            })
            .collect();

        writers.into_iter().flat_map(|writer| writer.join().unwrap()).collect()
    });

    assert_eq!(kv_state(&storage), expected);

    // the interleaved log replays to the same state
    drop(storage);
    let storage = unlimited_config(&path).open().unwrap();
    assert_eq!(kv_state(&storage), expected);
}

#[test]
fn scans_see_a_prefix_of_sequential_inserts() {
    common::setup_logger();

    let dir = tempdir::TempDir::new("scan_prefix").unwrap();
    let storage = unlimited_config(dir.path().join("db")).open().unwrap();
    storage.register("user", "pw").unwrap();

    const N_KEYS: usize = 2000;
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..N_KEYS {
                let key = format!("{i:06}");
                let status =
                    storage.kv_insert("user", "pw", &key, b"x").unwrap();
                assert_eq!(status, Status::Ok);
            }
            done.store(true, Ordering::SeqCst);
        });

        for _ in 0..2 {
            s.spawn(|| {
                while !done.load(Ordering::SeqCst) {
                    let mut seen = BTreeSet::new();
                    storage
                        .for_each_kv(|key, _| {
                            seen.insert(key.parse::<usize>().unwrap());
                        })
                        .unwrap();

                    // inserts complete in order, so a consistent view holds
                    // exactly the first `seen.len()` of them
                    if let Some(&highest) = seen.iter().next_back() {
                        assert_eq!(
                            highest + 1,
                            seen.len(),
                            "scan saw a torn table"
                        );
                    }
                }
            });
        }
    });

    assert_eq!(storage.len_keys(), N_KEYS);
}

#[test]
fn persist_races_with_writers() {
    common::setup_logger();

    let dir = tempdir::TempDir::new("persist_race").unwrap();
    let path = dir.path().join("db");

    let storage = unlimited_config(&path).open().unwrap();
    storage.register("user", "pw").unwrap();

    let done = AtomicBool::new(false);

    let expected: BTreeMap<String, Vec<u8>> = thread::scope(|s| {
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                storage.persist().unwrap();
            }
        });

        let writers: Vec<_> = (0..4)
            .map(|id| {
                let storage = &storage;
                s.spawn(move || run_disjoint_writer(storage, id))
            })
            .collect();

        let expected: BTreeMap<String, Vec<u8>> = writers
            .into_iter()
            .flat_map(|writer| writer.join().unwrap())
            .collect();
        done.store(true, Ordering::SeqCst);
        expected
    });

    assert_eq!(kv_state(&storage), expected);

    // nothing acknowledged during a compaction was lost from the file
    drop(storage);
    let storage = unlimited_config(&path).open().unwrap();
    assert_eq!(kv_state(&storage), expected);
}

#[test]
fn top_keys_never_outlive_racing_deletes() {
    common::setup_logger();

    let dir = tempdir::TempDir::new("top_race").unwrap();
    let config = authkv::Config {
        top_size: 8,
        ..unlimited_config(dir.path().join("db"))
    };
    let storage = config.open().unwrap();
    storage.register("user", "pw").unwrap();

    // every thread fights over the same few keys
    thread::scope(|s| {
        for _ in 0..N_THREADS {
            s.spawn(|| {
                let mut rng = rand::rng();
                for _ in 0..N_OPS {
                    let key = format!("k{}", rng.random_range(0..4));
                    let res = if rng.random_bool(0.5) {
                        storage.kv_upsert("user", "pw", &key, b"v")
                    } else {
                        storage.kv_delete("user", "pw", &key)
                    };
                    assert!(res.is_ok());
                }
            });
        }
    });

    let live = kv_state(&storage);
    match storage.kv_top("user", "pw").unwrap() {
        Ok(top) => {
            let top = String::from_utf8(top).unwrap();
            for key in top.split('\n') {
                assert!(live.contains_key(key), "{key} was deleted");
            }
            assert_eq!(top.split('\n').count(), live.len());
        }
        Err(status) => {
            assert_eq!(status, Status::ErrNoData);
            assert!(live.is_empty());
        }
    }
}

#[test]
fn sharded_map_concurrent_counters() {
    let map: Arc<ShardedMap<usize, usize>> = Arc::new(ShardedMap::new(4));
    for key in 0..32 {
        assert!(map.insert(key, 0, |_, _| Ok::<(), ()>(())).unwrap());
    }

    let threads: Vec<_> = (0..N_THREADS)
        .map(|_| {
            let map = map.clone();
            thread::spawn(move || {
                let mut rng = rand::rng();
                for _ in 0..N_OPS {
                    let key = rng.random_range(0..32);
                    assert!(map.mutate(&key, |count| *count += 1).is_some());
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    let total = map.fold_readonly(0, |acc, _, count| *acc += count, |acc| acc);
    assert_eq!(total, N_THREADS * N_OPS);
}
