use std::collections::BTreeMap;
use std::path::Path;
use std::process::exit;
use std::thread;
use std::time::Duration;

use rand::Rng;

use authkv::{Status, Storage};

mod crash_compaction;
mod crash_sequential_upserts;

pub use crash_compaction::run_crash_compaction;
pub use crash_sequential_upserts::run_crash_sequential_upserts;

// test names, also used as dir names
pub const SEQUENTIAL_UPSERTS_DIR: &str = "sequential_upserts";
pub const COMPACTION_DIR: &str = "compaction";

const CRASH_DIR: &str = "crash_test_files";

const USER: &str = "crash";
const PASS: &str = "test";

// keys cycle through this many slots, each pass writing the next
// generation number into every slot
const CYCLE: usize = 64;

fn spawn_killah() {
    thread::spawn(|| {
        let runtime = rand::rng().random_range(0..60_000);
        thread::sleep(Duration::from_micros(runtime));
        exit(9);
    });
}

fn open(test_dir: &str) -> Storage {
    let path = Path::new(CRASH_DIR).join(test_dir).join("db");
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .expect("couldn't create crash test dir");
    }

    let config = crate::common::unlimited_config(path);
    let storage = config.open().expect("couldn't load log");

    match storage.register(USER, PASS).unwrap() {
        Status::Ok | Status::ErrUserExists => {}
        other => panic!("unexpected registration status {other}"),
    }

    storage
}

fn key(slot: usize) -> String {
    format!("slot{slot:03}")
}

fn value(generation: usize) -> Vec<u8> {
    let mut ret = format!("{generation}-").into_bytes();
    let padding = rand::rng().random_range(0..256);
    ret.extend(std::iter::repeat_n(b'.', padding));
    ret
}

fn generation_of(value: &[u8]) -> usize {
    let text = std::str::from_utf8(value).expect("value is not utf-8");
    let digits = text.split('-').next().unwrap_or("");
    digits.parse().unwrap_or_else(|_| panic!("corrupt value {text:?}"))
}

/// Checks that the recovered slots are a consistent prefix of the write
/// sequence and returns the position to resume writing at.
///
/// Writes go to slots in order, so after a crash some leading run of slots
/// holds generation `g` and every later slot holds `g - 1`, or is absent
/// if `g` is the first generation.
fn verify(storage: &Storage) -> usize {
    let mut slots = BTreeMap::new();
    storage
        .for_each_kv(|key, value| {
            slots.insert(key.to_owned(), generation_of(value));
        })
        .unwrap();

    let Some(&highest) = slots.get(&key(0)) else {
        assert!(slots.is_empty(), "slot 0 missing from {slots:?}");
        return 0;
    };

    let contiguous = (0..CYCLE)
        .take_while(|slot| slots.get(&key(*slot)) == Some(&highest))
        .count();

    for slot in contiguous..CYCLE {
        let expected = highest.checked_sub(1);
        assert_eq!(
            slots.get(&key(slot)).copied(),
            expected,
            "slot {slot} out of order, contiguous: {contiguous} \
            highest: {highest} slots: {slots:?}"
        );
    }

    highest * CYCLE + contiguous
}

fn write_forever(
    storage: &Storage,
    mut position: usize,
    persist_every: Option<usize>,
) -> ! {
    loop {
        let slot = position % CYCLE;
        let generation = position / CYCLE;

        let status = storage
            .kv_upsert(USER, PASS, &key(slot), &value(generation))
            .unwrap();
        assert!(!status.is_error(), "upsert failed with {status}");

        position += 1;

        if let Some(every) = persist_every {
            if position % every == 0 {
                storage.persist().unwrap();
            }
        }
    }
}

fn run_inner(test_dir: &str, persist_every: Option<usize>) {
    let crash_during_initialization = rand::rng().random_bool(0.1);

    if crash_during_initialization {
        spawn_killah();
    }

    let storage = open(test_dir);

    if !crash_during_initialization {
        spawn_killah();
    }

    let position = verify(&storage);

    write_forever(&storage, position, persist_every)
}

fn run_in_thread(test_dir: &'static str, persist_every: Option<usize>) {
    let worker = thread::spawn(move || run_inner(test_dir, persist_every));
    if let Err(e) = worker.join() {
        println!("worker thread failed: {:?}", e);
        std::process::exit(15);
    }
}
