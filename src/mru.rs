use std::collections::VecDeque;

use parking_lot::Mutex;

/// Tracks the most recently touched keys, up to a fixed capacity.
///
/// The list holds no duplicates: touching a key moves it to the front.
/// When an insert pushes the list past its capacity, the least recently
/// touched key is evicted.
#[derive(Debug)]
pub struct MruTracker {
    capacity: usize,
    // most recent at the back
    keys: Mutex<VecDeque<String>>,
}

impl MruTracker {
    pub fn new(capacity: usize) -> MruTracker {
        MruTracker {
            capacity,
            keys: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn insert(&self, key: &str) {
        let mut keys = self.keys.lock();

        if let Some(idx) = keys.iter().position(|k| k == key) {
            keys.remove(idx);
        }

        keys.push_back(key.to_owned());

        while keys.len() > self.capacity {
            keys.pop_front();
        }
    }

    /// Removes `key` if it is tracked. This can leave the tracker holding
    /// fewer than `capacity` keys.
    pub fn remove(&self, key: &str) {
        let mut keys = self.keys.lock();

        if let Some(idx) = keys.iter().position(|k| k == key) {
            keys.remove(idx);
        }
    }

    pub fn clear(&self) {
        self.keys.lock().clear();
    }

    /// The tracked keys, most recent first.
    pub fn get(&self) -> Vec<String> {
        self.keys.lock().iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}
