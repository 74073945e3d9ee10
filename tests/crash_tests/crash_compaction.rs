use super::*;

// often enough that many crashes land inside a snapshot rewrite
const PERSIST_EVERY: usize = 7;

/// Upserts slots in order and compacts the log every few writes.
pub fn run_crash_compaction() {
    run_in_thread(COMPACTION_DIR, Some(PERSIST_EVERY))
}
