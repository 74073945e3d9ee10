use super::*;

/// Upserts slots in order without ever compacting, so recovery replays a
/// growing log of base and update records.
pub fn run_crash_sequential_upserts() {
    run_in_thread(SEQUENTIAL_UPSERTS_DIR, None)
}
