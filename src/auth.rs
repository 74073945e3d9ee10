use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::QuotaTracker;

/// Per-user quota limits, shared by every entry created by one engine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QuotaLimits {
    pub up: usize,
    pub down: usize,
    pub req: usize,
    pub duration: Duration,
}

/// One registered user.
#[derive(Debug, Clone)]
pub(crate) struct AuthEntry {
    pub pass_hash: Vec<u8>,
    pub content: Vec<u8>,
    pub uploads: QuotaTracker,
    pub downloads: QuotaTracker,
    pub requests: QuotaTracker,
}

impl AuthEntry {
    pub fn new(
        pass_hash: Vec<u8>,
        content: Vec<u8>,
        limits: &QuotaLimits,
    ) -> AuthEntry {
        AuthEntry {
            pass_hash,
            content,
            uploads: QuotaTracker::new(limits.up, limits.duration),
            downloads: QuotaTracker::new(limits.down, limits.duration),
            requests: QuotaTracker::new(limits.req, limits.duration),
        }
    }
}

/// The stored digest for a password. The username salts the hash so that
/// two users with the same password do not share a digest.
pub(crate) fn hash_password(username: &str, password: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(username.as_bytes());
    hasher.update([0_u8]);
    hasher.update(password.as_bytes());
    hasher.finalize().to_vec()
}
