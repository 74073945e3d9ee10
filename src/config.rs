use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Storage;

/// Settings for a [`Storage`] engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// The log file. Created on first load if it does not exist.
    pub path: PathBuf,
    /// Buckets in each of the user and key/value tables. Fixed for the
    /// lifetime of the engine. 0 is treated as 1.
    pub buckets: usize,
    /// Bytes a user may upload per quota window. Default is 1mb.
    pub quota_up: usize,
    /// Bytes a user may download per quota window. Default is 1mb.
    pub quota_down: usize,
    /// Key/value requests a user may make per quota window.
    pub quota_req: usize,
    /// The length of the sliding quota window. Default is 60s.
    pub quota_duration: Duration,
    /// How many recently used keys `kv_top` reports.
    pub top_size: usize,
    /// The only user allowed to register map/reduce functions.
    pub admin_name: String,
    /// Call `sync_data` after every log append, not just `flush`.
    pub sync_writes: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: "authkv.db".into(),
            buckets: 1024,
            quota_up: 1024 * 1024,
            quota_down: 1024 * 1024,
            quota_req: 16,
            quota_duration: Duration::from_secs(60),
            top_size: 4,
            admin_name: "admin".into(),
            sync_writes: false,
        }
    }
}

impl Config {
    pub fn new<P: AsRef<Path>>(path: P) -> Config {
        Config { path: path.as_ref().into(), ..Default::default() }
    }

    /// Construct an engine with these settings and load its log.
    pub fn open(&self) -> io::Result<Storage> {
        let storage = Storage::new(self.clone());
        storage.load()?;
        Ok(storage)
    }
}
