//! `authkv` is the storage layer of an authenticated key/value server.
//!
//! A [`Storage`] engine keeps registered users and key/value pairs in two
//! bucket-locked hash tables ([`ShardedMap`]), enforces per-user sliding
//! window quotas ([`QuotaTracker`]), remembers recently used keys
//! ([`MruTracker`]), and makes every change durable by appending a tagged
//! [`Record`] to a log file before acknowledging it. The log can be
//! compacted at any time with [`Storage::persist`], and is replayed into
//! memory by [`Storage::load`].
//!
//! Network transport, the wire protocol and command dispatch live outside
//! this crate: a dispatcher calls the request operations on [`Storage`] with
//! parsed arguments and sends back the [`Status`] or [`Reply`] they return.
//!
//! ```
//! # fn main() -> std::io::Result<()> {
//! use authkv::Status;
//!
//! let dir = tempdir::TempDir::new("authkv_lib_doc").unwrap();
//! let storage = authkv::open_default(dir.path().join("db"))?;
//!
//! storage.register("alice", "pw1")?;
//! assert_eq!(storage.register("alice", "pw2")?, Status::ErrUserExists);
//! let status = storage.kv_upsert("alice", "pw1", "k1", b"v")?;
//! assert_eq!(status, Status::OkInserted);
//!
//! storage.persist()?;
//! # Ok(()) }
//! ```

mod auth;
mod config;
mod functions;
mod journal;
mod mru;
mod quota;
mod record;
mod sharded_map;
mod status;
mod storage;

use std::io;
use std::path::Path;

pub use crate::config::Config;
pub use crate::functions::{
    BuiltinLoader, FunctionRegistry, Loader, MapFn, ReduceFn,
};
pub use crate::mru::MruTracker;
pub use crate::quota::QuotaTracker;
pub use crate::record::{
    AUTH_DIFF, AUTH_ENTRY, Decoder, KV_DELETE, KV_ENTRY, KV_UPDATE, Record,
    TAG_LEN,
};
pub use crate::sharded_map::ShardedMap;
pub use crate::status::{Reply, Status, into_wire};
pub use crate::storage::{
    MAX_CONTENT, MAX_KEY, MAX_PASSWORD, MAX_USERNAME, MAX_VALUE, Storage,
};

/// Opens and loads the log at `path` with the default [`Config`].
pub fn open_default<P: AsRef<Path>>(path: P) -> io::Result<Storage> {
    Config::new(path).open()
}
