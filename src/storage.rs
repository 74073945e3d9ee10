use std::convert::Infallible;
use std::fmt;
use std::io;
use std::path::Path;

use rayon::prelude::*;

use crate::auth::{AuthEntry, QuotaLimits, hash_password};
use crate::record::{
    AUTH_DIFF, AUTH_ENTRY, Decoder, KV_DELETE, KV_ENTRY, KV_UPDATE, Record,
    TAG_LEN, encode_fields,
};
use crate::{
    BuiltinLoader, Config, FunctionRegistry, Loader, MruTracker, Reply,
    ShardedMap, Status,
};
use crate::journal::Journal;

/// The longest username accepted, in bytes.
pub const MAX_USERNAME: usize = 64;
/// The longest password accepted, in bytes.
pub const MAX_PASSWORD: usize = 128;
/// The longest key accepted, in bytes.
pub const MAX_KEY: usize = 128;
/// The largest value accepted, in bytes.
pub const MAX_VALUE: usize = 1024 * 1024;
/// The largest user content blob accepted, in bytes.
pub const MAX_CONTENT: usize = 1024 * 1024;

fn valid_name(name: &str, max: usize) -> bool {
    !name.is_empty() && name.len() <= max
}

fn valid_credentials(user: &str, pass: &str) -> bool {
    valid_name(user, MAX_USERNAME) && valid_name(pass, MAX_PASSWORD)
}

fn join_lines<I, T>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut ret = vec![];
    for item in items {
        if !ret.is_empty() {
            ret.push(b'\n');
        }
        ret.extend_from_slice(item.as_ref());
    }
    ret
}

fn no_op<K, V>(_: &K, _: &V) -> Result<(), Infallible> {
    Ok(())
}

fn snapshot_entry(
    acc: &mut io::Result<Vec<u8>>,
    tag: &[u8; TAG_LEN],
    fields: &[&[u8]],
) {
    let res = match acc {
        Ok(buf) => encode_fields(buf, tag, fields),
        Err(_) => return,
    };
    if let Err(e) = res {
        *acc = Err(e);
    }
}

/// Resources one request consumes beyond its single request unit.
#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    up: usize,
    down: usize,
}

fn consume(entry: &mut AuthEntry, usage: Usage) {
    entry.requests.add(1);
    if usage.up > 0 {
        entry.uploads.add(usage.up);
    }
    if usage.down > 0 {
        entry.downloads.add(usage.down);
    }
}

/// The authenticated key/value storage engine.
///
/// `Storage` owns a table of users and a table of key/value pairs, each a
/// [`ShardedMap`], plus the log file that makes them durable. Every
/// mutating request writes one record to the log from inside the bucket
/// lock of the entry it changes, and only commits the in-memory change
/// once the record is flushed. [`Storage::persist`] compacts the log to
/// one base record per live entry.
///
/// Request operations return `Ok(Status)` or `Ok(Reply)` for every outcome
/// a client should see, including failed logins and exhausted quotas.
/// `Err` is reserved for failures of the engine itself: a log write that
/// did not reach the file, or a request made before [`Storage::load`] or
/// after [`Storage::shutdown`].
///
/// # Examples
///
/// ```
/// # fn main() -> std::io::Result<()> {
/// use authkv::{Config, Status};
///
/// let dir = tempdir::TempDir::new("authkv_doc").unwrap();
/// let storage = Config::new(dir.path().join("db")).open()?;
///
/// assert_eq!(storage.register("alice", "pw")?, Status::Ok);
/// assert_eq!(storage.kv_insert("alice", "pw", "k1", b"v1")?, Status::Ok);
/// assert_eq!(storage.kv_get("alice", "pw", "k1")?, Ok(b"v1".to_vec()));
/// # Ok(()) }
/// ```
pub struct Storage {
    config: Config,
    limits: QuotaLimits,
    auth: ShardedMap<String, AuthEntry>,
    kv: ShardedMap<String, Vec<u8>>,
    mru: MruTracker,
    functions: FunctionRegistry,
    journal: Journal,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.config.path)
            .field("auth", &self.auth)
            .field("kv", &self.kv)
            .field("functions", &self.functions)
            .finish_non_exhaustive()
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        if let Err(e) = self.journal.shutdown() {
            log::error!("failed to shut down storage on drop: {e:?}");
        }
        self.functions.shutdown();
    }
}

impl Storage {
    /// Create an engine with the builtin map/reduce loader. No file is
    /// touched until [`Storage::load`].
    pub fn new(config: Config) -> Storage {
        Storage::with_loader(config, Box::new(BuiltinLoader))
    }

    pub fn with_loader(config: Config, loader: Box<dyn Loader>) -> Storage {
        let limits = QuotaLimits {
            up: config.quota_up,
            down: config.quota_down,
            req: config.quota_req,
            duration: config.quota_duration,
        };

        Storage {
            limits,
            auth: ShardedMap::new(config.buckets),
            kv: ShardedMap::new(config.buckets),
            mru: MruTracker::new(config.top_size),
            functions: FunctionRegistry::new(loader),
            journal: Journal::new(config.path.clone(), config.sync_writes),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn path(&self) -> &Path {
        self.journal.path()
    }

    /// Replace the in-memory state with the contents of the log file,
    /// creating an empty log if there is none, and open it for appending.
    ///
    /// The file stays locked against other engines until shutdown. A log
    /// that cannot be parsed fails the load and leaves the engine shut
    /// down.
    pub fn load(&self) -> io::Result<()> {
        let image = self.journal.open()?;

        self.auth.clear();
        self.kv.clear();
        self.mru.clear();

        let mut replayed = 0_usize;
        for record in Decoder::new(&image) {
            match record {
                Ok(record) => self.replay(record),
                Err(e) => {
                    log::error!(
                        "failed to load {:?} after {replayed} records: {e:?}",
                        self.path()
                    );
                    self.journal.shutdown()?;
                    return Err(e);
                }
            }
            replayed += 1;
        }

        log::debug!(
            "loaded {} users and {} keys from {replayed} records in {:?}",
            self.auth.len(),
            self.kv.len(),
            self.path()
        );

        Ok(())
    }

    fn replay(&self, record: Record) {
        log::trace!("replaying {}", String::from_utf8_lossy(record.tag()));
        match record {
            Record::Auth { username, pass_hash, content } => {
                let entry = AuthEntry::new(pass_hash, content, &self.limits);
                let Ok(_) = self.auth.upsert(username, entry, no_op, no_op);
            }
            Record::Kv { key, value } | Record::KvUpdate { key, value } => {
                let Ok(_) = self.kv.upsert(key, value, no_op, no_op);
            }
            Record::AuthDiff { username, content } => {
                let found = self
                    .auth
                    .mutate(&username, |entry| entry.content = content);
                if found.is_none() {
                    log::warn!(
                        "skipping content update for unknown user {username:?}"
                    );
                }
            }
            Record::KvDelete { key } => {
                let Ok(removed) = self.kv.remove(&key, no_op);
                if !removed {
                    log::trace!("skipping delete of absent key {key:?}");
                }
            }
        }
    }

    /// Rewrite the log as one base record per live user and key/value
    /// pair.
    ///
    /// Both tables are frozen for the duration: every user bucket, then
    /// every key/value bucket, is read-locked before the snapshot is
    /// serialized, and no lock is released until the new file has replaced
    /// the old one.
    pub fn persist(&self) -> io::Result<()> {
        self.journal.check_open()?;

        let before = self.journal.len().unwrap_or(0);

        self.auth.fold_readonly(
            Ok(vec![]),
            |acc, username, entry| {
                snapshot_entry(
                    acc,
                    AUTH_ENTRY,
                    &[
                        username.as_bytes(),
                        entry.pass_hash.as_slice(),
                        entry.content.as_slice(),
                    ],
                )
            },
            |acc| {
                self.kv.fold_readonly(
                    acc,
                    |acc, key, value| {
                        snapshot_entry(
                            acc,
                            KV_ENTRY,
                            &[key.as_bytes(), value.as_slice()],
                        )
                    },
                    |acc| -> io::Result<()> {
                        let snapshot = acc?;
                        self.journal.install_snapshot(&snapshot)?;
                        log::debug!(
                            "compacted {:?} from {before} to {} bytes",
                            self.path(),
                            snapshot.len()
                        );
                        Ok(())
                    },
                )
            },
        )
    }

    /// Close the log file and release loaded map/reduce functions. Every
    /// later request fails.
    pub fn shutdown(&self) -> io::Result<()> {
        self.functions.shutdown();
        self.journal.shutdown()
    }

    pub fn len_users(&self) -> usize {
        self.auth.len()
    }

    pub fn len_keys(&self) -> usize {
        self.kv.len()
    }

    /// Visit every key/value pair under a consistent view of the whole
    /// table.
    pub fn for_each_kv<F>(&self, mut f: F) -> io::Result<()>
    where
        F: FnMut(&str, &[u8]),
    {
        self.journal.check_open()?;
        self.kv.for_each_readonly(|key, value| f(key, value), || ());
        Ok(())
    }

    fn check_password(&self, user: &str, pass: &str) -> bool {
        let pass_hash = hash_password(user, pass);
        self.auth
            .mutate_readonly(user, |entry| entry.pass_hash == pass_hash)
            .unwrap_or(false)
    }

    // Authenticates `user` and checks every quota the request consumes
    // under the user's bucket lock. With `commit`, the consumption is
    // recorded once all checks pass.
    fn admit(
        &self,
        user: &str,
        pass: &str,
        usage: Usage,
        commit: bool,
    ) -> Result<(), Status> {
        let pass_hash = hash_password(user, pass);

        let res = self
            .auth
            .mutate(user, |entry| {
                if entry.pass_hash != pass_hash {
                    return Err(Status::ErrLogin);
                }
                if !entry.requests.check(1) {
                    return Err(Status::ErrQuotaReq);
                }
                if usage.up > 0 && !entry.uploads.check(usage.up) {
                    return Err(Status::ErrQuotaUp);
                }
                if usage.down > 0 && !entry.downloads.check(usage.down) {
                    return Err(Status::ErrQuotaDown);
                }

                if commit {
                    consume(entry, usage);
                }

                Ok(())
            })
            .unwrap_or(Err(Status::ErrLogin));

        if let Err(status) = res {
            if status != Status::ErrLogin {
                log::debug!("rejecting request from {user:?}: {status}");
            }
        }

        res
    }

    // Records consumption for a request that `admit` already let through.
    fn charge(&self, user: &str, usage: Usage) {
        self.auth.mutate(user, |entry| consume(entry, usage));
    }

    /// Add a user with empty content.
    pub fn register(&self, user: &str, pass: &str) -> io::Result<Status> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) {
            return Ok(Status::ErrMsgFmt);
        }

        let entry =
            AuthEntry::new(hash_password(user, pass), vec![], &self.limits);

        let inserted =
            self.auth.insert(user.to_owned(), entry, |username, entry| {
                self.journal.append(
                    AUTH_ENTRY,
                    &[
                        username.as_bytes(),
                        entry.pass_hash.as_slice(),
                        entry.content.as_slice(),
                    ],
                )
            })?;

        if inserted {
            log::debug!("registered user {user:?}");
            Ok(Status::Ok)
        } else {
            Ok(Status::ErrUserExists)
        }
    }

    /// Whether `user` exists and `pass` is their password.
    pub fn authenticate(&self, user: &str, pass: &str) -> io::Result<bool> {
        self.journal.check_open()?;
        Ok(valid_credentials(user, pass) && self.check_password(user, pass))
    }

    /// Replace the caller's content blob.
    pub fn set_user_data(
        &self,
        user: &str,
        pass: &str,
        content: &[u8],
    ) -> io::Result<Status> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) || content.len() > MAX_CONTENT {
            return Ok(Status::ErrMsgFmt);
        }

        let pass_hash = hash_password(user, pass);

        let res = self.auth.mutate(user, |entry| -> io::Result<Status> {
            if entry.pass_hash != pass_hash {
                return Ok(Status::ErrLogin);
            }
            self.journal.append(AUTH_DIFF, &[user.as_bytes(), content])?;
            entry.content = content.to_vec();
            Ok(Status::Ok)
        });

        res.unwrap_or(Ok(Status::ErrLogin))
    }

    /// Fetch `target`'s content blob on behalf of `requestor`.
    ///
    /// A target whose content is empty yields `ErrNoData`, the same as a
    /// target that never set any.
    pub fn get_user_data(
        &self,
        requestor: &str,
        pass: &str,
        target: &str,
    ) -> io::Result<Reply> {
        self.journal.check_open()?;

        if !valid_credentials(requestor, pass)
            || !valid_name(target, MAX_USERNAME)
        {
            return Ok(Err(Status::ErrMsgFmt));
        }
        if !self.check_password(requestor, pass) {
            return Ok(Err(Status::ErrLogin));
        }

        let content =
            self.auth.mutate_readonly(target, |entry| entry.content.clone());

        let reply = match content {
            None => Err(Status::ErrNoUser),
            Some(content) if content.is_empty() => Err(Status::ErrNoData),
            Some(content) => Ok(content),
        };

        Ok(reply)
    }

    /// Every registered username, newline separated.
    pub fn get_all_users(
        &self,
        requestor: &str,
        pass: &str,
    ) -> io::Result<Reply> {
        self.journal.check_open()?;

        if !valid_credentials(requestor, pass) {
            return Ok(Err(Status::ErrMsgFmt));
        }
        if !self.check_password(requestor, pass) {
            return Ok(Err(Status::ErrLogin));
        }

        let users = self.auth.fold_readonly(
            vec![],
            |acc, username, _| acc.push(username.clone()),
            |acc| acc,
        );

        // the requestor exists, but a concurrent load may have cleared it
        if users.is_empty() {
            return Ok(Err(Status::ErrNoData));
        }

        Ok(Ok(join_lines(users)))
    }

    /// Insert `key` if it does not exist yet.
    ///
    /// Upload bytes are only charged if the value is stored.
    pub fn kv_insert(
        &self,
        user: &str,
        pass: &str,
        key: &str,
        value: &[u8],
    ) -> io::Result<Status> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass)
            || !valid_name(key, MAX_KEY)
            || value.len() > MAX_VALUE
        {
            return Ok(Status::ErrMsgFmt);
        }

        let usage = Usage { up: value.len(), down: 0 };
        if let Err(status) = self.admit(user, pass, usage, false) {
            return Ok(status);
        }

        let inserted = self.kv.insert(
            key.to_owned(),
            value.to_vec(),
            |key, value| -> io::Result<()> {
                self.journal
                    .append(KV_ENTRY, &[key.as_bytes(), value.as_slice()])?;
                self.mru.insert(key);
                Ok(())
            },
        )?;

        if !inserted {
            self.charge(user, Usage::default());
            return Ok(Status::ErrKey);
        }

        self.charge(user, usage);
        Ok(Status::Ok)
    }

    pub fn kv_get(
        &self,
        user: &str,
        pass: &str,
        key: &str,
    ) -> io::Result<Reply> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) || !valid_name(key, MAX_KEY) {
            return Ok(Err(Status::ErrMsgFmt));
        }

        // the download size is only known after the read, so check the
        // request quota first and charge both once the value is in hand
        if let Err(status) = self.admit(user, pass, Usage::default(), false) {
            return Ok(Err(status));
        }

        let value = self.kv.mutate_readonly(key, Vec::clone);
        let down = value.as_ref().map_or(0, Vec::len);

        let usage = Usage { up: 0, down };
        if let Err(status) = self.admit(user, pass, usage, true) {
            return Ok(Err(status));
        }

        let Some(value) = value else {
            return Ok(Err(Status::ErrKey));
        };

        // can race a delete of the same key, which leaves a stale entry
        // until the key is used again
        self.mru.insert(key);
        Ok(Ok(value))
    }

    pub fn kv_delete(
        &self,
        user: &str,
        pass: &str,
        key: &str,
    ) -> io::Result<Status> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) || !valid_name(key, MAX_KEY) {
            return Ok(Status::ErrMsgFmt);
        }
        if let Err(status) = self.admit(user, pass, Usage::default(), false) {
            return Ok(status);
        }

        let removed = self.kv.remove(key, |key, _| -> io::Result<()> {
            self.journal.append(KV_DELETE, &[key.as_bytes()])?;
            self.mru.remove(key);
            Ok(())
        })?;

        self.charge(user, Usage::default());

        if removed { Ok(Status::Ok) } else { Ok(Status::ErrKey) }
    }

    /// Insert or replace `key`. Returns `OkInserted` or `OkUpdated`.
    pub fn kv_upsert(
        &self,
        user: &str,
        pass: &str,
        key: &str,
        value: &[u8],
    ) -> io::Result<Status> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass)
            || !valid_name(key, MAX_KEY)
            || value.len() > MAX_VALUE
        {
            return Ok(Status::ErrMsgFmt);
        }

        let usage = Usage { up: value.len(), down: 0 };
        if let Err(status) = self.admit(user, pass, usage, false) {
            return Ok(status);
        }

        let log_write =
            |tag: &[u8; TAG_LEN], key: &str, value: &[u8]| -> io::Result<()> {
                self.journal.append(tag, &[key.as_bytes(), value])?;
                self.mru.insert(key);
                Ok(())
            };

        let inserted = self.kv.upsert(
            key.to_owned(),
            value.to_vec(),
            |key, value| log_write(KV_ENTRY, key, value),
            |key, value| log_write(KV_UPDATE, key, value),
        )?;

        self.charge(user, usage);

        if inserted { Ok(Status::OkInserted) } else { Ok(Status::OkUpdated) }
    }

    /// Every key, newline separated.
    pub fn kv_all(&self, user: &str, pass: &str) -> io::Result<Reply> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) {
            return Ok(Err(Status::ErrMsgFmt));
        }
        if let Err(status) = self.admit(user, pass, Usage::default(), true) {
            return Ok(Err(status));
        }

        let keys = self.kv.fold_readonly(
            vec![],
            |acc, key, _| acc.push(key.clone()),
            |acc| acc,
        );

        if keys.is_empty() {
            return Ok(Err(Status::ErrNoData));
        }

        Ok(Ok(join_lines(keys)))
    }

    /// The most recently used keys, newline separated, most recent first.
    pub fn kv_top(&self, user: &str, pass: &str) -> io::Result<Reply> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) {
            return Ok(Err(Status::ErrMsgFmt));
        }
        if let Err(status) = self.admit(user, pass, Usage::default(), true) {
            return Ok(Err(status));
        }

        let keys = self.mru.get();

        if keys.is_empty() {
            return Ok(Err(Status::ErrNoData));
        }

        Ok(Ok(join_lines(keys)))
    }

    /// Register a map/reduce pair under `name`. Only the configured admin
    /// may do this.
    pub fn register_mr(
        &self,
        user: &str,
        pass: &str,
        name: &str,
        code: &[u8],
    ) -> io::Result<Status> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass)
            || !valid_name(name, MAX_KEY)
            || code.len() > MAX_VALUE
        {
            return Ok(Status::ErrMsgFmt);
        }
        if user != self.config.admin_name || !self.check_password(user, pass) {
            return Ok(Status::ErrLogin);
        }

        Ok(self.functions.register(name, code))
    }

    /// Run the map function registered as `name` over every key/value
    /// pair, then reduce the results.
    ///
    /// The pairs are copied out under a consistent view of the table, and
    /// the map calls run in parallel with the locks released. Results reach
    /// the reduce function in scan order.
    pub fn invoke_mr(
        &self,
        user: &str,
        pass: &str,
        name: &str,
    ) -> io::Result<Reply> {
        self.journal.check_open()?;

        if !valid_credentials(user, pass) || !valid_name(name, MAX_KEY) {
            return Ok(Err(Status::ErrMsgFmt));
        }
        if !self.check_password(user, pass) {
            return Ok(Err(Status::ErrLogin));
        }

        let Some((map, reduce)) = self.functions.lookup(name) else {
            return Ok(Err(Status::ErrSo));
        };

        let pairs: Vec<(String, Vec<u8>)> = self.kv.fold_readonly(
            vec![],
            |acc, key, value| acc.push((key.clone(), value.clone())),
            |acc| acc,
        );

        let mapped: Vec<Vec<u8>> =
            pairs.par_iter().map(|(key, value)| map(key, value)).collect();

        log::trace!(
            "reducing {} results of map/reduce function {name:?}",
            mapped.len()
        );

        Ok(Ok(reduce(mapped)))
    }
}
