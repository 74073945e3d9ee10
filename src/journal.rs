use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fault_injection::{fallible, maybe};
use fs2::FileExt;
use parking_lot::Mutex;

use crate::record::{TAG_LEN, encode_fields};

const TMP_SUFFIX: &str = ".tmp";

struct ActiveLog {
    file: fs::File,
    // length of the file as of the last fully written record
    len: u64,
}

enum State {
    Created,
    Open(ActiveLog),
    ShutDown,
}

struct Inner {
    state: State,
    // the first write failure since the last successful snapshot
    global_error: Option<(io::ErrorKind, String)>,
}

/// The single open, append-only log file behind a storage engine.
///
/// All appends serialize on one mutex, so concurrent writers never
/// interleave bytes. A failed append poisons the journal: the error is
/// remembered and returned by every later append until a snapshot
/// rewrites the whole file from in-memory state.
pub(crate) struct Journal {
    path: PathBuf,
    sync_writes: bool,
    inner: Mutex<Inner>,
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

fn shut_down_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "storage has been shut down")
}

fn not_loaded_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "storage has not been loaded")
}

fn open_locked(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.create(true).read(true).append(true);

    let file = fallible!(options.open(path));
    fallible!(file.try_lock_exclusive());

    Ok(file)
}

#[cfg(unix)]
fn sync_parent_directory(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let directory = fallible!(fs::File::open(parent));
    fallible!(directory.sync_all());
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_directory(_path: &Path) -> io::Result<()> {
    Ok(())
}

impl Journal {
    pub fn new(path: PathBuf, sync_writes: bool) -> Journal {
        Journal {
            path,
            sync_writes,
            inner: Mutex::new(Inner {
                state: State::Created,
                global_error: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens (creating if absent) and locks the log file, and returns its
    /// full contents for replay. Any previously open file is closed first.
    /// A leftover temporary snapshot from an interrupted compaction is
    /// removed.
    pub fn open(&self) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock();

        // release our own lock before taking a new one on the same file
        inner.state = State::Created;

        let existed = self.path.exists();
        let mut file = open_locked(&self.path)?;

        // a temporary snapshot belongs to whoever holds the lock
        let tmp = tmp_path(&self.path);
        if tmp.exists() {
            log::warn!("removing incomplete snapshot rewrite {tmp:?}");
            fallible!(fs::remove_file(&tmp));
        }

        let mut image = vec![];
        fallible!(file.read_to_end(&mut image));

        if existed {
            log::debug!(
                "read {} bytes of log from {:?}",
                image.len(),
                self.path
            );
        } else {
            log::debug!("no log at {:?}, starting empty", self.path);
        }

        inner.state =
            State::Open(ActiveLog { file, len: image.len() as u64 });
        inner.global_error = None;

        Ok(image)
    }

    pub fn check_open(&self) -> io::Result<()> {
        match self.inner.lock().state {
            State::Open(_) => Ok(()),
            State::Created => Err(not_loaded_error()),
            State::ShutDown => Err(shut_down_error()),
        }
    }

    /// Writes one record and flushes it before returning.
    pub fn append(
        &self,
        tag: &[u8; TAG_LEN],
        fields: &[&[u8]],
    ) -> io::Result<()> {
        let mut bytes = vec![];
        encode_fields(&mut bytes, tag, fields)?;

        let mut inner = self.inner.lock();

        if let Some((kind, reason)) = &inner.global_error {
            return Err(io::Error::new(*kind, reason.clone()));
        }

        let active = match &mut inner.state {
            State::Open(active) => active,
            State::Created => return Err(not_loaded_error()),
            State::ShutDown => return Err(shut_down_error()),
        };

        let write_res = maybe!(active.file.write_all(&bytes))
            .and_then(|_| maybe!(active.file.flush()))
            .and_then(|_| {
                if self.sync_writes {
                    maybe!(active.file.sync_data())
                } else {
                    Ok(())
                }
            });

        match write_res {
            Ok(()) => {
                active.len += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                // try to cut off a torn tail so the log stays replayable
                if let Err(truncate_error) = active.file.set_len(active.len) {
                    log::error!(
                        "failed to truncate torn record from {:?}: {:?}",
                        self.path,
                        truncate_error
                    );
                }

                log::error!(
                    "log append to {:?} failed, refusing further writes \
                    until the next snapshot: {:?}",
                    self.path,
                    e
                );
                inner.global_error = Some((e.kind(), e.to_string()));

                Err(e)
            }
        }
    }

    /// Atomically replaces the log with `snapshot`: the bytes are written
    /// and synced to a temporary file, which is renamed over the log, and
    /// the renamed file becomes the new append target.
    ///
    /// The caller must hold off every concurrent append for the duration,
    /// or appends could land in the replaced file and be lost.
    pub fn install_snapshot(&self, snapshot: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            State::Open(_) => {}
            State::Created => return Err(not_loaded_error()),
            State::ShutDown => return Err(shut_down_error()),
        }

        let tmp = tmp_path(&self.path);
        log::trace!("writing snapshot to {tmp:?}");

        let mut tmp_file = fallible!(fs::File::create(&tmp));
        fallible!(tmp_file.write_all(snapshot));
        fallible!(tmp_file.sync_all());
        drop(tmp_file);

        log::trace!("renaming written snapshot to {:?}", self.path);
        // the old handle still holds the lock on the file being replaced
        fallible!(fs::rename(&tmp, &self.path));

        // the old handle now points at an unlinked file, so it must be
        // replaced before any later step can fail
        let file = match open_locked(&self.path) {
            Ok(file) => file,
            Err(e) => {
                inner.state = State::ShutDown;
                log::error!(
                    "failed to reopen compacted log {:?}: {:?}",
                    self.path,
                    e
                );
                return Err(e);
            }
        };

        inner.state =
            State::Open(ActiveLog { file, len: snapshot.len() as u64 });

        if let Err(e) = sync_parent_directory(&self.path) {
            log::error!(
                "failed to sync directory of compacted log {:?}, \
                refusing further writes until the next snapshot: {:?}",
                self.path,
                e
            );
            inner.global_error = Some((e.kind(), e.to_string()));
            return Err(e);
        }

        if let Some((_, reason)) = inner.global_error.take() {
            log::warn!(
                "compaction of {:?} cleared earlier write failure: {reason}",
                self.path
            );
        }

        Ok(())
    }

    /// Syncs and closes the log file. Later appends fail. Returns `Ok`
    /// without doing anything if the file was not open.
    pub fn shutdown(&self) -> io::Result<()> {
        let mut inner = self.inner.lock();
        let previous = std::mem::replace(&mut inner.state, State::ShutDown);

        if let State::Open(active) = previous {
            log::debug!("closing log {:?} at {} bytes", self.path, active.len);
            fallible!(active.file.sync_all());
        }

        Ok(())
    }

    /// Bytes in the log as of the last complete record.
    pub fn len(&self) -> Option<u64> {
        match &self.inner.lock().state {
            State::Open(active) => Some(active.len),
            _ => None,
        }
    }
}
