//! Registration and lookup of map/reduce function pairs.
//!
//! The registry does not load code itself. A [`Loader`] turns the bytes a
//! client uploads into a pair of callable functions; the default
//! [`BuiltinLoader`] only understands the names of the programs compiled
//! into this crate.

use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;

use crate::Status;

/// Maps one key/value pair to a partial result.
pub type MapFn = Arc<dyn Fn(&str, &[u8]) -> Vec<u8> + Send + Sync>;

/// Combines the partial results of every map call into the final answer.
pub type ReduceFn = Arc<dyn Fn(Vec<Vec<u8>>) -> Vec<u8> + Send + Sync>;

/// Turns uploaded code into a map/reduce pair.
pub trait Loader: Send + Sync {
    /// Returns `None` if `code` is not something this loader understands.
    fn load(&self, code: &[u8]) -> Option<(MapFn, ReduceFn)>;

    /// Called once when the owning registry shuts down.
    fn release(&self) {}
}

/// Recognizes the builtin programs by name: `all_keys` and `odd_key_vals`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinLoader;

impl Loader for BuiltinLoader {
    fn load(&self, code: &[u8]) -> Option<(MapFn, ReduceFn)> {
        let name = std::str::from_utf8(code).ok()?.trim();
        let pair: (MapFn, ReduceFn) = match name {
            "all_keys" => (Arc::new(all_keys_map), Arc::new(all_keys_reduce)),
            "odd_key_vals" => {
                (Arc::new(odd_key_vals_map), Arc::new(odd_key_vals_reduce))
            }
            _ => return None,
        };
        Some(pair)
    }
}

fn all_keys_map(key: &str, _value: &[u8]) -> Vec<u8> {
    key.as_bytes().to_vec()
}

fn all_keys_reduce(results: Vec<Vec<u8>>) -> Vec<u8> {
    let mut ret = vec![];
    for result in results {
        if !ret.is_empty() {
            ret.push(b'\n');
        }
        ret.extend_from_slice(&result);
    }
    ret
}

/// The leading integer of `s`, in the manner of C's `atoi`: optional
/// whitespace and sign, then digits up to the first non-digit. Anything
/// unparsable is 0.
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut ret: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        ret = ret.wrapping_mul(10).wrapping_add(i64::from(b - b'0'));
    }

    if negative { ret.wrapping_neg() } else { ret }
}

fn odd_key_vals_map(key: &str, value: &[u8]) -> Vec<u8> {
    let rest = key.get(1..).unwrap_or("");
    if leading_int(rest) & 1 == 1 { value.to_vec() } else { vec![] }
}

fn odd_key_vals_reduce(results: Vec<Vec<u8>>) -> Vec<u8> {
    let mut ret = vec![];
    for result in results.iter().filter(|r| !r.is_empty()) {
        if !ret.is_empty() {
            ret.push(b'\n');
        }
        ret.extend_from_slice(result);
        ret.extend_from_slice(result);
    }
    ret
}

/// A name-indexed table of registered map/reduce pairs.
pub struct FunctionRegistry {
    loader: Box<dyn Loader>,
    // `None` once shut down
    functions: RwLock<Option<FnvHashMap<String, (MapFn, ReduceFn)>>>,
}

impl FunctionRegistry {
    pub fn new(loader: Box<dyn Loader>) -> FunctionRegistry {
        FunctionRegistry {
            loader,
            functions: RwLock::new(Some(FnvHashMap::default())),
        }
    }

    /// Associates `name` with the pair loaded from `code`.
    ///
    /// Returns `ErrSo` if the name is taken, the loader does not
    /// understand `code`, or the registry has been shut down.
    pub fn register(&self, name: &str, code: &[u8]) -> Status {
        let mut functions = self.functions.write();
        let Some(functions) = functions.as_mut() else {
            return Status::ErrSo;
        };

        if functions.contains_key(name) {
            log::debug!("refusing to re-register map/reduce function {name:?}");
            return Status::ErrSo;
        }

        match self.loader.load(code) {
            Some(pair) => {
                functions.insert(name.to_owned(), pair);
                log::debug!("registered map/reduce function {name:?}");
                Status::Ok
            }
            None => {
                log::debug!(
                    "unrecognized code for map/reduce function {name:?}"
                );
                Status::ErrSo
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<(MapFn, ReduceFn)> {
        self.functions.read().as_ref()?.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.read().as_ref().map_or(0, |functions| functions.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every registered pair and releases the loader. Later
    /// registrations fail and lookups find nothing.
    pub fn shutdown(&self) {
        if self.functions.write().take().is_some() {
            self.loader.release();
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> FunctionRegistry {
        FunctionRegistry::new(Box::new(BuiltinLoader))
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("registered", &self.len())
            .finish()
    }
}
