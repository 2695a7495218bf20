//! In-memory key space.
//!
//! Two independent namespaces live here: plain string keys (`SET`/`GET`/`DEL`)
//! and hash records (`HSET`/`HGET`/`HGETALL`). Each namespace has its own
//! reader/writer lock, so hash traffic never waits on string traffic and
//! readers of one namespace run in parallel.
//!
//! Keys, fields and values are raw bytes. Callers outside the crate go through
//! [`crate::command::CommandTable`]; the typed accessors below are what the
//! command handlers use.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

/// Field map of a single hash record.
///
/// Kept in a `BTreeMap` so `HGETALL` replies come back in a stable order
/// (ascending bytewise by field name) no matter how the record was built.
pub type Fields = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Debug, Default)]
pub struct Keyspace {
    strings: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    hashes: RwLock<HashMap<Vec<u8>, Fields>>,
}

impl Keyspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of string keys plus hash keys.
    pub fn len(&self) -> usize {
        self.strings.read().len() + self.hashes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        self.strings.write().insert(key, value);
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.strings.read().get(key).cloned()
    }

    /// Removes a string key, returning whether it existed.
    pub(crate) fn del(&self, key: &[u8]) -> bool {
        self.strings.write().remove(key).is_some()
    }

    /// Upserts one field of a hash record.
    ///
    /// The existence check and the insert happen under a single write guard,
    /// so two concurrent `HSET`s on a fresh key cannot drop each other's field.
    pub(crate) fn hset(&self, key: Vec<u8>, field: Vec<u8>, value: Vec<u8>) {
        self.hashes
            .write()
            .entry(key)
            .or_default()
            .insert(field, value);
    }

    pub(crate) fn hget(&self, key: &[u8], field: &[u8]) -> Option<Vec<u8>> {
        self.hashes
            .read()
            .get(key)
            .and_then(|fields| fields.get(field))
            .cloned()
    }

    /// Clones the whole record so the read lock is released before the
    /// caller starts building a reply.
    pub(crate) fn hgetall(&self, key: &[u8]) -> Option<Fields> {
        self.hashes.read().get(key).cloned()
    }
}
