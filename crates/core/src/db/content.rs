//! Generic get-or-create primitive used by the in-memory metastore.
//!
//! A `ContentTable` maps a normalized content key to a dense, 1-based id and
//! owns the record stored under that id. Index and records sit behind a single
//! mutex, so a record is always readable as soon as its id has been handed out
//! and two callers racing on the same key observe exactly one creation.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

use crate::db::{MetastoreError, MetastoreResult};

/// `(id, created)` pair returned by [`ContentTable::get_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Created {
    pub id: u64,
    pub created: bool,
}

#[derive(Debug)]
struct Inner<K, V> {
    index: HashMap<K, u64>,
    records: Vec<V>,
}

#[derive(Debug)]
pub struct ContentTable<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> Default for ContentTable<K, V> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { index: HashMap::new(), records: Vec::new() }) }
    }
}

impl<K, V> ContentTable<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the id stored under `key`, or build and store a new record.
    ///
    /// `build` receives the id the new record will get. `on_hit` is applied to
    /// the existing record when the key is already present; it is how a
    /// mapping's capability flags get merged without a second write path.
    pub fn get_or_create<B, H>(&self, key: K, build: B, on_hit: H) -> MetastoreResult<Created>
    where
        B: FnOnce(u64) -> V,
        H: FnOnce(&mut V),
    {
        let mut guard = self.inner.lock().map_err(|_| MetastoreError::Poisoned)?;
        if let Some(&id) = guard.index.get(&key) {
            let slot = slot(id);
            if let Some(record) = guard.records.get_mut(slot) {
                on_hit(record);
            }
            return Ok(Created { id, created: false });
        }

        let id = guard.records.len() as u64 + 1;
        let record = build(id);
        guard.records.push(record);
        guard.index.insert(key, id);
        Ok(Created { id, created: true })
    }

    pub fn get(&self, id: u64) -> MetastoreResult<Option<V>> {
        let guard = self.inner.lock().map_err(|_| MetastoreError::Poisoned)?;
        if id == 0 {
            return Ok(None);
        }
        Ok(guard.records.get(slot(id)).cloned())
    }

    /// Mutate the record stored under `id` in place.
    ///
    /// Returns `Ok(None)` when no such record exists; otherwise the closure's result.
    pub fn update<R, F>(&self, id: u64, f: F) -> MetastoreResult<Option<R>>
    where
        F: FnOnce(&mut V) -> R,
    {
        let mut guard = self.inner.lock().map_err(|_| MetastoreError::Poisoned)?;
        if id == 0 {
            return Ok(None);
        }
        Ok(guard.records.get_mut(slot(id)).map(f))
    }

    /// Snapshot of all records in id order.
    pub fn values(&self) -> MetastoreResult<Vec<V>> {
        let guard = self.inner.lock().map_err(|_| MetastoreError::Poisoned)?;
        Ok(guard.records.clone())
    }

    pub fn len(&self) -> MetastoreResult<usize> {
        let guard = self.inner.lock().map_err(|_| MetastoreError::Poisoned)?;
        Ok(guard.records.len())
    }

    pub fn is_empty(&self) -> MetastoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

fn slot(id: u64) -> usize {
    (id - 1) as usize
}
