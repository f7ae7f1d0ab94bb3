//! Local Partition
//!
//! Storage for one shard: an open-addressing hash table with linear probing over a
//! bucket array. Only the owning process's dispatcher mutates a partition.
//!
//! ## Invariants
//! - `entries / capacity` never exceeds [`LOAD_FACTOR`] when a new key is inserted;
//!   the array grows to `2 * capacity + 1` first.
//! - `clear` drops entries but keeps the bucket array.

use super::handler::MergeHandler;
use super::marshal::hash_key;
use crate::error::{Error, Result};
use crate::transport::types::ShardId;

use std::hash::Hash;
use std::sync::Arc;

pub const LOAD_FACTOR: f64 = 0.8;

enum Probe {
    Found(usize),
    Vacant(usize),
    Full,
}

pub struct LocalPartition<K, V> {
    shard: ShardId,
    buckets: Vec<Option<(K, V)>>,
    entries: usize,
    handler: Arc<dyn MergeHandler<K, V>>,
}

impl<K, V> LocalPartition<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(shard: ShardId, capacity: usize, handler: Arc<dyn MergeHandler<K, V>>) -> Self {
        Self {
            shard,
            buckets: empty_buckets(capacity.max(1)),
            entries: 0,
            handler,
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn len(&self) -> usize {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn handler(&self) -> &Arc<dyn MergeHandler<K, V>> {
        &self.handler
    }

    fn probe(&self, key: &K) -> Probe {
        let capacity = self.buckets.len();
        let start = (hash_key(key) % capacity as u64) as usize;

        for step in 0..capacity {
            let b = (start + step) % capacity;
            match &self.buckets[b] {
                None => return Probe::Vacant(b),
                Some((k, _)) if k == key => return Probe::Found(b),
                Some(_) => {}
            }
        }
        Probe::Full
    }

    /// Index of the bucket holding `key`, if present.
    pub fn bucket_for_key(&self, key: &K) -> Option<usize> {
        match self.probe(key) {
            Probe::Found(b) => Some(b),
            _ => None,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.bucket_for_key(key).is_some()
    }

    /// Inserts or overwrites `key`. Overwrites bypass the merge handler.
    pub fn put(&mut self, key: K, value: V) {
        loop {
            match self.probe(&key) {
                Probe::Found(b) => {
                    self.buckets[b] = Some((key, value));
                    return;
                }
                Probe::Vacant(b) if !self.over_load_factor() => {
                    self.buckets[b] = Some((key, value));
                    self.entries += 1;
                    return;
                }
                Probe::Vacant(_) | Probe::Full => self.grow(),
            }
        }
    }

    /// Merges `value` into the stored value through the handler. A missing key is
    /// seeded with `value` and always reports success. Fails if the handler rejects
    /// the update as malformed.
    pub fn update(&mut self, key: K, value: V) -> Result<bool> {
        match self.bucket_for_key(&key) {
            Some(b) => match &mut self.buckets[b] {
                Some((stored_key, stored)) => {
                    self.handler.check(stored_key, stored, &value)?;
                    Ok(self.handler.update(stored, value))
                }
                None => Ok(false),
            },
            None => {
                self.put(key, value);
                Ok(true)
            }
        }
    }

    /// Raw stored value. A missing key is an error.
    pub fn get(&self, key: &K) -> Result<&V> {
        self.bucket_for_key(key)
            .and_then(|b| self.buckets[b].as_ref())
            .map(|(_, v)| v)
            .ok_or(Error::MissingKey)
    }

    /// Value as exposed by the handler at `version`; `Ok(None)` means not ready yet.
    pub fn get_ready(&self, key: &K, version: u64) -> Result<Option<V>> {
        let stored = self.get(key)?;
        Ok(self.handler.get(key, version, stored))
    }

    /// Rehashes every live entry into an array of `capacity` buckets.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if capacity < self.entries || capacity == 0 {
            return Err(Error::ProtocolViolation(format!(
                "cannot resize shard {} holding {} entries to {} buckets",
                self.shard, self.entries, capacity
            )));
        }

        let before = self.entries;
        let old = std::mem::replace(&mut self.buckets, empty_buckets(capacity));
        self.entries = 0;

        for (k, v) in old.into_iter().flatten() {
            match self.probe(&k) {
                Probe::Vacant(b) => {
                    self.buckets[b] = Some((k, v));
                    self.entries += 1;
                }
                _ => {
                    return Err(Error::Corrupt(format!(
                        "rehash of shard {} lost an entry",
                        self.shard
                    )));
                }
            }
        }

        debug_assert_eq!(before, self.entries);
        tracing::debug!("Shard {} resized to {} buckets", self.shard, capacity);
        Ok(())
    }

    fn grow(&mut self) {
        let capacity = 2 * self.buckets.len() + 1;
        // Growing can only add room, so the rehash cannot fail.
        if let Err(e) = self.resize(capacity) {
            tracing::error!("Failed to grow shard {}: {}", self.shard, e);
        }
    }

    fn over_load_factor(&self) -> bool {
        self.entries as f64 > self.buckets.len() as f64 * LOAD_FACTOR
    }

    /// Drops every entry, keeping the bucket array.
    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.entries = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.buckets.iter().flatten().map(|(k, v)| (k, v))
    }

    /// Rebuilds the partition from newest-first `entries` (a backward checkpoint scan):
    /// a key is inserted only if absent, stopping once `desired_size` keys are live.
    pub fn restore<I>(&mut self, entries: I, desired_size: usize) -> Result<usize>
    where
        I: IntoIterator<Item = Result<(K, V)>>,
    {
        let mut scanned = 0;
        for entry in entries {
            if self.entries >= desired_size {
                break;
            }
            let (k, v) = entry?;
            scanned += 1;
            if !self.contains(&k) {
                self.put(k, v);
            }
        }

        if self.entries != desired_size {
            return Err(Error::Corrupt(format!(
                "shard {} restored {} of {} entries",
                self.shard, self.entries, desired_size
            )));
        }

        tracing::info!(
            "Restored shard {} with {} entries from {} log records",
            self.shard,
            self.entries,
            scanned
        );
        Ok(scanned)
    }
}

fn empty_buckets<K, V>(capacity: usize) -> Vec<Option<(K, V)>> {
    std::iter::repeat_with(|| None).take(capacity).collect()
}
