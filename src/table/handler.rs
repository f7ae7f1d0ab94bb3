//! Merge Handlers
//!
//! A merge handler decides how an update combines with the stored value, whether a
//! stored value may be handed to a reader yet, and whether a write should be appended
//! to the shard's checkpoint log.

use crate::error::Result;

use std::marker::PhantomData;
use std::ops::AddAssign;

pub trait MergeHandler<K, V>: Send + Sync {
    /// Rejects an update that can never be applied to `stored`. Runs before
    /// [`Self::update`]; an error here is fatal for the request, not a retry.
    fn check(&self, _key: &K, _stored: &V, _update: &V) -> Result<()> {
        Ok(())
    }

    /// Folds `update` into `stored` in place. `false` means the update could not be
    /// applied now and must be retried.
    fn update(&self, stored: &mut V, update: V) -> bool;

    /// Returns the value visible to a reader asking for `version`, or `None` while the
    /// value is not ready (the request is then requeued, not failed).
    fn get(&self, key: &K, version: u64, stored: &V) -> Option<V>;

    fn is_checkpointable(&self, _key: &K, _value: &V) -> bool {
        false
    }
}

/// Updates overwrite the stored value.
pub struct Replace<V>(PhantomData<fn() -> V>);

impl<V> Default for Replace<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V: Clone> MergeHandler<K, V> for Replace<V> {
    fn update(&self, stored: &mut V, update: V) -> bool {
        *stored = update;
        true
    }

    fn get(&self, _key: &K, _version: u64, stored: &V) -> Option<V> {
        Some(stored.clone())
    }
}

/// Updates are added to the stored value.
pub struct Accumulate<V>(PhantomData<fn() -> V>);

impl<V> Default for Accumulate<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V: Clone + AddAssign> MergeHandler<K, V> for Accumulate<V> {
    fn update(&self, stored: &mut V, update: V) -> bool {
        *stored += update;
        true
    }

    fn get(&self, _key: &K, _version: u64, stored: &V) -> Option<V> {
        Some(stored.clone())
    }
}

/// Keeps the smallest value seen.
pub struct Min<V>(PhantomData<fn() -> V>);

impl<V> Default for Min<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V: Clone + PartialOrd> MergeHandler<K, V> for Min<V> {
    fn update(&self, stored: &mut V, update: V) -> bool {
        if update < *stored {
            *stored = update;
        }
        true
    }

    fn get(&self, _key: &K, _version: u64, stored: &V) -> Option<V> {
        Some(stored.clone())
    }
}

/// Keeps the largest value seen.
pub struct Max<V>(PhantomData<fn() -> V>);

impl<V> Default for Max<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<K, V: Clone + PartialOrd> MergeHandler<K, V> for Max<V> {
    fn update(&self, stored: &mut V, update: V) -> bool {
        if update > *stored {
            *stored = update;
        }
        true
    }

    fn get(&self, _key: &K, _version: u64, stored: &V) -> Option<V> {
        Some(stored.clone())
    }
}

/// Wraps another handler and marks every write for the checkpoint log.
pub struct Checkpointed<H>(pub H);

impl<K, V, H> MergeHandler<K, V> for Checkpointed<H>
where
    H: MergeHandler<K, V>,
{
    fn check(&self, key: &K, stored: &V, update: &V) -> Result<()> {
        self.0.check(key, stored, update)
    }

    fn update(&self, stored: &mut V, update: V) -> bool {
        self.0.update(stored, update)
    }

    fn get(&self, key: &K, version: u64, stored: &V) -> Option<V> {
        self.0.get(key, version, stored)
    }

    fn is_checkpointable(&self, _key: &K, _value: &V) -> bool {
        true
    }
}
