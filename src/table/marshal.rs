//! Key/value codecs and shard functions.

use crate::error::Result;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Encodes a typed key or value to bytes and back.
pub trait Marshal<T>: Send + Sync {
    fn marshal(&self, value: &T) -> Result<Vec<u8>>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<T>;
}

/// Default codec for any serde type.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeMarshal;

impl<T> Marshal<T> for BincodeMarshal
where
    T: Serialize + DeserializeOwned,
{
    fn marshal(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Maps a key to a shard in `[0, num_shards)`. Must be pure.
pub trait Sharder<K>: Send + Sync {
    fn shard(&self, key: &K, num_shards: usize) -> usize;
}

/// Shards by the key's `Hash` implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashSharder;

impl<K: Hash> Sharder<K> for HashSharder {
    fn shard(&self, key: &K, num_shards: usize) -> usize {
        hash_shard(key, num_shards)
    }
}

/// Shards integer keys by remainder, so consecutive keys land on consecutive shards.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModSharder;

impl<K> Sharder<K> for ModSharder
where
    K: Copy + Into<u64>,
{
    fn shard(&self, key: &K, num_shards: usize) -> usize {
        if num_shards == 0 {
            return 0;
        }
        ((*key).into() % num_shards as u64) as usize
    }
}

pub fn hash_shard<K: Hash + ?Sized>(key: &K, num_shards: usize) -> usize {
    if num_shards == 0 {
        return 0;
    }
    (hash_key(key) % num_shards as u64) as usize
}

/// Stable 64-bit hash. `DefaultHasher::new()` uses fixed keys, so this is
/// identical across processes built from the same toolchain.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
