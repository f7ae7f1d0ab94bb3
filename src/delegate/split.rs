use crate::error::{Error, Result};

/// Split keys are `param_id * SPLIT_KEY_MULTIPLIER + index`; no parameter may have
/// this many splits, so keys of different parameters never collide.
pub const SPLIT_KEY_MULTIPLIER: u64 = 1 << 24;

/// One contiguous run of a parameter, stored under its own table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub key: u64,
    pub param_id: u32,
    pub index: usize,
    pub offset: usize,
    pub len: usize,
}

impl Split {
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Decides how a parameter is cut into splits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitPolicy {
    pub num_servers: usize,
    pub splits_per_server: usize,
    /// Upper bound on the values carried by one split.
    pub max_split_len: usize,
}

impl SplitPolicy {
    pub fn new(num_servers: usize, splits_per_server: usize, max_split_len: usize) -> Self {
        Self {
            num_servers,
            splits_per_server,
            max_split_len,
        }
    }

    /// Without table servers a parameter is kept whole.
    pub fn is_local(&self) -> bool {
        self.num_servers == 0
    }

    /// Values per split for a parameter of `len` values.
    pub fn split_len(&self, len: usize) -> usize {
        if self.is_local() {
            return len.max(1);
        }

        let target = (self.num_servers * self.splits_per_server.max(1)).max(1);
        let mut per_split = len.div_ceil(target);
        let cap = self.max_split_len.max(1);
        if per_split > cap {
            let target = len.div_ceil(cap);
            per_split = len.div_ceil(target);
        }
        per_split.max(1)
    }

    /// Cuts parameter `param_id` of `len` values into contiguous splits tiling `[0, len)`.
    pub fn split(&self, param_id: u32, len: usize) -> Result<Vec<Split>> {
        let per_split = self.split_len(len);
        let count = len.div_ceil(per_split);
        if count as u64 >= SPLIT_KEY_MULTIPLIER {
            return Err(Error::Config(format!(
                "param {} needs {} splits, limit is {}",
                param_id, count, SPLIT_KEY_MULTIPLIER
            )));
        }

        let splits = (0..count)
            .map(|index| {
                let offset = index * per_split;
                Split {
                    key: param_id as u64 * SPLIT_KEY_MULTIPLIER + index as u64,
                    param_id,
                    index,
                    offset,
                    len: per_split.min(len - offset),
                }
            })
            .collect();
        Ok(splits)
    }
}
