//! Table Delegate
//!
//! Bridges workers and the parameter table. Every parameter is cut into splits; each
//! split is one table entry keyed by its split key, so one large parameter spreads over
//! many shards and no message exceeds the split cap.
//!
//! Without table servers the delegate keeps one tuple per split in process and runs the
//! merge handler itself.

use super::param::{Param, ParamValue};
use super::split::{Split, SplitPolicy};
use crate::context::ProcessContext;
use crate::error::{Error, Result};
use crate::sync::lock;
use crate::table::global::GlobalTable;
use crate::table::handler::MergeHandler;
use crate::table::marshal::ModSharder;
use crate::table::types::TableDescriptor;
use crate::transport::types::TableId;

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Descriptor of a parameter table: split keys sharded by remainder.
pub fn param_table_descriptor(
    id: TableId,
    num_shards: usize,
    handler: Arc<dyn MergeHandler<u64, ParamValue>>,
) -> TableDescriptor<u64, ParamValue> {
    TableDescriptor::new(id, num_shards, handler).with_sharder(Arc::new(ModSharder))
}

enum Backend {
    Remote(Arc<GlobalTable<u64, ParamValue>>),
    Local {
        handler: Arc<dyn MergeHandler<u64, ParamValue>>,
        tuples: Mutex<HashMap<u64, ParamValue>>,
    },
}

pub struct TableDelegate {
    backend: Backend,
    policy: SplitPolicy,
    /// Stamped on every put: the group count in synchronous mode.
    threshold: u32,
    splits: DashMap<u32, Vec<Split>>,
}

impl TableDelegate {
    pub fn remote(table: Arc<GlobalTable<u64, ParamValue>>, policy: SplitPolicy, threshold: u32) -> Self {
        Self {
            backend: Backend::Remote(table),
            policy,
            threshold: threshold.max(1),
            splits: DashMap::new(),
        }
    }

    pub fn local(handler: Arc<dyn MergeHandler<u64, ParamValue>>) -> Self {
        Self {
            backend: Backend::Local {
                handler,
                tuples: Mutex::new(HashMap::new()),
            },
            policy: SplitPolicy::new(0, 1, usize::MAX),
            threshold: 1,
            splits: DashMap::new(),
        }
    }

    /// Creates table `id` on this process (one shard per table server) and a delegate
    /// over it, or a local delegate when the job has no table servers. Every process
    /// must call this before shard assignment.
    pub fn for_context(
        ctx: &ProcessContext,
        id: TableId,
        handler: Arc<dyn MergeHandler<u64, ParamValue>>,
    ) -> Result<Self> {
        let config = ctx.config();
        if config.num_table_servers == 0 {
            tracing::info!("No table servers, parameters are updated locally");
            return Ok(Self::local(handler));
        }

        let table = ctx.create_table(param_table_descriptor(id, config.num_table_servers, handler))?;
        let policy = SplitPolicy::new(
            config.num_table_servers,
            config.splits_per_server,
            config.max_split_len,
        );
        Ok(Self::remote(table, policy, config.update_threshold()))
    }

    pub fn is_local(&self) -> bool {
        matches!(self.backend, Backend::Local { .. })
    }

    pub fn policy(&self) -> &SplitPolicy {
        &self.policy
    }

    /// Computes and remembers the splits of `param`. Returns the number of splits.
    pub fn register(&self, param: &Param) -> Result<usize> {
        let splits = self.policy.split(param.id, param.len())?;
        let count = splits.len();
        tracing::debug!("Param {} of {} values cut into {} splits", param.id, param.len(), count);
        self.splits.insert(param.id, splits);
        Ok(count)
    }

    pub fn splits(&self, param_id: u32) -> Option<Vec<Split>> {
        self.splits.get(&param_id).map(|entry| entry.value().clone())
    }

    fn splits_for(&self, param: &Param) -> Result<Vec<Split>> {
        if !self.splits.contains_key(&param.id) {
            self.register(param)?;
        }
        let splits = self
            .splits(param.id)
            .ok_or_else(|| Error::Config(format!("param {} has no splits", param.id)))?;

        let covered: usize = splits.iter().map(|split| split.len).sum();
        if covered != param.len() {
            return Err(Error::ProtocolViolation(format!(
                "param {} has {} values, its splits cover {}",
                param.id,
                param.len(),
                covered
            )));
        }
        Ok(splits)
    }

    fn value_of(&self, param: &Param, split: &Split, step: u64) -> ParamValue {
        ParamValue {
            param_id: param.id,
            split_id: split.key,
            offset: split.offset,
            version: step,
            threshold: self.threshold,
            lr_mult: param.lr_mult,
            wd_mult: param.wd_mult,
            ..ParamValue::default()
        }
    }

    /// Stores the current values of `param` as version `step`.
    pub fn put(&self, param: &Param, step: u64) -> Result<()> {
        for split in self.splits_for(param)? {
            let value = ParamValue {
                data: param.data[split.range()].to_vec(),
                ..self.value_of(param, &split, step)
            };

            match &self.backend {
                Backend::Remote(table) => table.put_at(&split.key, &value, step)?,
                Backend::Local { tuples, .. } => {
                    lock(tuples).insert(split.key, value);
                }
            }
        }
        Ok(())
    }

    /// Sends the gradient of `param` computed at `step`.
    pub fn update(&self, param: &Param, step: u64) -> Result<()> {
        if param.grad.len() != param.len() {
            return Err(Error::ProtocolViolation(format!(
                "param {} has {} values but {} gradients",
                param.id,
                param.len(),
                param.grad.len()
            )));
        }

        for split in self.splits_for(param)? {
            let value = ParamValue {
                grad: param.grad[split.range()].to_vec(),
                ..self.value_of(param, &split, step)
            };

            match &self.backend {
                Backend::Remote(table) => {
                    table.update_at(&split.key, &value, step)?;
                }
                Backend::Local { handler, tuples } => {
                    let mut tuples = lock(tuples);
                    let stored = tuples.get_mut(&split.key).ok_or(Error::MissingKey)?;
                    handler.check(&split.key, stored, &value)?;
                    if !handler.update(stored, value) {
                        return Err(Error::ProtocolViolation(format!(
                            "local update of split {} rejected",
                            split.key
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Requests every split of `param` at `step` without waiting.
    pub fn async_get(&self, param: &Param, step: u64) -> Result<()> {
        let Backend::Remote(table) = &self.backend else {
            return Ok(());
        };
        for split in self.splits_for(param)? {
            table.async_get_at(&split.key, step)?;
        }
        Ok(())
    }

    /// Waits until every split requested by [`Self::async_get`] has arrived and copies
    /// each into place. Splits may arrive in any order; each must arrive exactly once.
    pub async fn async_collect(&self, param: &mut Param, step: u64) -> Result<()> {
        let splits = self.splits_for(param)?;

        match &self.backend {
            Backend::Remote(table) => {
                let mut remaining = splits;
                while !remaining.is_empty() {
                    let (index, value) = table
                        .wait_for(|| {
                            remaining.iter().enumerate().find_map(|(i, split)| {
                                match table.try_collect(&split.key) {
                                    Ok(Some(value)) => Some(Ok((i, value))),
                                    Ok(None) => None,
                                    Err(e) => Some(Err(e)),
                                }
                            })
                        })
                        .await??;

                    let split = remaining.swap_remove(index);
                    scatter(param, &split, &value)?;
                }
            }
            Backend::Local { handler, tuples } => {
                let tuples = lock(tuples);
                for split in splits {
                    let stored = tuples.get(&split.key).ok_or(Error::MissingKey)?;
                    let value = handler.get(&split.key, step, stored).ok_or_else(|| {
                        Error::ProtocolViolation(format!(
                            "split {} not ready for step {} in local mode",
                            split.key, step
                        ))
                    })?;
                    scatter(param, &split, &value)?;
                }
            }
        }
        Ok(())
    }

    pub async fn get(&self, param: &mut Param, step: u64) -> Result<()> {
        self.async_get(param, step)?;
        self.async_collect(param, step).await
    }

    pub fn put_all(&self, params: &[Param], step: u64) -> Result<()> {
        params.iter().try_for_each(|param| self.put(param, step))
    }

    pub fn update_all(&self, params: &[Param], step: u64) -> Result<()> {
        params.iter().try_for_each(|param| self.update(param, step))
    }

    pub fn async_get_all(&self, params: &[Param], step: u64) -> Result<()> {
        params.iter().try_for_each(|param| self.async_get(param, step))
    }

    pub async fn collect_all(&self, params: &mut [Param], step: u64) -> Result<()> {
        for param in params.iter_mut() {
            self.async_collect(param, step).await?;
        }
        Ok(())
    }
}

fn scatter(param: &mut Param, split: &Split, value: &ParamValue) -> Result<()> {
    if value.data.len() != split.len || value.offset != split.offset {
        return Err(Error::Corrupt(format!(
            "split {} returned {} values at offset {}, expected {} at {}",
            split.key,
            value.data.len(),
            value.offset,
            split.len,
            split.offset
        )));
    }
    param.data[split.range()].copy_from_slice(&value.data);
    Ok(())
}
