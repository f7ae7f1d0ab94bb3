use serde::{Deserialize, Serialize};

/// A trainable parameter as seen by the worker: a flat vector of values and the
/// gradient accumulated for it during the current step.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub id: u32,
    pub data: Vec<f32>,
    pub grad: Vec<f32>,
    pub lr_mult: f32,
    pub wd_mult: f32,
}

impl Param {
    pub fn new(id: u32, data: Vec<f32>) -> Self {
        let grad = vec![0.0; data.len()];
        Self {
            id,
            data,
            grad,
            lr_mult: 1.0,
            wd_mult: 1.0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The table value stored under one split key.
///
/// Puts carry `data`; updates carry `grad`. `history` holds the optimiser state on the
/// server and is created on the first update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamValue {
    pub param_id: u32,
    pub split_id: u64,
    /// Position of this split inside the parameter.
    pub offset: usize,
    pub data: Vec<f32>,
    pub grad: Vec<f32>,
    pub history: Vec<f32>,
    /// Step this value is valid for. Readers asking for a later step wait.
    pub version: u64,
    /// Gradients folded in since the last apply.
    pub num_aggregate: u32,
    /// Gradients to aggregate before one apply: the group count in synchronous mode.
    pub threshold: u32,
    pub lr_mult: f32,
    pub wd_mult: f32,
}

impl ParamValue {
    /// Ready for a reader at `version` once the stored step has caught up and no
    /// partial aggregation is pending.
    pub fn ready_for(&self, version: u64) -> bool {
        version <= self.version && self.num_aggregate == 0
    }

    /// The part of the value a reader gets back.
    pub fn published(&self) -> ParamValue {
        ParamValue {
            param_id: self.param_id,
            split_id: self.split_id,
            offset: self.offset,
            data: self.data.clone(),
            version: self.version,
            ..ParamValue::default()
        }
    }
}
