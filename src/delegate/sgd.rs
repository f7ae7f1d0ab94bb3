//! Server-side optimisers.
//!
//! Both handlers fold worker gradients into the stored split and gate reads on the
//! split's version, so a worker asking for step `s` only sees the parameter once every
//! gradient of step `s - 1` has been applied.

use super::param::ParamValue;
use crate::error::{Error, Result};
use crate::table::handler::MergeHandler;

use serde::{Deserialize, Serialize};

/// How a hyper-parameter changes with the step number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    Fixed { base: f32 },
    /// Linear interpolation from `base` to `final_value` over `change_steps`.
    Linear { base: f32, final_value: f32, change_steps: u64 },
    /// Halves every `change_steps`.
    Exponential { base: f32, change_steps: u64 },
    InverseT { base: f32, final_value: f32 },
    Inverse { base: f32, gamma: f32, power: f32 },
    /// `base * gamma^(step / change_steps)` with integer division.
    Step { base: f32, gamma: f32, change_steps: u64 },
}

impl Default for LrSchedule {
    fn default() -> Self {
        LrSchedule::Fixed { base: 0.01 }
    }
}

impl LrSchedule {
    pub fn at(&self, step: u64) -> f32 {
        let s = step as f32;
        match *self {
            LrSchedule::Fixed { base } => base,
            LrSchedule::Linear {
                base,
                final_value,
                change_steps,
            } => {
                let r = s / change_steps.max(1) as f32;
                (1.0 - r) * base + r * final_value
            }
            LrSchedule::Exponential { base, change_steps } => {
                base / 2f32.powf(s / change_steps.max(1) as f32)
            }
            LrSchedule::InverseT { base, final_value } => base / (1.0 + s / final_value),
            LrSchedule::Inverse { base, gamma, power } => base * (1.0 + gamma * s).powf(-power),
            LrSchedule::Step {
                base,
                gamma,
                change_steps,
            } => base * gamma.powi((step / change_steps.max(1)) as i32),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub learning_rate: LrSchedule,
    pub weight_decay: f32,
    pub momentum: f32,
    /// Versions after which every `checkpoint_every`-th one is logged. 0 disables.
    pub checkpoint_after: u64,
    pub checkpoint_every: u64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: LrSchedule::default(),
            weight_decay: 0.0,
            momentum: 0.0,
            checkpoint_after: 0,
            checkpoint_every: 0,
        }
    }
}

impl SgdConfig {
    fn checkpoint_due(&self, version: u64) -> bool {
        self.checkpoint_every > 0
            && version > self.checkpoint_after
            && (version - self.checkpoint_after) % self.checkpoint_every == 0
    }
}

/// A gradient must cover exactly the values of its split.
fn check_gradient(stored: &ParamValue, update: &ParamValue) -> Result<()> {
    if update.grad.len() == stored.data.len() {
        return Ok(());
    }
    tracing::error!(
        "Gradient of split {} has {} values, expected {}",
        stored.split_id,
        update.grad.len(),
        stored.data.len()
    );
    Err(Error::ProtocolViolation(format!(
        "gradient of split {} has {} values, expected {}",
        stored.split_id,
        update.grad.len(),
        stored.data.len()
    )))
}

fn ensure_len(buffer: &mut Vec<f32>, len: usize) {
    if buffer.len() != len {
        buffer.resize(len, 0.0);
    }
}

/// Momentum SGD with weight decay. Gradients are summed into `history` until
/// `threshold` of them have arrived, then applied as their mean.
#[derive(Debug, Clone, Default)]
pub struct SgdHandler {
    config: SgdConfig,
}

impl SgdHandler {
    pub fn new(config: SgdConfig) -> Self {
        Self { config }
    }
}

impl MergeHandler<u64, ParamValue> for SgdHandler {
    fn check(&self, _key: &u64, stored: &ParamValue, update: &ParamValue) -> Result<()> {
        check_gradient(stored, update)
    }

    fn update(&self, stored: &mut ParamValue, update: ParamValue) -> bool {
        let len = stored.data.len();
        if update.grad.len() != len {
            return false;
        }
        ensure_len(&mut stored.history, len);

        let lr = self.config.learning_rate.at(stored.version) * stored.lr_mult;
        let wd = self.config.weight_decay * stored.wd_mult;

        for i in 0..len {
            stored.history[i] += lr * update.grad[i];
            if wd > 0.0 {
                stored.history[i] += lr * wd * stored.data[i];
            }
        }

        let aggregated = stored.num_aggregate + 1;
        if aggregated >= stored.threshold.max(1) {
            let factor = 1.0 / aggregated as f32;
            for i in 0..len {
                stored.data[i] -= factor * stored.history[i];
                stored.history[i] *= self.config.momentum;
            }
            stored.num_aggregate = 0;
            stored.version = update.version + 1;
        } else {
            stored.num_aggregate = aggregated;
        }
        true
    }

    fn get(&self, _key: &u64, version: u64, stored: &ParamValue) -> Option<ParamValue> {
        stored.ready_for(version).then(|| stored.published())
    }

    fn is_checkpointable(&self, _key: &u64, value: &ParamValue) -> bool {
        self.config.checkpoint_due(value.version)
    }
}

/// AdaGrad. With `threshold > 1` gradients are summed in `grad` and applied once all
/// of them have arrived.
#[derive(Debug, Clone)]
pub struct AdaGradHandler {
    learning_rate: f32,
    config: SgdConfig,
}

impl AdaGradHandler {
    pub fn new(learning_rate: f32, config: SgdConfig) -> Self {
        Self {
            learning_rate,
            config,
        }
    }
}

impl MergeHandler<u64, ParamValue> for AdaGradHandler {
    fn check(&self, _key: &u64, stored: &ParamValue, update: &ParamValue) -> Result<()> {
        check_gradient(stored, update)
    }

    fn update(&self, stored: &mut ParamValue, update: ParamValue) -> bool {
        let len = stored.data.len();
        if update.grad.len() != len {
            return false;
        }
        ensure_len(&mut stored.history, len);

        let grad = if stored.threshold > 1 {
            ensure_len(&mut stored.grad, len);
            for (acc, g) in stored.grad.iter_mut().zip(&update.grad) {
                *acc += g;
            }
            stored.num_aggregate += 1;
            if stored.num_aggregate < stored.threshold {
                return true;
            }
            std::mem::replace(&mut stored.grad, vec![0.0; len])
        } else {
            update.grad
        };

        for i in 0..len {
            stored.history[i] += grad[i] * grad[i];
            if stored.history[i] > 0.0 {
                stored.data[i] -= self.learning_rate * grad[i] / stored.history[i].sqrt();
            }
        }
        stored.num_aggregate = 0;
        stored.version += 1;
        true
    }

    fn get(&self, _key: &u64, version: u64, stored: &ParamValue) -> Option<ParamValue> {
        stored.ready_for(version).then(|| stored.published())
    }

    fn is_checkpointable(&self, _key: &u64, value: &ParamValue) -> bool {
        self.config.checkpoint_due(value.version)
    }
}
