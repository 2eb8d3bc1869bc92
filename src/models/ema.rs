//! Exponential moving average of model parameters.
//!
//! The shadow model never takes part in back-propagation. It starts as a copy
//! of the live model, tracks it exactly during warm-up and is smoothed with
//! `decay * shadow + (1 - decay) * live` afterwards.

use std::marker::PhantomData;

use burn::config::Config;
use burn::module::{Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::tensor::backend::Backend;
use burn::tensor::{Shape, Tensor};

use crate::error::{self, DiffusionError};

#[derive(Config, Debug)]
pub struct EmaConfig {
    /// Weight of the previous shadow value in each update.
    #[config(default = 0.995)]
    pub decay: f64,
    /// Number of steps during which the shadow copies the live parameters.
    #[config(default = 2000)]
    pub warmup_steps: usize,
}

#[derive(Debug)]
pub struct Ema<B: Backend, M: Module<B>> {
    config: EmaConfig,
    shadow: M,
    step: usize,
    _backend: PhantomData<B>,
}

impl<B: Backend, M: Module<B>> Ema<B, M> {
    pub fn new(config: EmaConfig, model: &M) -> Self {
        Self {
            config,
            shadow: model.clone().no_grad(),
            step: 0,
            _backend: PhantomData,
        }
    }

    /// Resumes tracking from a previously saved shadow model.
    pub fn from_shadow(config: EmaConfig, shadow: M, step: usize) -> Self {
        Self {
            config,
            shadow: shadow.no_grad(),
            step,
            _backend: PhantomData,
        }
    }

    /// Updates the shadow after an optimization step of `live`.
    pub fn step(&mut self, live: &M) -> error::Result<()> {
        let shadow = self.shadow.clone();
        self.shadow = if self.step < self.config.warmup_steps {
            reset_parameters(shadow, live)?
        } else {
            update_average(shadow, live, self.config.decay)?
        };
        self.step += 1;

        Ok(())
    }

    pub fn model(&self) -> &M {
        &self.shadow
    }

    pub fn into_model(self) -> M {
        self.shadow
    }

    pub fn steps(&self) -> usize {
        self.step
    }

    pub fn config(&self) -> &EmaConfig {
        &self.config
    }
}

/// Returns `decay * shadow + (1 - decay) * live` for every parameter.
pub fn update_average<B: Backend, M: Module<B>>(
    shadow: M,
    live: &M,
    decay: f64,
) -> error::Result<M> {
    blend(shadow, live, Some(decay))
}

/// Overwrites every parameter of `shadow` with the value from `live`.
pub fn reset_parameters<B: Backend, M: Module<B>>(shadow: M, live: &M) -> error::Result<M> {
    blend(shadow, live, None)
}

fn blend<B: Backend, M: Module<B>>(
    shadow: M,
    live: &M,
    decay: Option<f64>,
) -> error::Result<M> {
    let mut collector = ParamCollector::default();
    live.visit(&mut collector);

    let mut mapper = ShadowMapper {
        live: collector.params.into_iter(),
        decay,
        mismatch: None,
    };
    let shadow = shadow.map(&mut mapper);

    if let Some(mismatch) = mapper.mismatch {
        return Err(DiffusionError::ParameterMismatch(mismatch));
    }
    let remaining = mapper.live.len();
    if remaining > 0 {
        return Err(DiffusionError::ParameterMismatch(format!(
            "live model has {remaining} more parameter tensors than the shadow"
        )));
    }

    Ok(shadow.no_grad())
}

/// Flattened live parameters in visit order, with their original dims.
struct ParamCollector<B: Backend> {
    params: Vec<(Vec<usize>, Tensor<B, 1>)>,
}

impl<B: Backend> Default for ParamCollector<B> {
    fn default() -> Self {
        Self { params: Vec::new() }
    }
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        let shape = tensor.shape();
        let flat = tensor
            .clone()
            .detach()
            .reshape(Shape::new([shape.num_elements()]));
        self.params.push((shape.dims.to_vec(), flat));
    }
}

struct ShadowMapper<B: Backend> {
    live: std::vec::IntoIter<(Vec<usize>, Tensor<B, 1>)>,
    decay: Option<f64>,
    mismatch: Option<String>,
}

impl<B: Backend> ModuleMapper<B> for ShadowMapper<B> {
    fn map_float<const D: usize>(&mut self, id: &ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if self.mismatch.is_some() {
            return tensor;
        }
        let shape = tensor.shape();
        let live = match self.live.next() {
            Some((dims, live)) if dims == shape.dims.to_vec() => live.reshape(shape),
            Some((dims, _)) => {
                self.mismatch = Some(format!(
                    "parameter {id:?} has dims {:?} in the shadow but {dims:?} in the live model",
                    shape.dims
                ));
                return tensor;
            }
            None => {
                self.mismatch = Some(format!("parameter {id:?} is missing from the live model"));
                return tensor;
            }
        };

        let updated = match self.decay {
            Some(decay) => tensor.mul_scalar(decay) + live.mul_scalar(1.0 - decay),
            None => live,
        };

        updated.detach()
    }
}
