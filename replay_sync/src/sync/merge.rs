//! Parameter-wise merging of two models with the same architecture.
//!
//! Bundled aggregators fold every pushed model into their running aggregate
//! with
//!
//! ```text
//! θ_aggregate = w * θ_pushed + (1 - w) * θ_aggregate
//! ```
//!
//! and serve pulls by loading the aggregate into the caller's model with
//! `w = 1`. Parameters are matched by traversal order, so two independently
//! initialized instances of one architecture merge cleanly; a differing
//! parameter count or shape is reported instead of silently skipped.
//!
//! Merged parameters are detached leaves carrying the target's
//! `require_grad` flag.

use burn::module::{Module, ModuleMapper, Param};
use burn::prelude::*;
use thiserror::Error;

/// Two models could not be merged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("parameter count mismatch: expected {expected}, found {found}")]
    ParamCount { expected: usize, found: usize },

    #[error("parameter {index} has shape {found:?}, expected {expected:?}")]
    Shape {
        index: usize,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Float parameter flattened to 1D, with its original shape.
struct FlatParam<B: Backend> {
    tensor: Tensor<B, 1>,
    shape: Vec<usize>,
}

/// Collects every float parameter of a module in traversal order.
struct ParamCollector<B: Backend> {
    params: Vec<FlatParam<B>>,
}

impl<B: Backend> ModuleMapper<B> for ParamCollector<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let value = param.val().detach();
        let shape = value.dims().to_vec();
        let numel: usize = shape.iter().product();
        self.params.push(FlatParam {
            tensor: value.reshape([numel]),
            shape,
        });
        param
    }
}

/// Blends collected source parameters into a target module.
///
/// The first mismatch is remembered and every later parameter is left as is;
/// callers discard the mapped module when [`BlendMapper::finish`] fails.
struct BlendMapper<B: Backend> {
    source: Vec<FlatParam<B>>,
    weight: f32,
    index: usize,
    error: Option<MergeError>,
}

impl<B: Backend> BlendMapper<B> {
    fn finish(self) -> Result<(), MergeError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.index != self.source.len() {
            return Err(MergeError::ParamCount {
                expected: self.index,
                found: self.source.len(),
            });
        }
        Ok(())
    }
}

impl<B: Backend> ModuleMapper<B> for BlendMapper<B> {
    fn map_float<const D: usize>(&mut self, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let idx = self.index;
        self.index += 1;
        if self.error.is_some() {
            return param;
        }

        let target = param.val();
        let require_grad = target.is_require_grad();
        let shape = target.dims();
        let Some(source) = self.source.get(idx) else {
            // count checked in finish()
            return param;
        };
        if source.shape.as_slice() != shape.as_slice() {
            self.error = Some(MergeError::Shape {
                index: idx,
                expected: shape.to_vec(),
                found: source.shape.clone(),
            });
            return param;
        }

        let pushed = source.tensor.clone().to_device(&target.device()).reshape(shape);
        let blended = if self.weight >= 1.0 {
            pushed
        } else {
            pushed.mul_scalar(self.weight) + target.detach().mul_scalar(1.0 - self.weight)
        };
        Param::initialized(param.id.clone(), blended.detach().set_require_grad(require_grad))
    }
}

/// Move `target` towards `source` by `weight` (0 keeps `target`, 1 copies `source`).
///
/// The result keeps `target`'s parameter ids and devices.
pub fn blend<B, M>(target: M, source: &M, weight: f32) -> Result<M, MergeError>
where
    B: Backend,
    M: Module<B>,
{
    let mut collector = ParamCollector { params: Vec::new() };
    let _ = source.clone().map(&mut collector);

    let mut mapper = BlendMapper {
        source: collector.params,
        weight,
        index: 0,
        error: None,
    };
    let blended = target.map(&mut mapper);
    mapper.finish()?;
    Ok(blended)
}

/// Copy every parameter of `source` into `target`.
pub fn overwrite<B, M>(target: M, source: &M) -> Result<M, MergeError>
where
    B: Backend,
    M: Module<B>,
{
    blend(target, source, 1.0)
}
