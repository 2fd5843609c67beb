//! Folding low-rank deltas into dense weights.
//!
//! For every targeted layer `W' = W + scale · (B · A)` where `A` (`lora_A`)
//! is `r × in` and `B` (`lora_B`) is `out × r`. Untargeted tensors are
//! carried over untouched. Every layer is validated before any arithmetic
//! runs, so a bad adapter never yields a partially merged model.
//!
//! # Example
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use merge_lora_rs::adapter::{AdapterDelta, LayerDelta};
//! use merge_lora_rs::merge::merge_tensors;
//! use merge_lora_rs::store::TensorMap;
//!
//! # fn main() -> merge_lora_rs::Result<()> {
//! let device = Device::Cpu;
//! let mut base = TensorMap::new();
//! base.insert("w".into(), Tensor::new(&[[1f32, 0.], [0., 1.]], &device)?);
//!
//! let mut delta = AdapterDelta::new();
//! delta.insert("w", LayerDelta {
//!     down: Tensor::new(&[[1f32, 1.]], &device)?,
//!     up: Tensor::new(&[[1f32], [1.]], &device)?,
//!     scale: 0.5,
//! });
//!
//! let merged = merge_tensors(&base, &delta)?;
//! let w: Vec<Vec<f32>> = merged["w"].to_vec2()?;
//! assert_eq!(w, vec![vec![1.5, 0.5], vec![0.5, 1.5]]);
//! # Ok(())
//! # }
//! ```

use candle_core::Tensor;
use indicatif::{ProgressBar, ProgressStyle};

use crate::adapter::{AdapterDelta, LayerDelta};
use crate::error::{MergeError, Result};
use crate::model::{BaseModel, MergedModel};
use crate::store::TensorMap;

/// Counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Tensors that received a delta.
    pub layers_merged: usize,
    /// Tensors copied unchanged.
    pub layers_copied: usize,
}

/// Matrix view of a base weight and its factors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    out_features: usize,
    in_features: usize,
    rank: usize,
}

fn mismatch(layer: &str, weight: &Tensor, delta: &LayerDelta) -> MergeError {
    MergeError::ShapeMismatch {
        layer: layer.to_string(),
        base: weight.dims().to_vec(),
        down: delta.down.dims().to_vec(),
        up: delta.up.dims().to_vec(),
    }
}

/// Check that the factors fit `weight` and return the matrix geometry.
///
/// Weights of rank > 2 (convolution kernels) are viewed as
/// `out × prod(rest)`; `lora_A` may carry the same trailing dims and
/// `lora_B`'s trailing dims must all be 1.
fn check_shapes(layer: &str, weight: &Tensor, delta: &LayerDelta, fan_in_fan_out: bool) -> Result<Geometry> {
    let base = weight.dims();
    let down = delta.down.dims();
    let up = delta.up.dims();

    if base.len() < 2 || down.len() < 2 || up.len() < 2 {
        return Err(mismatch(layer, weight, delta));
    }
    if fan_in_fan_out && base.len() != 2 {
        return Err(mismatch(layer, weight, delta));
    }

    let (out_features, in_features) = if fan_in_fan_out {
        (base[1], base[0])
    } else {
        (base[0], base[1..].iter().product())
    };
    let rank = down[0];
    let down_in: usize = down[1..].iter().product();

    let fits = down_in == in_features
        && up[0] == out_features
        && up[1] == rank
        && up[2..].iter().all(|&d| d == 1);
    if !fits {
        return Err(mismatch(layer, weight, delta));
    }

    Ok(Geometry {
        out_features,
        in_features,
        rank,
    })
}

fn ensure_float(layer: &str, weight: &Tensor) -> Result<()> {
    if weight.dtype().is_float() {
        Ok(())
    } else {
        Err(MergeError::malformed(
            layer,
            format!("cannot merge into a {:?} tensor", weight.dtype()),
        ))
    }
}

/// Apply one layer's delta, producing a new tensor in the weight's dtype.
///
/// A scale of exactly zero returns the base tensor unchanged.
#[allow(clippy::float_cmp)]
fn apply_delta(weight: &Tensor, delta: &LayerDelta, geometry: Geometry, fan_in_fan_out: bool) -> Result<Tensor> {
    if delta.scale == 0.0 {
        return Ok(weight.clone());
    }

    let dtype = weight.dtype();
    let device = weight.device();
    let down = delta
        .down
        .reshape((geometry.rank, geometry.in_features))?
        .to_dtype(dtype)?
        .to_device(device)?;
    let up = delta
        .up
        .reshape((geometry.out_features, geometry.rank))?
        .to_dtype(dtype)?
        .to_device(device)?;

    let mut product = up.matmul(&down)?;
    if fan_in_fan_out {
        product = product.t()?;
    }
    let update = (product.reshape(weight.shape())? * delta.scale)?;
    Ok(weight.add(&update)?)
}

/// Merge a delta into a bare tensor mapping.
///
/// # Errors
///
/// Returns [`MergeError::UnknownLayer`] if the delta targets a name the base
/// lacks and [`MergeError::ShapeMismatch`] if factor shapes disagree with the
/// base weight. Nothing is computed unless every layer passes.
pub fn merge_tensors(base: &TensorMap, delta: &AdapterDelta) -> Result<TensorMap> {
    merge_tensors_with_report(base, delta).map(|(tensors, _)| tensors)
}

/// [`merge_tensors`] that also reports how many tensors were touched.
///
/// # Errors
///
/// See [`merge_tensors`].
pub fn merge_tensors_with_report(base: &TensorMap, delta: &AdapterDelta) -> Result<(TensorMap, MergeReport)> {
    let fan_in_fan_out = delta.fan_in_fan_out();

    let mut plan = Vec::with_capacity(delta.len());
    for (layer, layer_delta) in delta.iter() {
        let weight = base.get(layer).ok_or_else(|| MergeError::UnknownLayer {
            layer: layer.clone(),
        })?;
        ensure_float(layer, weight)?;
        let geometry = check_shapes(layer, weight, layer_delta, fan_in_fan_out)?;
        plan.push((layer, weight, layer_delta, geometry));
    }

    let progress = ProgressBar::new(plan.len() as u64);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} merging [{wide_bar:.cyan/blue}] {pos:>4}/{len:4} {msg}")?
            .progress_chars("#>-"),
    );

    let mut merged = base.clone();
    for (layer, weight, layer_delta, geometry) in plan {
        tracing::trace!(
            "Merging {} ({}x{}, r={}, scale={})",
            layer,
            geometry.out_features,
            geometry.in_features,
            geometry.rank,
            layer_delta.scale
        );
        let updated = apply_delta(weight, layer_delta, geometry, fan_in_fan_out)?;
        merged.insert(layer.clone(), updated);
        progress.set_message(layer.clone());
        progress.inc(1);
    }
    progress.finish_and_clear();

    let report = MergeReport {
        layers_merged: delta.len(),
        layers_copied: base.len() - delta.len(),
    };
    Ok((merged, report))
}

/// Merge an adapter into a base model.
///
/// Pure: both inputs are borrowed immutably and a new [`MergedModel`] is
/// returned.
///
/// # Errors
///
/// See [`merge_tensors`].
pub fn merge(base: &BaseModel, delta: &AdapterDelta) -> Result<MergedModel> {
    let (tensors, report) = merge_tensors_with_report(base.tensors(), delta)?;
    tracing::info!(
        "Merged {} layers, copied {} unchanged",
        report.layers_merged,
        report.layers_copied
    );
    Ok(MergedModel::new(tensors, base.files().clone()))
}
