//! Occlusion-masked photometric, gradient-consistency and smoothness losses.
//!
//! All reductions are `f32` sums over the full batch x spatial extent. The
//! masked terms deliberately divide by the TOTAL element count rather than
//! the visible count: heavily occluded levels are implicitly down-weighted
//! instead of being renormalized per mask. Do not "fix" this.

use crate::field::Field;
use crate::{FlowError, Result};

/// Charbonnier epsilon; `eps^2 = 1e-6` keeps the gradient finite at zero error.
pub const CHARBONNIER_EPSILON: f32 = 0.001;

/// Edge-awareness sharpness of the smoothness weights,
/// `exp(-EDGE_SHARPNESS * mean_c(|image gradient|))`.
pub const EDGE_SHARPNESS: f32 = 10.0;

/// Per-level weights for the photometric + gradient-consistency terms,
/// index 0 = level 1. All equal in this configuration; alternative schemes
/// (geometric ramps in either direction) ran worse and were retired.
pub const LEVEL_WEIGHTS: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// Global multiplier on the summed smoothness terms.
pub const SMOOTHNESS_WEIGHT: f32 = 10.0;

/// Loss terms for one pyramid level.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LevelLosses {
    pub photometric: f32,
    pub gradient: f32,
    pub smoothness: f32,
}

fn check_same_shape(truth: &Field, pred: &Field) -> Result<()> {
    if !truth.same_shape(pred) {
        return Err(FlowError::Shape(format!(
            "loss inputs disagree: {:?} vs {:?}",
            truth.shape(),
            pred.shape()
        )));
    }
    Ok(())
}

fn check_mask(pred: &Field, mask: &Field) -> Result<()> {
    if mask.channels() != 1 {
        return Err(FlowError::Shape(format!(
            "mask must have 1 channel, got {}",
            mask.channels()
        )));
    }
    if mask.height() != pred.height() || mask.width() != pred.width() {
        return Err(FlowError::Shape(format!(
            "mask resolution {}x{} does not match {}x{}",
            mask.height(),
            mask.width(),
            pred.height(),
            pred.width()
        )));
    }
    Ok(())
}

/// Robust Charbonnier penalty `sqrt((beta * (true - pred))^2 + eps^2)`,
/// averaged over the total element count.
pub fn mean_charb_error(truth: &Field, pred: &Field, beta: f32) -> Result<f32> {
    check_same_shape(truth, pred)?;
    let eps2 = CHARBONNIER_EPSILON * CHARBONNIER_EPSILON;
    let sum: f32 = truth
        .data()
        .iter()
        .zip(pred.data().iter())
        .map(|(t, p)| {
            let d = beta * (t - p);
            (d * d + eps2).sqrt()
        })
        .sum();
    Ok(sum / pred.len() as f32)
}

/// Masked Charbonnier penalty; the single-channel mask is broadcast over
/// channels. The denominator is the total element count of `pred`.
pub fn mean_charb_error_masked(truth: &Field, pred: &Field, mask: &Field, beta: f32) -> Result<f32> {
    check_same_shape(truth, pred)?;
    check_mask(pred, mask)?;
    let eps2 = CHARBONNIER_EPSILON * CHARBONNIER_EPSILON;
    let mut sum = 0.0f32;
    for y in 0..pred.height() {
        for x in 0..pred.width() {
            let m = mask.at(y, x, 0);
            for c in 0..pred.channels() {
                let d = beta * (truth.at(y, x, c) - pred.at(y, x, c));
                sum += (d * d + eps2).sqrt() * m;
            }
        }
    }
    Ok(sum / pred.len() as f32)
}

/// Mean squared error over the total element count.
pub fn mean_squared_error(truth: &Field, pred: &Field) -> Result<f32> {
    check_same_shape(truth, pred)?;
    let sum: f32 = truth
        .data()
        .iter()
        .zip(pred.data().iter())
        .map(|(t, p)| (t - p) * (t - p))
        .sum();
    Ok(sum / pred.len() as f32)
}

/// Mean absolute error over the total element count.
pub fn mean_l1_error(truth: &Field, pred: &Field) -> Result<f32> {
    check_same_shape(truth, pred)?;
    let sum: f32 = truth
        .data()
        .iter()
        .zip(pred.data().iter())
        .map(|(t, p)| (t - p).abs())
        .sum();
    Ok(sum / pred.len() as f32)
}

/// Peak signal-to-noise ratio, for `[0, 1]` images.
pub fn peak_signal_to_noise_ratio(truth: &Field, pred: &Field) -> Result<f32> {
    let mse = mean_squared_error(truth, pred)?;
    Ok(10.0 * (1.0 / mse).log10())
}

/// Gradient-consistency term: Charbonnier on horizontal and vertical first
/// differences of true vs predicted image, each masked by the occlusion mask
/// shifted to the later index, averaged over the two directions.
pub fn image_gradient_error(truth: &Field, pred: &Field, mask: &Field) -> Result<f32> {
    check_same_shape(truth, pred)?;
    check_mask(pred, mask)?;
    let vertical = mean_charb_error_masked(
        &truth.diff_y()?,
        &pred.diff_y()?,
        &mask.drop_first_row()?,
        1.0,
    )?;
    let horizontal = mean_charb_error_masked(
        &truth.diff_x()?,
        &pred.diff_x()?,
        &mask.drop_first_col()?,
        1.0,
    )?;
    Ok((vertical + horizontal) / 2.0)
}

/// Edge-aware smoothness term on the flow field's own first differences.
///
/// Differences are weighted by `exp(-EDGE_SHARPNESS * mean_c(|image
/// gradient|))` so flow discontinuities cost less where the image itself has
/// a strong edge. `beta` is `1 / 2^level`, keeping the penalty comparable in
/// full-resolution pixel units across levels.
pub fn flow_smoothness_error(flow: &Field, image: &Field, beta: f32) -> Result<f32> {
    if flow.height() != image.height() || flow.width() != image.width() {
        return Err(FlowError::Shape(format!(
            "flow resolution {}x{} does not match image {}x{}",
            flow.height(),
            flow.width(),
            image.height(),
            image.width()
        )));
    }
    let weights_y = edge_weights(&image.diff_y()?);
    let weights_x = edge_weights(&image.diff_x()?);
    let vertical = masked_charb_of_diff(&flow.diff_y()?, &weights_y, beta)?;
    let horizontal = masked_charb_of_diff(&flow.diff_x()?, &weights_x, beta)?;
    Ok((vertical + horizontal) / 2.0)
}

fn edge_weights(image_gradient: &Field) -> Field {
    let (height, width, channels) = image_gradient.shape();
    let mut weights = Field::zeros(height, width, 1);
    for y in 0..height {
        for x in 0..width {
            let mut mean_abs = 0.0f32;
            for c in 0..channels {
                mean_abs += image_gradient.at(y, x, c).abs();
            }
            mean_abs /= channels as f32;
            weights.set(y, x, 0, (-EDGE_SHARPNESS * mean_abs).exp());
        }
    }
    weights
}

fn masked_charb_of_diff(diff: &Field, weights: &Field, beta: f32) -> Result<f32> {
    let zeros = Field::zeros(diff.height(), diff.width(), diff.channels());
    mean_charb_error_masked(diff, &zeros, weights, beta)
}

/// Flat combination of the per-level terms: the photometric and
/// gradient-consistency sums enter with [`LEVEL_WEIGHTS`], the smoothness
/// sum is scaled once by [`SMOOTHNESS_WEIGHT`].
pub fn combine_level_losses(levels: &[LevelLosses; 4]) -> f32 {
    let mut photometric_and_gradient = 0.0f32;
    let mut smoothness = 0.0f32;
    for (losses, weight) in levels.iter().zip(LEVEL_WEIGHTS.iter()) {
        photometric_and_gradient += weight * (losses.photometric + losses.gradient);
        smoothness += weight * losses.smoothness;
    }
    photometric_and_gradient + SMOOTHNESS_WEIGHT * smoothness
}
