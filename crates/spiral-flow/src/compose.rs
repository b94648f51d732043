//! Coarse-to-fine flow composition and occlusion estimation.

use crate::field::Field;
use crate::pyramid::ImagePyramid;
use crate::warp::{FlowPredictor, WarpOps};
use crate::{FlowError, Result};

/// Fixed rescaling applied to the predictor's normalized flow before it is
/// used to index pixels. Constant across training, shared by the forward
/// warp, the occlusion splat and the EPE metric.
pub const FLOW_SCALE: f32 = 20.0;

/// Finest level the predictor runs at; level 0 is never predicted directly.
pub const FINEST_LEVEL: usize = 1;

/// Coarsest level, where composition starts from an all-zero guess.
pub const COARSEST_LEVEL: usize = 4;

/// Pixel rescale factor for normalized flow at pyramid level `k`.
pub fn scale_for_level(level: usize) -> f32 {
    FLOW_SCALE / (1u32 << level) as f32
}

/// Composed flow fields at levels 1..=4, finest first.
#[derive(Debug, Clone)]
pub struct FlowStack {
    levels: Vec<Field>,
}

impl FlowStack {
    /// The normalized flow at pyramid level `k` (1..=4).
    pub fn level(&self, k: usize) -> &Field {
        &self.levels[k - FINEST_LEVEL]
    }

    pub fn levels(&self) -> &[Field] {
        &self.levels
    }
}

/// Runs the predictor coarse to fine over `reference` and `target` pyramids.
///
/// Level 4 starts from an all-zero initial flow. Each finer level upsamples
/// the previous estimate bilinearly, hands it to the predictor as the
/// initial guess, and adds the returned residual to it: every level only
/// corrects the previous estimate instead of predicting full displacement
/// from scratch. The backward direction is obtained by swapping the
/// pyramids; both directions read the same `params` slice.
pub fn compose_flow<P: FlowPredictor + ?Sized>(
    predictor: &P,
    params: &[f32],
    reference: &ImagePyramid,
    target: &ImagePyramid,
) -> Result<FlowStack> {
    let mut coarse_to_fine: Vec<Field> = Vec::with_capacity(COARSEST_LEVEL);
    for k in (FINEST_LEVEL..=COARSEST_LEVEL).rev() {
        let level_image = reference.level(k);
        let initial = match coarse_to_fine.last() {
            None => Field::zeros(level_image.height(), level_image.width(), 2),
            Some(previous) => previous.resize_bilinear(level_image.height(), level_image.width())?,
        };
        let residual = predictor.predict(params, level_image, target.level(k), &initial, k)?;
        if !residual.same_shape(&initial) {
            return Err(FlowError::Shape(format!(
                "predictor returned shape {:?} at level {k}, expected {:?}",
                residual.shape(),
                initial.shape()
            )));
        }
        coarse_to_fine.push(residual.add(&initial)?);
    }
    coarse_to_fine.reverse();
    Ok(FlowStack {
        levels: coarse_to_fine,
    })
}

/// Derives the per-level visibility mask from the backward-direction flow.
///
/// Splatting a field of ones along the rescaled backward flow measures, for
/// each reference pixel, how much target-frame mass lands on it. Pixels
/// with near-zero accumulated mass have no correspondence in the other view
/// and must not be penalized by the photometric loss. The result is clipped
/// to `[0, 1]`.
pub fn occlusion_mask<W: WarpOps + ?Sized>(
    warp: &W,
    backward_flow: &Field,
    level: usize,
) -> Result<Field> {
    let ones = Field::ones(backward_flow.height(), backward_flow.width(), 1);
    let scaled = backward_flow.scaled(scale_for_level(level));
    let mut mask = warp.splat_forward(&ones, &scaled)?;
    mask.clamp_in_place(0.0, 1.0);
    Ok(mask)
}
