//! Injected collaborator interfaces and their CPU reference kernels.
//!
//! The per-level prediction network and the differentiable resampling
//! primitives live behind traits so the composition and loss core can be
//! exercised with deterministic stand-ins. [`CpuWarp`] is the reference
//! implementation of the resampling contract: backward sampling is a
//! bilinear, edge-clamped gather; forward splatting is a bilinear
//! scatter-add that drops out-of-frame contributions.

use crate::field::Field;
use crate::{FlowError, Result};

/// Opaque differentiable per-level flow network.
///
/// `params` is the single source-of-truth parameter slice owned by the
/// trainer; every invocation — forward, backward and evaluation replicas —
/// reads the same slice, which is how weight sharing across directions is
/// expressed. The returned flow is a residual correction at the same
/// resolution as `initial_flow`, in the network's normalized units.
pub trait FlowPredictor: Send + Sync {
    /// Length of the parameter vector the predictor reads.
    fn parameter_len(&self) -> usize;

    /// Predicts a residual flow for one pyramid level. `level` selects the
    /// level-specific sub-network and is passed through unchanged.
    fn predict(
        &self,
        params: &[f32],
        reference: &Field,
        target: &Field,
        initial_flow: &Field,
        level: usize,
    ) -> Result<Field>;
}

/// Differentiable image-resampling primitives.
pub trait WarpOps: Send + Sync {
    /// Resamples `image` at each pixel's location plus `flow` (in pixels at
    /// the image's own resolution).
    fn sample_backward(&self, image: &Field, flow: &Field) -> Result<Field>;

    /// Scatters `field` to locations offset by `flow`, accumulating
    /// bilinear-weighted contributions.
    fn splat_forward(&self, field: &Field, flow: &Field) -> Result<Field>;
}

fn check_flow(image: &Field, flow: &Field) -> Result<()> {
    if flow.channels() != 2 {
        return Err(FlowError::Shape(format!(
            "flow must have 2 channels, got {}",
            flow.channels()
        )));
    }
    if image.height() != flow.height() || image.width() != flow.width() {
        return Err(FlowError::Shape(format!(
            "flow resolution {}x{} does not match image {}x{}",
            flow.height(),
            flow.width(),
            image.height(),
            image.width()
        )));
    }
    Ok(())
}

/// Deterministic CPU implementation of the resampling contract.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuWarp;

impl CpuWarp {
    pub fn new() -> Self {
        Self
    }
}

impl WarpOps for CpuWarp {
    fn sample_backward(&self, image: &Field, flow: &Field) -> Result<Field> {
        check_flow(image, flow)?;
        let (height, width, channels) = image.shape();
        let mut out = Field::zeros(height, width, channels);
        for y in 0..height {
            for x in 0..width {
                let sx = x as f32 + flow.at(y, x, 0);
                let sy = y as f32 + flow.at(y, x, 1);
                for c in 0..channels {
                    out.set(y, x, c, image.sample_bilinear(sy, sx, c));
                }
            }
        }
        Ok(out)
    }

    fn splat_forward(&self, field: &Field, flow: &Field) -> Result<Field> {
        check_flow(field, flow)?;
        let (height, width, channels) = field.shape();
        let mut out = Field::zeros(height, width, channels);
        for y in 0..height {
            for x in 0..width {
                let tx = x as f32 + flow.at(y, x, 0);
                let ty = y as f32 + flow.at(y, x, 1);
                let x0 = tx.floor();
                let y0 = ty.floor();
                let fx = tx - x0;
                let fy = ty - y0;
                let corners = [
                    (y0, x0, (1.0 - fy) * (1.0 - fx)),
                    (y0, x0 + 1.0, (1.0 - fy) * fx),
                    (y0 + 1.0, x0, fy * (1.0 - fx)),
                    (y0 + 1.0, x0 + 1.0, fy * fx),
                ];
                for (cy, cx, weight) in corners {
                    if weight == 0.0
                        || cy < 0.0
                        || cx < 0.0
                        || cy >= height as f32
                        || cx >= width as f32
                    {
                        continue;
                    }
                    let (cy, cx) = (cy as usize, cx as usize);
                    for c in 0..channels {
                        let idx = out.index(cy, cx, c);
                        out.data_mut()[idx] += field.at(y, x, c) * weight;
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_flow_sampling_is_identity() {
        let image = Field::new(2, 2, 1, vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let flow = Field::zeros(2, 2, 2);
        let warped = CpuWarp.sample_backward(&image, &flow).unwrap();
        assert_eq!(warped.data(), image.data());
    }

    #[test]
    fn integer_shift_samples_the_neighbor() {
        let image = Field::new(1, 3, 1, vec![0.0, 0.5, 1.0]).unwrap();
        let mut flow = Field::zeros(1, 3, 2);
        for x in 0..3 {
            flow.set(0, x, 0, 1.0);
        }
        let warped = CpuWarp.sample_backward(&image, &flow).unwrap();
        // Last column clamps to the border.
        assert_eq!(warped.data(), &[0.5, 1.0, 1.0]);
    }

    #[test]
    fn zero_flow_splat_preserves_mass() {
        let field = Field::ones(3, 3, 1);
        let flow = Field::zeros(3, 3, 2);
        let splat = CpuWarp.splat_forward(&field, &flow).unwrap();
        assert!(splat.data().iter().all(|v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn out_of_frame_splat_is_dropped() {
        let field = Field::ones(1, 2, 1);
        let mut flow = Field::zeros(1, 2, 2);
        flow.set(0, 0, 0, -3.0);
        let splat = CpuWarp.splat_forward(&field, &flow).unwrap();
        assert!((splat.at(0, 0, 0) - 0.0).abs() < 1e-6);
        assert!((splat.at(0, 1, 0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn mismatched_flow_is_rejected() {
        let image = Field::ones(2, 2, 1);
        let flow = Field::zeros(2, 3, 2);
        assert!(matches!(
            CpuWarp.sample_backward(&image, &flow),
            Err(FlowError::Shape(_))
        ));
    }
}
