// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The per-device forward/loss graph replicated by the trainer.

use crate::compose::{
    compose_flow, occlusion_mask, scale_for_level, COARSEST_LEVEL, FINEST_LEVEL, FLOW_SCALE,
};
use crate::dataset::FlowSample;
use crate::field::Field;
use crate::loss::{
    combine_level_losses, flow_smoothness_error, image_gradient_error, mean_charb_error_masked,
    LevelLosses,
};
use crate::metrics::end_point_error;
use crate::pyramid::ImagePyramid;
use crate::warp::{FlowPredictor, WarpOps};
use crate::{FlowError, Result};

/// Scalar losses of one training step, per-level entries indexed from level 1.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepLosses {
    pub total: f32,
    pub photometric: [f32; 4],
    pub gradient: [f32; 4],
    pub smoothness: [f32; 4],
}

impl StepLosses {
    /// Arithmetic mean across equally sized device shards.
    pub fn mean_of(towers: &[StepLosses]) -> StepLosses {
        let mut merged = StepLosses::default();
        if towers.is_empty() {
            return merged;
        }
        let norm = 1.0 / towers.len() as f32;
        for tower in towers {
            merged.total += tower.total * norm;
            for i in 0..4 {
                merged.photometric[i] += tower.photometric[i] * norm;
                merged.gradient[i] += tower.gradient[i] * norm;
                merged.smoothness[i] += tower.smoothness[i] * norm;
            }
        }
        merged
    }
}

/// One device replica's contribution: losses plus the gradient vector,
/// consumed exactly once by the synchronization step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub losses: StepLosses,
    pub gradients: Vec<f32>,
}

/// Tensors handed to the visualization hook.
#[derive(Debug, Clone)]
pub struct VisualFrame {
    pub reference: Field,
    pub target: Field,
    pub true_flow: Field,
    pub predicted_flow: Field,
    pub true_warp: Field,
    pub predicted_warp: Field,
}

/// Evaluation metrics: full-resolution EPE plus per-level EPE (index 0 =
/// level 1) and the visualization tensors of the first sample.
#[derive(Debug, Clone)]
pub struct EvalOutput {
    pub epe: f32,
    pub epe_levels: [f32; 4],
    pub visual: VisualFrame,
}

/// The differentiable unit the trainer fans out across devices.
///
/// Implementations must be deterministic for a fixed parameter slice and
/// shard; the trainer relies on that to make gradient averaging independent
/// of the device count.
pub trait LossGraph: Send + Sync {
    /// Length of the shared parameter vector.
    fn parameter_len(&self) -> usize;

    /// Forward pass over one batch shard.
    fn forward(&self, params: &[f32], shard: &[FlowSample]) -> Result<StepLosses>;

    /// Forward pass plus the gradient of the combined loss with respect to
    /// every parameter.
    fn gradients(&self, params: &[f32], shard: &[FlowSample]) -> Result<StepOutput>;

    /// Evaluation pass against ground-truth flow, reading the same
    /// parameters the training replicas read.
    fn evaluate(&self, params: &[f32], batch: &[FlowSample]) -> Result<EvalOutput>;
}

/// The unsupervised flow graph: pyramids, bidirectional composition,
/// occlusion masking and the three loss terms per level.
#[derive(Debug)]
pub struct UnsupervisedFlowGraph<P, W> {
    predictor: P,
    warp: W,
    gradient_step: f32,
}

impl<P: FlowPredictor, W: WarpOps> UnsupervisedFlowGraph<P, W> {
    pub fn new(predictor: P, warp: W) -> Self {
        Self {
            predictor,
            warp,
            gradient_step: 1e-3,
        }
    }

    /// Overrides the finite-difference probe step of the reference gradient
    /// path.
    pub fn with_gradient_step(mut self, step: f32) -> Self {
        self.gradient_step = step;
        self
    }

    pub fn predictor(&self) -> &P {
        &self.predictor
    }

    fn sample_losses(&self, params: &[f32], sample: &FlowSample) -> Result<[LevelLosses; 4]> {
        let reference = ImagePyramid::build(&sample.image1)?;
        let target = ImagePyramid::build(&sample.image2)?;
        let forward = compose_flow(&self.predictor, params, &reference, &target)?;
        let backward = compose_flow(&self.predictor, params, &target, &reference)?;

        let mut levels = [LevelLosses::default(); 4];
        for k in FINEST_LEVEL..=COARSEST_LEVEL {
            let mask = occlusion_mask(&self.warp, backward.level(k), k)?;
            let scaled = forward.level(k).scaled(scale_for_level(k));
            let warped = self.warp.sample_backward(target.level(k), &scaled)?;
            let true_image = reference.level(k);
            levels[k - FINEST_LEVEL] = LevelLosses {
                photometric: mean_charb_error_masked(true_image, &warped, &mask, 1.0)?,
                gradient: image_gradient_error(&warped, true_image, &mask)?,
                smoothness: flow_smoothness_error(
                    forward.level(k),
                    true_image,
                    1.0 / (1u32 << k) as f32,
                )?,
            };
        }
        Ok(levels)
    }

    fn sample_evaluation(
        &self,
        params: &[f32],
        sample: &FlowSample,
        want_visual: bool,
    ) -> Result<(f32, [f32; 4], Option<VisualFrame>)> {
        let reference = ImagePyramid::build(&sample.image1)?;
        let target = ImagePyramid::build(&sample.image2)?;
        let forward = compose_flow(&self.predictor, params, &reference, &target)?;

        let (height, width, _) = sample.image1.shape();
        let predicted_full = forward
            .level(FINEST_LEVEL)
            .scaled(FLOW_SCALE)
            .resize_bilinear(height, width)?;
        let epe = end_point_error(&sample.flow, &predicted_full)?;

        let mut epe_levels = [0.0f32; 4];
        for k in FINEST_LEVEL..=COARSEST_LEVEL {
            let factor = (1usize << k) as f32;
            let true_level = sample
                .flow
                .resize_bilinear(height >> k, width >> k)?
                .scaled(1.0 / factor);
            let predicted = forward.level(k).scaled(scale_for_level(k));
            epe_levels[k - FINEST_LEVEL] = end_point_error(&true_level, &predicted)?;
        }

        let visual = if want_visual {
            let true_level1 = sample
                .flow
                .resize_bilinear(height >> 1, width >> 1)?
                .scaled(0.5);
            let predicted_level1 = forward.level(FINEST_LEVEL).scaled(scale_for_level(1));
            Some(VisualFrame {
                reference: reference.level(FINEST_LEVEL).clone(),
                target: target.level(FINEST_LEVEL).clone(),
                true_warp: self
                    .warp
                    .sample_backward(target.level(FINEST_LEVEL), &true_level1)?,
                predicted_warp: self
                    .warp
                    .sample_backward(target.level(FINEST_LEVEL), &predicted_level1)?,
                true_flow: true_level1,
                predicted_flow: predicted_level1,
            })
        } else {
            None
        };
        Ok((epe, epe_levels, visual))
    }

    fn check_shard(shard: &[FlowSample]) -> Result<()> {
        if shard.is_empty() {
            return Err(FlowError::InvalidArgument(
                "device shard must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl<P: FlowPredictor, W: WarpOps> LossGraph for UnsupervisedFlowGraph<P, W> {
    fn parameter_len(&self) -> usize {
        self.predictor.parameter_len()
    }

    fn forward(&self, params: &[f32], shard: &[FlowSample]) -> Result<StepLosses> {
        Self::check_shard(shard)?;
        let norm = 1.0 / shard.len() as f32;
        let mut levels = [LevelLosses::default(); 4];
        for sample in shard {
            for (acc, term) in levels.iter_mut().zip(self.sample_losses(params, sample)?) {
                acc.photometric += term.photometric * norm;
                acc.gradient += term.gradient * norm;
                acc.smoothness += term.smoothness * norm;
            }
        }
        let total = combine_level_losses(&levels);
        if !total.is_finite() {
            return Err(FlowError::NonFinite("combined training loss".to_string()));
        }
        Ok(StepLosses {
            total,
            photometric: levels.map(|l| l.photometric),
            gradient: levels.map(|l| l.gradient),
            smoothness: levels.map(|l| l.smoothness),
        })
    }

    /// Reference gradient path: central finite differences over the
    /// parameter vector. Accelerator-backed predictors are expected to
    /// implement [`LossGraph`] directly with analytic gradients; this path
    /// exists so the CPU pipeline is trainable and testable on its own.
    fn gradients(&self, params: &[f32], shard: &[FlowSample]) -> Result<StepOutput> {
        let losses = self.forward(params, shard)?;
        let step = self.gradient_step;
        let mut probe = params.to_vec();
        let mut gradients = vec![0.0f32; params.len()];
        for i in 0..params.len() {
            probe[i] = params[i] + step;
            let plus = self.forward(&probe, shard)?.total;
            probe[i] = params[i] - step;
            let minus = self.forward(&probe, shard)?.total;
            probe[i] = params[i];
            gradients[i] = (plus - minus) / (2.0 * step);
        }
        Ok(StepOutput { losses, gradients })
    }

    fn evaluate(&self, params: &[f32], batch: &[FlowSample]) -> Result<EvalOutput> {
        Self::check_shard(batch)?;
        let norm = 1.0 / batch.len() as f32;
        let mut epe = 0.0f32;
        let mut epe_levels = [0.0f32; 4];
        let mut visual = None;
        for (index, sample) in batch.iter().enumerate() {
            let (sample_epe, sample_levels, frame) =
                self.sample_evaluation(params, sample, index == 0)?;
            epe += sample_epe * norm;
            for (acc, value) in epe_levels.iter_mut().zip(sample_levels) {
                *acc += value * norm;
            }
            if let Some(frame) = frame {
                visual = Some(frame);
            }
        }
        let visual = visual.ok_or_else(|| {
            FlowError::InvalidArgument("evaluation batch produced no visual frame".to_string())
        })?;
        Ok(EvalOutput {
            epe,
            epe_levels,
            visual,
        })
    }
}
