//! Acceptance scenario: an image pair related by a uniform 2-pixel
//! horizontal shift, evaluated with a predictor that returns the true shift
//! at every level. The combined loss must collapse to the Charbonnier floor
//! and the end-point error must vanish.

use spiral_flow::compose::{scale_for_level, COARSEST_LEVEL, FINEST_LEVEL, FLOW_SCALE};
use spiral_flow::field::Field;
use spiral_flow::loss::CHARBONNIER_EPSILON;
use spiral_flow::trainer::LossGraph;
use spiral_flow::{
    CpuWarp, FlowBatch, FlowPredictor, FlowSample, ImagePyramid, Result, UnsupervisedFlowGraph,
};

const SHIFT_X: f32 = 2.0;

/// Ideal predictor: at every level it returns exactly the residual that
/// turns the initial guess into the true normalized flow.
struct OraclePredictor {
    shift_x: f32,
    shift_y: f32,
}

impl FlowPredictor for OraclePredictor {
    fn parameter_len(&self) -> usize {
        0
    }

    fn predict(
        &self,
        _params: &[f32],
        reference: &Field,
        _target: &Field,
        initial_flow: &Field,
        _level: usize,
    ) -> Result<Field> {
        let mut residual = Field::zeros(reference.height(), reference.width(), 2);
        for y in 0..residual.height() {
            for x in 0..residual.width() {
                residual.set(y, x, 0, self.shift_x / FLOW_SCALE - initial_flow.at(y, x, 0));
                residual.set(y, x, 1, self.shift_y / FLOW_SCALE - initial_flow.at(y, x, 1));
            }
        }
        Ok(residual)
    }
}

/// Affine image pair: bilinear resampling and area pooling are both exact on
/// affine signals, so the only photometric residue is the Charbonnier floor.
fn shifted_affine_pair(height: usize, width: usize) -> FlowSample {
    let value = |y: f32, x: f32, c: usize| -> f32 {
        0.2 + 0.3 * x / (width - 1) as f32 + 0.25 * y / (height - 1) as f32 + 0.05 * c as f32
    };
    let mut image1 = Field::zeros(height, width, 3);
    let mut image2 = Field::zeros(height, width, 3);
    let mut flow = Field::zeros(height, width, 2);
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                image1.set(y, x, c, value(y as f32, x as f32, c));
                image2.set(y, x, c, value(y as f32, x as f32 - SHIFT_X, c));
            }
            flow.set(y, x, 0, SHIFT_X);
        }
    }
    FlowSample::new(image1, image2, flow).unwrap()
}

#[test]
fn oracle_predictor_reaches_the_charbonnier_floor() {
    let sample = shifted_affine_pair(64, 64);
    let batch = FlowBatch::new(vec![sample]).unwrap();
    let graph = UnsupervisedFlowGraph::new(
        OraclePredictor {
            shift_x: SHIFT_X,
            shift_y: 0.0,
        },
        CpuWarp,
    );

    let losses = graph.forward(&[], batch.samples()).unwrap();
    // Four levels of (photometric + gradient) floor plus the weighted
    // smoothness floor; the only residue beyond the floor is the clamped
    // right-edge column at the coarse levels. Anything materially above
    // that means the warp or the masking is off.
    assert!(losses.total < 0.08, "total loss {}", losses.total);
    for k in 0..4 {
        assert!(
            losses.photometric[k] < 5.0 * CHARBONNIER_EPSILON,
            "photometric at level {} is {}",
            k + 1,
            losses.photometric[k]
        );
        // Constant flow keeps the smoothness term exactly at the floor.
        assert!(losses.smoothness[k] < 1.2 * CHARBONNIER_EPSILON);
    }
}

#[test]
fn oracle_predictor_has_vanishing_end_point_error() {
    let sample = shifted_affine_pair(64, 64);
    let batch = FlowBatch::new(vec![sample]).unwrap();
    let graph = UnsupervisedFlowGraph::new(
        OraclePredictor {
            shift_x: SHIFT_X,
            shift_y: 0.0,
        },
        CpuWarp,
    );

    let eval = graph.evaluate(&[], batch.samples()).unwrap();
    assert!(eval.epe < 1e-4, "full-resolution EPE {}", eval.epe);
    for (index, epe) in eval.epe_levels.iter().enumerate() {
        assert!(*epe < 1e-4, "EPE at level {} is {}", index + 1, epe);
    }
    // The predicted warp should reconstruct the reference almost exactly.
    let diff: f32 = eval
        .visual
        .predicted_warp
        .data()
        .iter()
        .zip(eval.visual.reference.data().iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f32::max);
    assert!(diff < 0.02, "worst warp residual {diff}");
}

#[test]
fn composed_oracle_flow_is_constant_at_every_level() {
    let sample = shifted_affine_pair(64, 64);
    let reference = ImagePyramid::build(&sample.image1).unwrap();
    let target = ImagePyramid::build(&sample.image2).unwrap();
    let predictor = OraclePredictor {
        shift_x: SHIFT_X,
        shift_y: 0.0,
    };
    let stack = spiral_flow::compose_flow(&predictor, &[], &reference, &target).unwrap();
    for k in FINEST_LEVEL..=COARSEST_LEVEL {
        let flow = stack.level(k);
        let expected_pixels = SHIFT_X / (1u32 << k) as f32;
        for y in 0..flow.height() {
            for x in 0..flow.width() {
                let scaled = flow.at(y, x, 0) * scale_for_level(k);
                assert!(
                    (scaled - expected_pixels).abs() < 1e-5,
                    "level {k} at ({y},{x})"
                );
            }
        }
    }
}
