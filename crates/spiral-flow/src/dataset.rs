//! Batch contracts consumed from the input pipeline, plus a deterministic
//! synthetic producer used by the example binary and the end-to-end tests.
//!
//! The real pipeline (decode, resize, augment) is an external collaborator;
//! this module only fixes the shape and normalization contracts: images in
//! `[0, 1]`, true flow in raw pixel units at full resolution.

use rand::{rngs::StdRng, Rng};

use crate::config::rng_from_optional;
use crate::field::Field;
use crate::{FlowError, Result};

/// One training sample: an image pair and its ground-truth flow.
#[derive(Debug, Clone)]
pub struct FlowSample {
    pub image1: Field,
    pub image2: Field,
    pub flow: Field,
}

impl FlowSample {
    pub fn new(image1: Field, image2: Field, flow: Field) -> Result<Self> {
        if !image1.same_shape(&image2) {
            return Err(FlowError::Shape(format!(
                "image pair disagrees: {:?} vs {:?}",
                image1.shape(),
                image2.shape()
            )));
        }
        if flow.channels() != 2
            || flow.height() != image1.height()
            || flow.width() != image1.width()
        {
            return Err(FlowError::Shape(format!(
                "true flow {:?} does not match images {:?}",
                flow.shape(),
                image1.shape()
            )));
        }
        Ok(Self {
            image1,
            image2,
            flow,
        })
    }
}

/// Fixed-size batch of samples with identical shapes.
#[derive(Debug, Clone)]
pub struct FlowBatch {
    samples: Vec<FlowSample>,
}

impl FlowBatch {
    pub fn new(samples: Vec<FlowSample>) -> Result<Self> {
        let first = samples.first().ok_or_else(|| {
            FlowError::InvalidArgument("batch must contain at least one sample".to_string())
        })?;
        let shape = first.image1.shape();
        if samples.iter().any(|s| s.image1.shape() != shape) {
            return Err(FlowError::Shape(
                "all samples in a batch must share one resolution".to_string(),
            ));
        }
        Ok(Self { samples })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[FlowSample] {
        &self.samples
    }

    /// Splits the batch into `devices` disjoint, equally sized shards.
    pub fn shards(&self, devices: usize) -> Result<Vec<&[FlowSample]>> {
        if devices == 0 {
            return Err(FlowError::InvalidArgument(
                "device count must be > 0".to_string(),
            ));
        }
        if self.samples.len() % devices != 0 {
            return Err(FlowError::Shape(format!(
                "batch of {} samples does not split across {devices} devices",
                self.samples.len()
            )));
        }
        let shard = self.samples.len() / devices;
        Ok(self.samples.chunks(shard).collect())
    }
}

/// Source of already-decoded training batches.
pub trait BatchProducer {
    fn next_batch(&mut self) -> Result<FlowBatch>;
}

/// Deterministic producer of smooth periodic image pairs related by a known
/// uniform shift. The second image is the first translated by `(shift_x,
/// shift_y)` pixels, so the ground-truth flow is constant and the pair is
/// occlusion-free away from the frame border.
#[derive(Debug)]
pub struct SyntheticShiftProducer {
    rng: StdRng,
    batch_size: usize,
    height: usize,
    width: usize,
    shift_x: f32,
    shift_y: f32,
}

impl SyntheticShiftProducer {
    pub fn new(
        batch_size: usize,
        height: usize,
        width: usize,
        shift_x: f32,
        shift_y: f32,
        seed: Option<u64>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(FlowError::InvalidArgument(
                "batch size must be > 0".to_string(),
            ));
        }
        Ok(Self {
            rng: rng_from_optional(seed, "spiral-flow/synthetic_shift"),
            batch_size,
            height,
            width,
            shift_x,
            shift_y,
        })
    }

    fn sample(&mut self) -> Result<FlowSample> {
        // Low-frequency periodic pattern: smooth enough for the pyramid,
        // wrap-around so the shifted pair stays consistent.
        let phase_x: f32 = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let phase_y: f32 = self.rng.gen_range(0.0..std::f32::consts::TAU);
        let cycles: f32 = self.rng.gen_range(1.0..3.0);
        let pattern = |y: f32, x: f32, c: usize| -> f32 {
            let fx = std::f32::consts::TAU * cycles * x / self.width as f32 + phase_x;
            let fy = std::f32::consts::TAU * cycles * y / self.height as f32 + phase_y;
            let v = match c {
                0 => fx.sin() * fy.cos(),
                1 => (fx + fy).sin(),
                _ => fx.cos() * fy.sin(),
            };
            0.5 + 0.4 * v
        };
        let mut image1 = Field::zeros(self.height, self.width, 3);
        let mut image2 = Field::zeros(self.height, self.width, 3);
        for y in 0..self.height {
            for x in 0..self.width {
                for c in 0..3 {
                    image1.set(y, x, c, pattern(y as f32, x as f32, c));
                    image2.set(
                        y,
                        x,
                        c,
                        pattern(y as f32 - self.shift_y, x as f32 - self.shift_x, c),
                    );
                }
            }
        }
        let mut flow = Field::zeros(self.height, self.width, 2);
        for y in 0..self.height {
            for x in 0..self.width {
                flow.set(y, x, 0, self.shift_x);
                flow.set(y, x, 1, self.shift_y);
            }
        }
        FlowSample::new(image1, image2, flow)
    }
}

impl BatchProducer for SyntheticShiftProducer {
    fn next_batch(&mut self) -> Result<FlowBatch> {
        let samples = (0..self.batch_size)
            .map(|_| self.sample())
            .collect::<Result<Vec<_>>>()?;
        FlowBatch::new(samples)
    }
}
