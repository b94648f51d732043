//! End-point-error metrics, the rolling validation window and the metric
//! descriptor registry published to the telemetry layer.

use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::sync::RwLock;

use crate::field::Field;
use crate::{FlowError, Result};

/// Capacity of the rolling validation window, in evaluation samples.
pub const EVAL_WINDOW: usize = 386;

/// Mean Euclidean distance between two flow fields, over pixels.
pub fn end_point_error(truth: &Field, pred: &Field) -> Result<f32> {
    if !truth.same_shape(pred) {
        return Err(FlowError::Shape(format!(
            "EPE inputs disagree: {:?} vs {:?}",
            truth.shape(),
            pred.shape()
        )));
    }
    if truth.channels() != 2 {
        return Err(FlowError::Shape(format!(
            "EPE expects 2-channel flow, got {}",
            truth.channels()
        )));
    }
    let mut sum = 0.0f32;
    for y in 0..truth.height() {
        for x in 0..truth.width() {
            let du = truth.at(y, x, 0) - pred.at(y, x, 0);
            let dv = truth.at(y, x, 1) - pred.at(y, x, 1);
            sum += (du * du + dv * dv).sqrt();
        }
    }
    Ok(sum / (truth.height() * truth.width()) as f32)
}

/// Fixed-length FIFO of recent metric readings, reported as their mean.
///
/// The newest value is appended and the oldest evicted once the queue
/// length reaches the capacity, which smooths a noisy single-batch metric
/// without unbounded growth. Keep the push-then-evict order; downstream
/// window means depend on it.
#[derive(Debug, Clone)]
pub struct RollingMean {
    values: VecDeque<f32>,
    capacity: usize,
}

impl RollingMean {
    pub fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, value: f32) {
        self.values.push_back(value);
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }
}

impl Default for RollingMean {
    fn default() -> Self {
        Self::new(EVAL_WINDOW)
    }
}

/// Units associated with a metric descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricUnit {
    /// Dimensionless scalar value (losses, EPE, ratios).
    Scalar,
    /// Raw count of steps or batches.
    Count,
}

/// Descriptor describing a metric emitted by the trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricDescriptor {
    pub name: &'static str,
    pub unit: MetricUnit,
    pub description: &'static str,
}

/// Gauge value paired with a descriptor name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricValue {
    pub name: &'static str,
    pub value: f32,
    pub unit: MetricUnit,
}

static REGISTRY: Lazy<RwLock<Vec<MetricDescriptor>>> = Lazy::new(|| RwLock::new(Vec::new()));

/// Registers a collection of metric descriptors, ignoring duplicates.
pub fn register_descriptors(descriptors: &[MetricDescriptor]) {
    let mut registry = REGISTRY
        .write()
        .expect("metric registry write lock should not be poisoned");
    for descriptor in descriptors {
        if registry
            .iter()
            .all(|existing| existing.name != descriptor.name)
        {
            registry.push(*descriptor);
        }
    }
}

/// Returns the list of descriptors registered so far.
pub fn descriptors() -> Vec<MetricDescriptor> {
    REGISTRY
        .read()
        .expect("metric registry read lock should not be poisoned")
        .clone()
}

/// Canonical descriptors exposed by the flow trainer.
pub const FLOW_DESCRIPTORS: &[MetricDescriptor] = &[
    MetricDescriptor {
        name: "flow.train.loss",
        unit: MetricUnit::Scalar,
        description: "Combined training loss for the step.",
    },
    MetricDescriptor {
        name: "flow.train.steps",
        unit: MetricUnit::Count,
        description: "Training steps applied so far.",
    },
    MetricDescriptor {
        name: "flow.eval.epe",
        unit: MetricUnit::Scalar,
        description: "Full-resolution end-point error of the last evaluation batch.",
    },
    MetricDescriptor {
        name: "flow.eval.epe_window",
        unit: MetricUnit::Scalar,
        description: "Rolling-window mean of the full-resolution end-point error.",
    },
];

/// Convenience wrapper that registers the built-in flow descriptors.
pub fn register_flow_descriptors() {
    register_descriptors(FLOW_DESCRIPTORS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epe_of_identical_flows_is_zero() {
        let flow = Field::filled(4, 4, 2, 1.25);
        assert_eq!(end_point_error(&flow, &flow).unwrap(), 0.0);
    }

    #[test]
    fn epe_matches_euclidean_distance() {
        let a = Field::zeros(1, 1, 2);
        let b = Field::new(1, 1, 2, vec![3.0, 4.0]).unwrap();
        assert!((end_point_error(&a, &b).unwrap() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn rolling_window_evicts_the_oldest() {
        let mut window = RollingMean::new(4);
        for value in [10.0, 1.0, 1.0] {
            window.push(value);
        }
        assert_eq!(window.len(), 3);
        // Fourth push reaches the capacity and evicts the first value.
        window.push(1.0);
        assert_eq!(window.len(), 3);
        assert!((window.mean() - 1.0).abs() < 1e-6);
        window.push(1.0);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn default_window_evicts_on_the_386th_push() {
        let mut window = RollingMean::default();
        for value in 0..EVAL_WINDOW - 1 {
            window.push(value as f32);
        }
        assert_eq!(window.len(), EVAL_WINDOW - 1);
        // Reaching the capacity drops the oldest reading (value 0).
        window.push((EVAL_WINDOW - 1) as f32);
        assert_eq!(window.len(), EVAL_WINDOW - 1);
        let expected = (1..EVAL_WINDOW).map(|v| v as f32).sum::<f32>() / (EVAL_WINDOW - 1) as f32;
        assert!((window.mean() - expected).abs() < 1e-3);
        // The length is stable from here on.
        window.push(EVAL_WINDOW as f32);
        assert_eq!(window.len(), EVAL_WINDOW - 1);
    }

    #[test]
    fn registering_descriptors_is_idempotent() {
        register_flow_descriptors();
        register_flow_descriptors();
        let registered = descriptors();
        assert!(registered.len() >= FLOW_DESCRIPTORS.len());
        assert!(registered
            .iter()
            .any(|descriptor| descriptor.name == "flow.train.loss"));
    }
}
