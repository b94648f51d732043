//! Unsupervised optical-flow training for SpiralTorch-style pipelines.
//!
//! The crate trains a coarse-to-fine flow estimator from unlabeled image
//! pairs: image pyramids feed an injected [`warp::FlowPredictor`], the
//! composed forward flow drives an occlusion-masked photometric loss, and a
//! multi-device trainer averages per-replica gradients into one synchronized
//! parameter update. The per-level prediction network and the resampling
//! kernels are collaborators behind traits; deterministic CPU references
//! ship with the crate so the whole pipeline is testable end to end.

pub mod checkpoint;
pub mod compose;
pub mod config;
pub mod dataset;
pub mod field;
pub mod loss;
pub mod metrics;
pub mod pyramid;
pub mod trainer;
pub mod warp;

use thiserror::Error;

/// Errors surfaced by the flow-training pipeline.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Raised when tensors disagree on resolution, channel count or batch size.
    #[error("shape mismatch: {0}")]
    Shape(String),
    /// Raised before any device work begins when the run configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Raised when a device replica cannot be constructed or joined.
    #[error("device resource error: {0}")]
    Resource(String),
    /// Raised when a loss or gradient stops being finite; aborts the step.
    #[error("non-finite value: {0}")]
    NonFinite(String),
    /// Raised when an invalid parameter (scale, interval, etc.) is provided.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Raised when checkpoint or summary IO fails.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// Raised when a checkpoint cannot be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, FlowError>;

pub use compose::{compose_flow, occlusion_mask, FlowStack, FLOW_SCALE};
pub use dataset::{BatchProducer, FlowBatch, FlowSample, SyntheticShiftProducer};
pub use field::Field;
pub use pyramid::ImagePyramid;
pub use trainer::{LossGraph, MultiDeviceTrainer, UnsupervisedFlowGraph};
pub use warp::{CpuWarp, FlowPredictor, WarpOps};
