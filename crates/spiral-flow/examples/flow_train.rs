//! Trains the smallest possible flow predictor on synthetic shifted pairs.
//!
//! The predictor holds one (u, v) bias per pyramid level, so the training
//! signal only has to discover the constant shift the producer applies.
//!
//! ```bash
//! cargo run --example flow_train
//! ```

use std::path::PathBuf;

use tracing::info;

use spiral_flow::config::{init_tracing, TrainConfig};
use spiral_flow::field::Field;
use spiral_flow::metrics::register_flow_descriptors;
use spiral_flow::{
    CpuWarp, FlowPredictor, MultiDeviceTrainer, Result, SyntheticShiftProducer,
    UnsupervisedFlowGraph,
};

/// One learnable (u, v) pair per pyramid level. The residual cancels the
/// upsampled initial guess, so each level's composed flow is exactly its
/// bias pair.
struct BiasPredictor;

impl FlowPredictor for BiasPredictor {
    fn parameter_len(&self) -> usize {
        10
    }

    fn predict(
        &self,
        params: &[f32],
        reference: &Field,
        _target: &Field,
        initial_flow: &Field,
        level: usize,
    ) -> Result<Field> {
        let u = params[2 * level];
        let v = params[2 * level + 1];
        let mut residual = Field::zeros(reference.height(), reference.width(), 2);
        for y in 0..residual.height() {
            for x in 0..residual.width() {
                residual.set(y, x, 0, u - initial_flow.at(y, x, 0));
                residual.set(y, x, 1, v - initial_flow.at(y, x, 1));
            }
        }
        Ok(residual)
    }
}

fn main() -> Result<()> {
    init_tracing();
    register_flow_descriptors();

    let config = TrainConfig {
        output_dir: PathBuf::from(format!("runs/flow-train-{}", std::process::id())),
        num_iterations: 200,
        batch_size: 4,
        learning_rate: 0.01,
        num_devices: 2,
        seed: Some(17),
        summary_interval: 20,
        validation_interval: 20,
        save_interval: 50,
    };

    let mut train = SyntheticShiftProducer::new(config.batch_size, 32, 32, 2.0, -1.0, config.seed)?;
    let mut eval = SyntheticShiftProducer::new(config.batch_size, 32, 32, 2.0, -1.0, Some(99))?;

    let graph = UnsupervisedFlowGraph::new(BiasPredictor, CpuWarp);
    let mut trainer = MultiDeviceTrainer::new(config, graph, vec![0.0; 10])?;
    trainer.set_visual_hook(Box::new(|step, frame| {
        info!(
            step,
            height = frame.predicted_flow.height(),
            width = frame.predicted_flow.width(),
            "visualization frame ready"
        );
    }));

    trainer.run(&mut train, &mut eval)?;
    info!(params = ?trainer.params(), "trained level biases");
    Ok(())
}
