//! End-to-end run of the training loop with a tiny trainable predictor:
//! the loss must drop, checkpoints must land in the output directory, and
//! the visualization hook must fire at the checkpoint cadence.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use spiral_flow::field::Field;
use spiral_flow::{
    BatchProducer, CpuWarp, FlowPredictor, MultiDeviceTrainer, Result, SyntheticShiftProducer,
    UnsupervisedFlowGraph,
};

use spiral_flow::config::TrainConfig;

/// Smallest useful predictor: one (u, v) bias pair per pyramid level. The
/// residual cancels the initial guess, so the composed flow at level `k` is
/// exactly the level's bias pair.
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

fn config_with_output(output_dir: PathBuf) -> TrainConfig {
    TrainConfig {
        output_dir,
        num_iterations: 4,
        batch_size: 2,
        learning_rate: 0.01,
        num_devices: 2,
        seed: Some(11),
        summary_interval: 3,
        validation_interval: 3,
        save_interval: 3,
    }
}

#[test]
fn run_writes_checkpoints_and_invokes_the_visual_hook() {
    let root = tempfile::tempdir().unwrap();
    let output_dir = root.path().join("run");
    let mut train = SyntheticShiftProducer::new(2, 32, 32, 2.0, 0.0, Some(7)).unwrap();
    let mut eval = SyntheticShiftProducer::new(2, 32, 32, 2.0, 0.0, Some(8)).unwrap();

    let graph = UnsupervisedFlowGraph::new(BiasPredictor, CpuWarp);
    let mut trainer =
        MultiDeviceTrainer::new(config_with_output(output_dir.clone()), graph, vec![0.0; 10])
            .unwrap();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&hook_calls);
    trainer.set_visual_hook(Box::new(move |step, frame| {
        assert_eq!(step % 3, 2);
        assert_eq!(frame.predicted_flow.channels(), 2);
        assert_eq!(frame.predicted_warp.height(), frame.reference.height());
        hook_counter.fetch_add(1, Ordering::SeqCst);
    }));

    trainer.run(&mut train, &mut eval).unwrap();

    // Steps run 0..=3; the interval phase fires once, at step 2.
    assert_eq!(trainer.step(), 4);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert!(output_dir.join("model2.json").is_file());
    assert!(trainer.params().iter().any(|p| *p != 0.0));
}

#[test]
fn visual_hook_evaluation_leaves_the_rolling_windows_alone() {
    let root = tempfile::tempdir().unwrap();
    let output_dir = root.path().join("run");
    let mut train = SyntheticShiftProducer::new(2, 32, 32, 2.0, 0.0, Some(31)).unwrap();
    let mut eval = SyntheticShiftProducer::new(2, 32, 32, 2.0, 0.0, Some(32)).unwrap();

    let graph = UnsupervisedFlowGraph::new(BiasPredictor, CpuWarp);
    let config = TrainConfig {
        // Validation never fires in four steps; only the hook evaluates.
        validation_interval: 50,
        ..config_with_output(output_dir)
    };
    let mut trainer = MultiDeviceTrainer::new(config, graph, vec![0.0; 10]).unwrap();

    let hook_calls = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&hook_calls);
    trainer.set_visual_hook(Box::new(move |_, _| {
        hook_counter.fetch_add(1, Ordering::SeqCst);
    }));
    trainer.run(&mut train, &mut eval).unwrap();
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);

    // The first real evaluation must see empty windows: its window mean is
    // exactly its own EPE.
    let report = trainer.eval_step(&eval.next_batch().unwrap()).unwrap();
    assert!((report.window_means[0] - report.epe).abs() < 1e-6);
}

#[test]
fn training_reduces_the_loss_on_a_constant_shift() {
    let mut producer = SyntheticShiftProducer::new(2, 32, 32, 2.0, 0.0, Some(23)).unwrap();
    let graph = UnsupervisedFlowGraph::new(BiasPredictor, CpuWarp);
    let config = TrainConfig {
        batch_size: 2,
        learning_rate: 0.01,
        num_devices: 1,
        ..TrainConfig::default()
    };
    let mut trainer = MultiDeviceTrainer::new(config, graph, vec![0.0; 10]).unwrap();

    let mut first_loss = None;
    let mut last_loss = 0.0;
    for _ in 0..12 {
        let batch = producer.next_batch().unwrap();
        let report = trainer.train_step(&batch).unwrap();
        first_loss.get_or_insert(report.losses.total);
        last_loss = report.losses.total;
    }
    let first_loss = first_loss.unwrap();
    assert!(
        last_loss < first_loss,
        "loss went from {first_loss} to {last_loss}"
    );
}

#[test]
fn restore_resumes_from_a_saved_checkpoint() {
    let root = tempfile::tempdir().unwrap();
    let path = spiral_flow::checkpoint::save(root.path(), 42, &[0.25; 10]).unwrap();

    let graph = UnsupervisedFlowGraph::new(BiasPredictor, CpuWarp);
    let config = TrainConfig {
        batch_size: 2,
        num_devices: 1,
        ..TrainConfig::default()
    };
    let mut trainer = MultiDeviceTrainer::new(config, graph, vec![0.0; 10]).unwrap();
    trainer.restore(&path).unwrap();

    assert_eq!(trainer.step(), 42);
    assert!(trainer.params().iter().all(|p| (*p - 0.25).abs() < 1e-9));
}
