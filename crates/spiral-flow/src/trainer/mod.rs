//! Synchronous, lock-step multi-device training.
//!
//! Every step fans the batch out across device replicas that share one
//! read-only parameter snapshot, fans their gradients back in, averages
//! them, and applies exactly one optimizer update. Checkpointing and
//! evaluation run at fixed step intervals off the gradient path.

mod graph;
mod optim;
mod sync;

pub use graph::{EvalOutput, LossGraph, StepLosses, StepOutput, UnsupervisedFlowGraph, VisualFrame};
pub use optim::Adam;
pub use sync::{average_gradients, check_finite};

use std::path::Path;

use tracing::{debug, info};

use crate::checkpoint;
use crate::config::TrainConfig;
use crate::dataset::{BatchProducer, FlowBatch, FlowSample};
use crate::metrics::{MetricUnit, MetricValue, RollingMean};
use crate::{FlowError, Result};

/// Step offset at which periodic work fires (`step % interval == 2`), so
/// the first summary lands after the optimizer state has warmed up.
const INTERVAL_PHASE: u64 = 2;

/// Outcome of one synchronized training step.
#[derive(Debug, Clone, Copy)]
pub struct TrainReport {
    pub step: u64,
    pub losses: StepLosses,
}

impl TrainReport {
    /// Gauge values for the telemetry layer.
    pub fn to_values(&self) -> [MetricValue; 2] {
        [
            MetricValue {
                name: "flow.train.loss",
                value: self.losses.total,
                unit: MetricUnit::Scalar,
            },
            MetricValue {
                name: "flow.train.steps",
                value: self.step as f32 + 1.0,
                unit: MetricUnit::Count,
            },
        ]
    }
}

/// Outcome of one evaluation step, including the rolling-window means
/// (index 0 = full resolution, 1..=4 = pyramid levels).
#[derive(Debug, Clone)]
pub struct EvalReport {
    pub epe: f32,
    pub epe_levels: [f32; 4],
    pub window_means: [f32; 5],
    pub visual: VisualFrame,
}

impl EvalReport {
    pub fn to_values(&self) -> [MetricValue; 2] {
        [
            MetricValue {
                name: "flow.eval.epe",
                value: self.epe,
                unit: MetricUnit::Scalar,
            },
            MetricValue {
                name: "flow.eval.epe_window",
                value: self.window_means[0],
                unit: MetricUnit::Scalar,
            },
        ]
    }
}

/// Callback receiving the evaluation visualization tensors.
pub type VisualHook = Box<dyn FnMut(u64, &VisualFrame) + Send>;

/// Prefixes per-step failures with the step they aborted.
fn tag_step(step: u64, err: FlowError) -> FlowError {
    match err {
        FlowError::Shape(message) => FlowError::Shape(format!("step {step}: {message}")),
        FlowError::Resource(message) => FlowError::Resource(format!("step {step}: {message}")),
        FlowError::NonFinite(message) => FlowError::NonFinite(format!("step {step}: {message}")),
        FlowError::InvalidArgument(message) => {
            FlowError::InvalidArgument(format!("step {step}: {message}"))
        }
        other => other,
    }
}

/// Replicates a [`LossGraph`] across devices and keeps the single
/// source-of-truth parameter vector.
pub struct MultiDeviceTrainer<G: LossGraph> {
    config: TrainConfig,
    graph: G,
    params: Vec<f32>,
    optimizer: Adam,
    step: u64,
    epe_windows: [RollingMean; 5],
    visual_hook: Option<VisualHook>,
}

impl<G: LossGraph> MultiDeviceTrainer<G> {
    pub fn new(config: TrainConfig, graph: G, initial_params: Vec<f32>) -> Result<Self> {
        config.validate()?;
        if initial_params.len() != graph.parameter_len() {
            return Err(FlowError::Shape(format!(
                "graph expects {} parameters, got {}",
                graph.parameter_len(),
                initial_params.len()
            )));
        }
        let optimizer = Adam::new(config.learning_rate, initial_params.len());
        Ok(Self {
            config,
            graph,
            params: initial_params,
            optimizer,
            step: 0,
            epe_windows: std::array::from_fn(|_| RollingMean::default()),
            visual_hook: None,
        })
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn graph(&self) -> &G {
        &self.graph
    }

    /// Registers a callback invoked with the evaluation tensors at every
    /// checkpoint interval.
    pub fn set_visual_hook(&mut self, hook: VisualHook) {
        self.visual_hook = Some(hook);
    }

    /// Restores parameters and step counter from a checkpoint. Optimizer
    /// moments restart cold.
    pub fn restore(&mut self, path: &Path) -> Result<()> {
        let (step, params) = checkpoint::load(path)?;
        if params.len() != self.params.len() {
            return Err(FlowError::Shape(format!(
                "checkpoint holds {} parameters, trainer expects {}",
                params.len(),
                self.params.len()
            )));
        }
        self.params = params;
        self.step = step;
        self.optimizer = Adam::new(self.config.learning_rate, self.params.len());
        Ok(())
    }

    /// Runs each shard's replica on its own thread against the shared
    /// parameter snapshot and collects the outputs in rank order.
    fn fan_out(&self, shards: &[&[FlowSample]]) -> Result<Vec<StepOutput>> {
        if shards.len() == 1 {
            return Ok(vec![self.graph.gradients(&self.params, shards[0])?]);
        }
        let graph = &self.graph;
        let params = &self.params;
        let joined: Vec<Result<StepOutput>> = std::thread::scope(|scope| {
            let handles: Vec<_> = shards
                .iter()
                .map(|shard| scope.spawn(move || graph.gradients(params, shard)))
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(FlowError::Resource("device replica panicked".to_string()))
                    })
                })
                .collect()
        });
        // Any replica failure aborts the whole step; there is no partial apply.
        joined.into_iter().collect()
    }

    /// One synchronized training step over the full batch.
    pub fn train_step(&mut self, batch: &FlowBatch) -> Result<TrainReport> {
        let step = self.step;
        let shards = batch
            .shards(self.config.num_devices)
            .map_err(|err| tag_step(step, err))?;
        let outputs = self.fan_out(&shards).map_err(|err| tag_step(step, err))?;

        let mut tower_losses = Vec::with_capacity(outputs.len());
        let mut tower_gradients = Vec::with_capacity(outputs.len());
        for output in outputs {
            tower_losses.push(output.losses);
            tower_gradients.push(output.gradients);
        }

        let averaged = average_gradients(&tower_gradients).map_err(|err| tag_step(step, err))?;
        check_finite("averaged gradient", &averaged).map_err(|err| tag_step(step, err))?;
        let losses = StepLosses::mean_of(&tower_losses);
        if !losses.total.is_finite() {
            return Err(FlowError::NonFinite(format!(
                "step {step}: combined loss is not finite"
            )));
        }

        self.optimizer.step(&mut self.params, &averaged)?;
        self.step += 1;
        debug!(step, loss = losses.total, "applied synchronized update");
        Ok(TrainReport { step, losses })
    }

    /// One evaluation pass; feeds the rolling EPE windows.
    pub fn eval_step(&mut self, batch: &FlowBatch) -> Result<EvalReport> {
        let output = self.graph.evaluate(&self.params, batch.samples())?;
        self.epe_windows[0].push(output.epe);
        for (window, value) in self.epe_windows[1..].iter_mut().zip(output.epe_levels) {
            window.push(value);
        }
        let window_means = std::array::from_fn(|i| self.epe_windows[i].mean());
        Ok(EvalReport {
            epe: output.epe,
            epe_levels: output.epe_levels,
            window_means,
            visual: output.visual,
        })
    }

    /// Full training loop: batches from `train`, periodic evaluation and
    /// checkpointing driven by the configured intervals. Fails fast on
    /// configuration problems before any device work begins.
    pub fn run(
        &mut self,
        train: &mut dyn BatchProducer,
        eval: &mut dyn BatchProducer,
    ) -> Result<()> {
        self.config.prepare_output_dir()?;
        info!(
            iterations = self.config.num_iterations,
            devices = self.config.num_devices,
            batch = self.config.batch_size,
            "starting flow training"
        );
        for _ in 0..self.config.num_iterations {
            let batch = train.next_batch()?;
            let report = self.train_step(&batch)?;
            let step = report.step;

            if step % self.config.summary_interval == INTERVAL_PHASE {
                info!(step, loss = report.losses.total, "summary");
            }

            if step % self.config.validation_interval == INTERVAL_PHASE {
                let eval_batch = eval.next_batch()?;
                let eval_report = self.eval_step(&eval_batch)?;
                info!(
                    step,
                    epe = eval_report.epe,
                    epe_window = eval_report.window_means[0],
                    "validation"
                );
            }

            if step % self.config.save_interval == INTERVAL_PHASE {
                let path = checkpoint::save(&self.config.output_dir, step, &self.params)?;
                info!(step, path = %path.display(), "saved checkpoint");
                if self.visual_hook.is_some() {
                    // Tensors for the hook only; the rolling windows are fed
                    // exclusively on the validation cadence.
                    let eval_batch = eval.next_batch()?;
                    let output = self.graph.evaluate(&self.params, eval_batch.samples())?;
                    if let Some(hook) = self.visual_hook.as_mut() {
                        hook(step, &output.visual);
                    }
                }
            }
        }
        Ok(())
    }
}
