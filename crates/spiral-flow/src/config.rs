//! Run configuration, tracing setup and deterministic seeding.

use std::collections::hash_map::DefaultHasher;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use rand::{rngs::StdRng, SeedableRng};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::{FlowError, Result};

/// Training-run configuration. Loadable from JSON; every field has the
/// reference default so partial configs stay valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Directory for checkpoints and summaries. Must be set and must not
    /// already exist; checked before any device work begins.
    pub output_dir: PathBuf,
    /// Number of training iterations.
    pub num_iterations: u64,
    /// Total batch size, sharded evenly across devices.
    pub batch_size: usize,
    /// Base learning rate of the Adam update.
    pub learning_rate: f32,
    /// Number of device replicas per step.
    pub num_devices: usize,
    /// Optional base seed; `None` seeds from the operating system.
    pub seed: Option<u64>,
    /// How often to emit a training summary.
    pub summary_interval: u64,
    /// How often to run a validation batch and feed the rolling windows.
    pub validation_interval: u64,
    /// How often to save a parameter checkpoint.
    pub save_interval: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::new(),
            num_iterations: 100_000,
            batch_size: 32,
            learning_rate: 0.001,
            num_devices: 1,
            seed: None,
            summary_interval: 20,
            validation_interval: 200,
            save_interval: 500,
        }
    }
}

impl TrainConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        let config: TrainConfig = serde_json::from_str(&raw)
            .map_err(|err| FlowError::Serialization(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks that must pass before any device work begins.
    pub fn validate(&self) -> Result<()> {
        if self.num_devices == 0 {
            return Err(FlowError::Config("device count must be > 0".to_string()));
        }
        if self.batch_size == 0 || self.batch_size % self.num_devices != 0 {
            return Err(FlowError::Config(format!(
                "batch size {} must be a positive multiple of the device count {}",
                self.batch_size, self.num_devices
            )));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(FlowError::Config(format!(
                "learning rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if self.summary_interval == 0 || self.validation_interval == 0 || self.save_interval == 0 {
            return Err(FlowError::Config(
                "summary, validation and save intervals must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Creates the output directory, failing fatally when it is unset or
    /// already exists.
    pub fn prepare_output_dir(&self) -> Result<()> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(FlowError::Config(
                "output directory must be specified".to_string(),
            ));
        }
        if self.output_dir.exists() {
            return Err(FlowError::Config(format!(
                "output directory {} already exists",
                self.output_dir.display()
            )));
        }
        fs::create_dir_all(&self.output_dir)?;
        Ok(())
    }
}

static TRACING: OnceLock<()> = OnceLock::new();

/// Configures the global tracing subscriber once; later calls are no-ops.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
        Registry::default().with(filter).with(fmt_layer).init();
    });
}

/// Derives a per-component seed from a base seed and a label.
pub fn derive_seed(base: u64, label: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    base.hash(&mut hasher);
    label.hash(&mut hasher);
    hasher.finish()
}

/// RNG for a component: explicit seed when provided, OS entropy otherwise.
pub fn rng_from_optional(seed: Option<u64>, label: &str) -> StdRng {
    match seed {
        Some(base) => StdRng::seed_from_u64(derive_seed(base, label)),
        None => StdRng::from_entropy(),
    }
}
