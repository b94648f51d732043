// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Step-tagged JSON parameter checkpoints.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{FlowError, Result};

/// Newest checkpoints retained after pruning.
pub const MAX_CHECKPOINTS: usize = 5;

const CHECKPOINT_PREFIX: &str = "model";
const CHECKPOINT_SUFFIX: &str = ".json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParameterSnapshot {
    step: u64,
    parameters: Vec<f32>,
}

fn serde_error(err: impl ToString) -> FlowError {
    FlowError::Serialization(err.to_string())
}

/// Writes `model{step}.json` into `dir` and prunes old checkpoints, keeping
/// the newest [`MAX_CHECKPOINTS`].
pub fn save(dir: &Path, step: u64, parameters: &[f32]) -> Result<PathBuf> {
    let snapshot = ParameterSnapshot {
        step,
        parameters: parameters.to_vec(),
    };
    let path = dir.join(format!("{CHECKPOINT_PREFIX}{step}{CHECKPOINT_SUFFIX}"));
    let file = File::create(&path)?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, &snapshot).map_err(serde_error)?;
    prune(dir)?;
    Ok(path)
}

/// Reads a checkpoint back as `(step, parameters)`.
pub fn load(path: &Path) -> Result<(u64, Vec<f32>)> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let snapshot: ParameterSnapshot = serde_json::from_reader(reader).map_err(serde_error)?;
    Ok((snapshot.step, snapshot.parameters))
}

fn checkpoint_step(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let digits = name
        .strip_prefix(CHECKPOINT_PREFIX)?
        .strip_suffix(CHECKPOINT_SUFFIX)?;
    digits.parse().ok()
}

fn prune(dir: &Path) -> Result<()> {
    let mut checkpoints: Vec<(u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(step) = checkpoint_step(&path) {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);
    while checkpoints.len() > MAX_CHECKPOINTS {
        let (_, path) = checkpoints.remove(0);
        fs::remove_file(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let params = vec![0.25f32, -1.5, 3.0];
        let path = save(dir.path(), 42, &params).unwrap();
        let (step, restored) = load(&path).unwrap();
        assert_eq!(step, 42);
        assert_eq!(restored, params);
    }

    #[test]
    fn pruning_keeps_the_newest_five() {
        let dir = tempfile::tempdir().unwrap();
        for step in 0..8u64 {
            save(dir.path(), step * 500, &[step as f32]).unwrap();
        }
        let mut steps: Vec<u64> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| checkpoint_step(&entry.unwrap().path()))
            .collect();
        steps.sort_unstable();
        assert_eq!(steps, vec![1500, 2000, 2500, 3000, 3500]);
    }
}
